//! Local persistence of issued templates.
//!
//! - [`TemplateStore`] trait: where create/update templates are written
//!   before the control-plane call that uses them
//! - [`FileTemplateStore`]: files under the packaging directory
//! - [`MemoryTemplateStore`]: in-memory, for tests and demos

mod memory;
mod template;

#[cfg(feature = "file-storage")]
pub mod file_backed;

pub use memory::MemoryTemplateStore;
pub use template::TemplateStore;

#[cfg(feature = "file-storage")]
pub use file_backed::FileTemplateStore;
