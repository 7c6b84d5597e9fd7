//! In-memory template store.

use crate::error::DeployError;
use crate::store::TemplateStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names saved so far, ascending.
    pub fn file_names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn save(&self, file_name: &str, body: &str) -> Result<(), DeployError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_name.to_string(), body.to_string());
        Ok(())
    }

    async fn load(&self, file_name: &str) -> Result<Option<String>, DeployError> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_name)
            .cloned())
    }
}
