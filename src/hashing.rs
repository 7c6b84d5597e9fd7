//! Content hashes for deployment artifacts.
//!
//! The same digest is computed over local bytes and stored as object
//! metadata on upload, so the two sides can be compared later without
//! downloading anything.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

/// Object metadata attribute holding the content hash.
pub const HASH_METADATA_KEY: &str = "filesha256";

/// SHA-256 over raw bytes, base64 encoded.
pub fn sha256_base64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// SHA-256 over raw bytes, lowercase hex. Used for content-addressed keys.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
