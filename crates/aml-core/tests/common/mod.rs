//! Shared helpers for AML Core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use aml_core::config::StorageConfig;
use aml_core::memory::{MemoryStore, Pattern};
use aml_core::security::EncryptionEngine;
use serde_json::json;
use tempfile::TempDir;

/// Opens an unencrypted store in a fresh temporary directory.
pub fn plain_store() -> (TempDir, MemoryStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = MemoryStore::open(StorageConfig::at(temp_dir.path().join("memory")), None).unwrap();
    (temp_dir, store)
}

/// Opens an encrypted store in a fresh temporary directory.
pub fn encrypted_store() -> (TempDir, MemoryStore, Arc<EncryptionEngine>) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Arc::new(EncryptionEngine::generate());
    let config = StorageConfig::at(temp_dir.path().join("memory")).with_encryption(true);
    let store = MemoryStore::open(config, Some(Arc::clone(&engine))).unwrap();
    (temp_dir, store, engine)
}

/// A pattern with a small, recognizable body.
pub fn sample_pattern(id: &str, agent: &str) -> Pattern {
    Pattern::new(
        id,
        agent,
        json!({
            "type": "component-structure",
            "description": format!("pattern {id}"),
            "steps": ["extract props", "memoize", "test"],
        }),
    )
}
