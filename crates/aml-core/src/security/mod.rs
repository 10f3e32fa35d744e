//! Security module for at-rest encryption and audit logging.
//!
//! This module provides:
//! - Authenticated encryption envelopes with an independent HMAC layer
//! - Context-scoped key derivation with a per-engine cache
//! - Master key rotation and explicit clearing
//! - Append-only audit logging of memory operations

mod audit;
mod engine;
mod envelope;
mod error;
mod key_cache;
mod master_key;

pub use audit::{AuditEntry, AuditFilter, AuditLogger, AuditOperation};
pub use engine::EncryptionEngine;
pub use envelope::{
    ALGORITHM, ENVELOPE_VERSION, EncryptedEnvelope, HMAC_LENGTH, IV_LENGTH, KDF, KDF_ITERATIONS,
    LegacyEnvelope, SALT_LENGTH, StoredEnvelope, TAG_LENGTH,
};
pub use error::{SecurityError, SecurityResult};
pub use master_key::{MASTER_KEY_LENGTH, MasterKey};
