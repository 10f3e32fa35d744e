//! Error types for encryption operations.
//!
//! Messages name the failed check only. Plaintext, derived keys and the
//! master key never appear in an error, even when an input is corrupted.

use thiserror::Error;

/// Encryption-related errors.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// HMAC over the envelope did not match.
    #[error("Integrity verification failed")]
    Integrity,

    /// AEAD decryption failed (auth tag, IV or ciphertext rejected).
    #[error("Decryption failed: {0}")]
    Decryption(&'static str),

    /// Encryption failed inside the cipher.
    #[error("Encryption failed: {0}")]
    Encryption(&'static str),

    /// No master key is loaded (never initialized or explicitly cleared).
    #[error("Master key unavailable: {0}")]
    KeyUnavailable(&'static str),

    /// Envelope fields are missing, mis-sized or not valid base64.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope format or algorithm this engine cannot process.
    #[error("Unsupported envelope: {0}")]
    UnsupportedEnvelope(String),

    /// Lock guarding key state was poisoned by a panicking thread.
    #[error("Key state lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error occurred during audit log operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    /// Returns true for failures caused by tampered or corrupted ciphertext.
    ///
    /// These are never worth retrying.
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::Integrity | Self::Decryption(_))
    }
}

/// Result type alias for security operations.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;
