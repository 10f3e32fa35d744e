//! Memory system error types.

use std::io;

use crate::security::SecurityError;

/// Failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or inconsistent configuration.
    Configuration,
    /// Caller passed an unusable name or a record owned by another agent.
    InvalidInput,
    /// HMAC check failed or the stored envelope is damaged.
    Integrity,
    /// AEAD decryption failed.
    Decryption,
    /// No usable master key.
    KeyUnavailable,
    /// Record, agent or backup missing.
    NotFound,
    /// Record id already present.
    Duplicate,
    /// Size cap would be exceeded.
    Capacity,
    /// Filesystem or serialization failure.
    Io,
}

impl ErrorKind {
    /// Short lowercase name used in audit entries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidInput => "invalid_input",
            Self::Integrity => "integrity",
            Self::Decryption => "decryption",
            Self::KeyUnavailable => "key_unavailable",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::Capacity => "capacity",
            Self::Io => "io",
        }
    }
}

/// Memory system errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// I/O error during memory operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record, agent or backup not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same id already exists in the collection.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Writing would push the store over its configured size cap.
    #[error("capacity exceeded: {used} of {limit} bytes in use")]
    Capacity {
        /// Bytes the store would occupy after the write.
        used: u64,
        /// Configured cap in bytes.
        limit: u64,
    },

    /// Agent name is empty, reserved or escapes the store root.
    #[error("invalid agent name: {0}")]
    InvalidAgentName(String),

    /// Record's `agent` field names a different agent than the target.
    #[error("record {id} belongs to {owner}, not {agent}")]
    WrongOwner {
        /// Record id.
        id: String,
        /// Agent named by the record.
        owner: String,
        /// Agent the operation targeted.
        agent: String,
    },

    /// Store configuration cannot be honoured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Per-agent write lock was poisoned.
    #[error("memory lock poisoned")]
    LockPoisoned,

    /// Encryption layer failure.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backup archive is unreadable or its checksums do not match.
    #[error("backup corrupted: {0}")]
    BackupCorrupted(String),
}

impl MemoryError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::InvalidAgentName(_) | Self::WrongOwner { .. } => ErrorKind::InvalidInput,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Security(err) => match err {
                SecurityError::Integrity | SecurityError::MalformedEnvelope(_) => {
                    ErrorKind::Integrity
                }
                SecurityError::Decryption(_) | SecurityError::UnsupportedEnvelope(_) => {
                    ErrorKind::Decryption
                }
                SecurityError::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
                _ => ErrorKind::Io,
            },
            Self::Io(_)
            | Self::LockPoisoned
            | Self::Serialization(_)
            | Self::BackupCorrupted(_) => ErrorKind::Io,
        }
    }
}

/// Result type for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
