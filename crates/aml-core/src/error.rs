//! Error types for AML Core.

use thiserror::Error;

use crate::config::ConfigError;
use crate::memory::MemoryError;
use crate::security::SecurityError;

/// Top-level error type for AML operations.
#[derive(Error, Debug)]
pub enum AmlError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Memory store errors
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Encryption errors
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for AML operations.
pub type Result<T> = std::result::Result<T, AmlError>;
