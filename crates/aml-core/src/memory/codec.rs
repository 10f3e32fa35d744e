//! On-disk encoding of memory files.
//!
//! Plain stores write compact JSON. Encrypted stores serialize the value,
//! seal it with the engine and write the envelope as JSON. The envelope
//! context names the owner of the file, so a file copied into another
//! agent's directory is rejected.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use super::error::Result;
use crate::security::{EncryptionEngine, SecurityError, StoredEnvelope};

/// Encoder for collection, global and metrics files.
#[derive(Debug, Clone)]
pub(crate) struct Codec {
    engine: Option<Arc<EncryptionEngine>>,
}

impl Codec {
    pub(crate) fn plain() -> Self {
        Self { engine: None }
    }

    pub(crate) fn encrypted(engine: Arc<EncryptionEngine>) -> Self {
        Self { engine: Some(engine) }
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.engine.is_some()
    }

    pub(crate) fn encode<T: Serialize + ?Sized>(&self, value: &T, context: &str) -> Result<Vec<u8>> {
        match self.engine {
            None => Ok(serde_json::to_vec(value)?),
            Some(ref engine) => {
                let envelope = engine.encrypt_object(value, Some(context))?;
                Ok(serde_json::to_vec(&envelope)?)
            }
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, bytes: &[u8], context: &str) -> Result<T> {
        let Some(ref engine) = self.engine else {
            return Ok(serde_json::from_slice(bytes)?);
        };

        let text = std::str::from_utf8(bytes)
            .map_err(|_| SecurityError::MalformedEnvelope("file is not UTF-8".to_string()))?;
        let envelope = StoredEnvelope::from_json(text)?;

        if let StoredEnvelope::Current(ref current) = envelope {
            if current.context.as_deref() != Some(context) {
                return Err(SecurityError::Integrity.into());
            }
        }

        let plaintext = Zeroizing::new(engine.decrypt_stored(&envelope)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
