//! Envelope wire format for encrypted data at rest.
//!
//! Envelopes serialize to JSON with binary fields base64 encoded:
//!
//! ```json
//! {
//!   "version": 2,
//!   "algorithm": "aes-256-gcm",
//!   "kdf": "pbkdf2-sha256",
//!   "kdf_iterations": 100000,
//!   "salt": "...", "iv": "...", "ciphertext": "...",
//!   "authTag": "...", "hmac": "...",
//!   "context": "frontend-developer",
//!   "timestamp": "2026-10-16T09:30:00Z"
//! }
//! ```

use serde::{Deserialize, Serialize};

use super::error::{SecurityError, SecurityResult};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 2;

/// Authenticated cipher identifier.
pub const ALGORITHM: &str = "aes-256-gcm";

/// Key-derivation identifier.
pub const KDF: &str = "pbkdf2-sha256";

/// PBKDF2 iterations for version 2 envelopes.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_LENGTH: usize = 32;

/// Nonce length for AES-GCM.
pub const IV_LENGTH: usize = 12;

/// AES-GCM tag length.
pub const TAG_LENGTH: usize = 16;

/// HMAC-SHA256 output length.
pub const HMAC_LENGTH: usize = 32;

/// Encrypted payload with everything needed to verify and decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Envelope format version.
    pub version: u32,
    /// Cipher identifier.
    pub algorithm: String,
    /// Key-derivation identifier.
    pub kdf: String,
    /// PBKDF2 work factor.
    pub kdf_iterations: u32,
    /// Per-encryption salt.
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// Per-encryption nonce.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// Cipher output without the tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// AES-GCM authentication tag.
    #[serde(rename = "authTag", with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Keyed integrity tag over the whole envelope.
    #[serde(with = "base64_bytes")]
    pub hmac: Vec<u8>,
    /// Key-derivation namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Creation time (informational only).
    pub timestamp: String,
}

impl EncryptedEnvelope {
    /// Bytes covered by the envelope HMAC.
    ///
    /// Each field is length-prefixed so that moving bytes between adjacent
    /// fields changes the input.
    pub(crate) fn authenticated_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            64 + self.salt.len() + self.iv.len() + self.ciphertext.len() + self.auth_tag.len(),
        );
        out.extend_from_slice(&self.version.to_be_bytes());
        push_field(&mut out, self.algorithm.as_bytes());
        push_field(&mut out, &self.salt);
        push_field(&mut out, &self.iv);
        push_field(&mut out, &self.ciphertext);
        push_field(&mut out, &self.auth_tag);
        match &self.context {
            Some(context) => {
                out.push(1);
                push_field(&mut out, context.as_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Checks identifiers and field sizes before any key material is touched.
    pub(crate) fn validate(&self) -> SecurityResult<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(SecurityError::UnsupportedEnvelope(format!(
                "version {} (expected {})",
                self.version, ENVELOPE_VERSION
            )));
        }
        if self.algorithm != ALGORITHM {
            return Err(SecurityError::UnsupportedEnvelope(format!(
                "algorithm {}",
                self.algorithm
            )));
        }
        if self.kdf != KDF || self.kdf_iterations != KDF_ITERATIONS {
            return Err(SecurityError::UnsupportedEnvelope(format!(
                "kdf {} with {} iterations",
                self.kdf, self.kdf_iterations
            )));
        }
        check_len("salt", &self.salt, SALT_LENGTH)?;
        check_len("iv", &self.iv, IV_LENGTH)?;
        check_len("authTag", &self.auth_tag, TAG_LENGTH)?;
        check_len("hmac", &self.hmac, HMAC_LENGTH)?;
        Ok(())
    }
}

/// Pre-integrity envelope: no salt, no HMAC, no KDF metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEnvelope {
    /// Cipher identifier.
    #[serde(default = "default_legacy_algorithm")]
    pub algorithm: String,
    /// Nonce.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// Cipher output without the tag.
    #[serde(alias = "encrypted", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// AES-GCM authentication tag.
    #[serde(rename = "authTag", with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Creation time, when present.
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_legacy_algorithm() -> String {
    ALGORITHM.to_string()
}

/// Any envelope this crate can recognize on disk.
///
/// The format is picked by field presence: an object with none of `salt`,
/// `hmac` or `kdf` is legacy, anything else must parse as a current envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StoredEnvelope {
    /// Version 2 envelope.
    Current(EncryptedEnvelope),
    /// Pre-integrity envelope.
    Legacy(LegacyEnvelope),
}

/// Fields whose absence marks a legacy envelope.
const CURRENT_ONLY_FIELDS: [&str; 3] = ["salt", "hmac", "kdf"];

impl StoredEnvelope {
    /// Parses an envelope from JSON text.
    pub fn from_json(json: &str) -> SecurityResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|_| SecurityError::MalformedEnvelope("not valid JSON".to_string()))?;
        let Some(fields) = value.as_object() else {
            return Err(SecurityError::MalformedEnvelope("not a JSON object".to_string()));
        };

        if CURRENT_ONLY_FIELDS.iter().any(|field| fields.contains_key(*field)) {
            serde_json::from_value(value).map(Self::Current).map_err(|_| {
                SecurityError::MalformedEnvelope("version 2 envelope fields are invalid".to_string())
            })
        } else {
            serde_json::from_value(value).map(Self::Legacy).map_err(|_| {
                SecurityError::MalformedEnvelope("not a recognized envelope".to_string())
            })
        }
    }
}

impl From<EncryptedEnvelope> for StoredEnvelope {
    fn from(envelope: EncryptedEnvelope) -> Self {
        Self::Current(envelope)
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn check_len(name: &str, bytes: &[u8], expected: usize) -> SecurityResult<()> {
    if bytes.len() != expected {
        return Err(SecurityError::MalformedEnvelope(format!(
            "{} must be {} bytes, found {}",
            name,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
