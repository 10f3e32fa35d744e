//! Master key ownership.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

use super::error::{SecurityError, SecurityResult};

/// Master key length in bytes (AES-256).
pub const MASTER_KEY_LENGTH: usize = 32;

/// 256-bit master secret held only in memory.
///
/// The backing buffer is zeroed on [`MasterKey::clear`] and on drop. A cleared
/// key refuses to expose its bytes instead of handing out zeros.
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LENGTH],
    cleared: bool,
}

impl MasterKey {
    /// Generates a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes, cleared: false }
    }

    /// Takes ownership of existing key material.
    pub fn from_bytes(mut bytes: [u8; MASTER_KEY_LENGTH]) -> Self {
        let key = Self { bytes, cleared: false };
        bytes.zeroize();
        key
    }

    /// Decodes a base64 key (standard alphabet, padded).
    pub fn from_base64(encoded: &str) -> SecurityResult<Self> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|_| {
            SecurityError::MalformedEnvelope("master key is not valid base64".to_string())
        })?);

        let bytes: [u8; MASTER_KEY_LENGTH] = decoded.as_slice().try_into().map_err(|_| {
            SecurityError::MalformedEnvelope(format!(
                "master key must be {} bytes",
                MASTER_KEY_LENGTH
            ))
        })?;

        Ok(Self::from_bytes(bytes))
    }

    /// Returns the key bytes, or `KeyUnavailable` once cleared.
    pub fn expose(&self) -> SecurityResult<&[u8; MASTER_KEY_LENGTH]> {
        if self.cleared {
            return Err(SecurityError::KeyUnavailable("master key has been cleared"));
        }
        Ok(&self.bytes)
    }

    /// Encodes the key as base64 for escrow by the caller.
    pub fn to_base64(&self) -> SecurityResult<Zeroizing<String>> {
        Ok(Zeroizing::new(STANDARD.encode(self.expose()?)))
    }

    /// Copies the key so a caller can retain it across rotation.
    pub fn try_clone(&self) -> SecurityResult<Self> {
        Ok(Self::from_bytes(*self.expose()?))
    }

    /// Zeroes the key and marks it unusable.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
        self.cleared = true;
    }

    /// Whether [`MasterKey::clear`] has been called.
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("cleared", &self.cleared).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keys_differ() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.expose().unwrap(), b.expose().unwrap());
    }

    #[test]
    fn test_clear_rejects_use() {
        let mut key = MasterKey::generate();
        key.clear();
        assert!(key.is_cleared());
        assert!(matches!(key.expose(), Err(SecurityError::KeyUnavailable(_))));
        assert!(key.to_base64().is_err());
    }

    #[test]
    fn test_base64_roundtrip() {
        let key = MasterKey::generate();
        let encoded = key.to_base64().unwrap();
        let decoded = MasterKey::from_base64(&encoded).unwrap();
        assert_eq!(key.expose().unwrap(), decoded.expose().unwrap());
    }

    #[test]
    fn test_from_base64_wrong_length() {
        let short = STANDARD.encode([7u8; 16]);
        assert!(matches!(
            MasterKey::from_base64(&short),
            Err(SecurityError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_debug_hides_material() {
        let key = MasterKey::from_bytes([0xAB; MASTER_KEY_LENGTH]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains("171"));
        assert!(!debug.to_lowercase().contains("ab, ab"));
    }
}
