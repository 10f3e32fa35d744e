//! Encryption engine for memory records at rest.
//!
//! Provides AES-256-GCM encryption with PBKDF2 key derivation scoped by a
//! caller-supplied context, plus an independent HMAC-SHA256 over the whole
//! envelope.

use std::sync::{Arc, Mutex, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::envelope::{
    ALGORITHM, ENVELOPE_VERSION, EncryptedEnvelope, IV_LENGTH, KDF, KDF_ITERATIONS,
    LegacyEnvelope, SALT_LENGTH, StoredEnvelope, TAG_LENGTH,
};
use super::error::{SecurityError, SecurityResult};
use super::key_cache::{DerivedKeys, KeyCache};
use super::master_key::MasterKey;

type HmacSha256 = Hmac<Sha256>;

/// Encryption engine with context-scoped key derivation.
///
/// The engine owns the master key for its lifetime. Derived keys are cached
/// per `(salt, context)` inside the instance, never process-wide.
///
/// # Security
///
/// - AES-256-GCM with a fresh 12-byte IV and 32-byte salt per call
/// - PBKDF2-HMAC-SHA256 with 100,000 iterations over `salt ‖ context`
/// - HMAC-SHA256 checked in constant time before the cipher runs
/// - Key material zeroized on clear and drop
///
/// # Example
///
/// ```
/// use aml_core::security::EncryptionEngine;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = EncryptionEngine::generate();
///
/// let envelope = engine.encrypt("sensitive data", Some("frontend-developer"))?;
/// let plaintext = engine.decrypt(&envelope)?;
/// assert_eq!(plaintext, "sensitive data");
/// # Ok(())
/// # }
/// ```
pub struct EncryptionEngine {
    /// Held master key; `None` until initialized.
    master_key: RwLock<Option<MasterKey>>,
    /// Derived keys for this instance.
    cache: Mutex<KeyCache>,
}

impl EncryptionEngine {
    /// Creates an engine with no master key. Every operation fails with
    /// `KeyUnavailable` until [`EncryptionEngine::initialize`] is called.
    pub fn uninitialized() -> Self {
        Self { master_key: RwLock::new(None), cache: Mutex::new(KeyCache::default()) }
    }

    /// Creates an engine with a freshly generated master key.
    pub fn generate() -> Self {
        Self::with_master_key(MasterKey::generate())
    }

    /// Creates an engine that owns the given master key.
    pub fn with_master_key(key: MasterKey) -> Self {
        Self { master_key: RwLock::new(Some(key)), cache: Mutex::new(KeyCache::default()) }
    }

    /// Loads (or reloads after a clear) the master key.
    pub fn initialize(&self, key: MasterKey) -> SecurityResult<()> {
        let mut guard = self.master_key.write().map_err(|_| SecurityError::LockPoisoned)?;
        key.expose()?;
        self.lock_cache()?.clear();
        *guard = Some(key);
        debug!("Encryption engine initialized");
        Ok(())
    }

    /// Whether a usable master key is loaded.
    pub fn is_initialized(&self) -> bool {
        self.master_key
            .read()
            .map(|guard| guard.as_ref().is_some_and(|key| !key.is_cleared()))
            .unwrap_or(false)
    }

    /// Returns a copy of the current master key for escrow.
    pub fn export_master_key(&self) -> SecurityResult<MasterKey> {
        let guard = self.master_key.read().map_err(|_| SecurityError::LockPoisoned)?;
        Self::held_key(&guard)?.try_clone()
    }

    /// Encrypts a string under the key derived for `context`.
    pub fn encrypt(&self, plaintext: &str, context: Option<&str>) -> SecurityResult<EncryptedEnvelope> {
        self.encrypt_bytes(plaintext.as_bytes(), context)
    }

    /// Encrypts raw bytes under the key derived for `context`.
    pub fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        context: Option<&str>,
    ) -> SecurityResult<EncryptedEnvelope> {
        let guard = self.master_key.read().map_err(|_| SecurityError::LockPoisoned)?;
        let master = Self::held_key(&guard)?.expose()?;

        let mut salt = vec![0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let mut iv = vec![0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let keys = self.keys_for(master, &salt, context)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&keys.cipher_key));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| SecurityError::Encryption("cipher rejected input"))?;
        let auth_tag = sealed.split_off(sealed.len() - TAG_LENGTH);

        let mut envelope = EncryptedEnvelope {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM.to_string(),
            kdf: KDF.to_string(),
            kdf_iterations: KDF_ITERATIONS,
            salt,
            iv,
            ciphertext: sealed,
            auth_tag,
            hmac: Vec::new(),
            context: context.map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
        };
        envelope.hmac = Self::compute_hmac(&keys.hmac_key, &envelope)?;

        Ok(envelope)
    }

    /// Serializes a value to JSON and encrypts it.
    pub fn encrypt_object<T: Serialize + ?Sized>(
        &self,
        value: &T,
        context: Option<&str>,
    ) -> SecurityResult<EncryptedEnvelope> {
        let json = Zeroizing::new(serde_json::to_vec(value)?);
        self.encrypt_bytes(&json, context)
    }

    /// Verifies and decrypts an envelope to a UTF-8 string.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> SecurityResult<String> {
        let plaintext = self.decrypt_bytes(envelope)?;
        String::from_utf8(plaintext)
            .map_err(|_| SecurityError::Decryption("plaintext is not valid UTF-8"))
    }

    /// Verifies and decrypts an envelope to raw bytes.
    ///
    /// The HMAC is checked first; the cipher only runs on an envelope whose
    /// integrity tag matches.
    pub fn decrypt_bytes(&self, envelope: &EncryptedEnvelope) -> SecurityResult<Vec<u8>> {
        let guard = self.master_key.read().map_err(|_| SecurityError::LockPoisoned)?;
        let master = Self::held_key(&guard)?.expose()?;

        envelope.validate()?;
        let context = envelope.context.as_deref();
        let keys = self.keys_for(master, &envelope.salt, context)?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.hmac_key)
            .map_err(|_| SecurityError::Decryption("invalid integrity key"))?;
        mac.update(&envelope.authenticated_bytes());
        if mac.verify_slice(&envelope.hmac).is_err() {
            warn!(context = ?context, "Envelope integrity verification failed");
            return Err(SecurityError::Integrity);
        }

        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LENGTH);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&keys.cipher_key));
        cipher
            .decrypt(Nonce::from_slice(&envelope.iv), sealed.as_ref())
            .map_err(|_| SecurityError::Decryption("authentication tag rejected"))
    }

    /// Decrypts an envelope and parses the plaintext as JSON.
    pub fn decrypt_object<T: DeserializeOwned>(&self, envelope: &EncryptedEnvelope) -> SecurityResult<T> {
        let plaintext = Zeroizing::new(self.decrypt_bytes(envelope)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Decrypts any envelope read from disk, routing legacy envelopes to the
    /// legacy path.
    pub fn decrypt_stored(&self, envelope: &StoredEnvelope) -> SecurityResult<Vec<u8>> {
        match envelope {
            StoredEnvelope::Current(current) => self.decrypt_bytes(current),
            StoredEnvelope::Legacy(legacy) => self.decrypt_legacy(legacy),
        }
    }

    /// Legacy path for pre-integrity envelopes.
    ///
    /// Legacy envelopes were sealed with a per-call key that was never stored
    /// alongside the ciphertext, so no key can be reconstructed from the
    /// master key. The envelope shape is still validated so callers can tell
    /// a legacy record from a corrupted one.
    fn decrypt_legacy(&self, envelope: &LegacyEnvelope) -> SecurityResult<Vec<u8>> {
        let guard = self.master_key.read().map_err(|_| SecurityError::LockPoisoned)?;
        Self::held_key(&guard)?.expose()?;

        if envelope.algorithm != ALGORITHM {
            return Err(SecurityError::UnsupportedEnvelope(format!(
                "legacy algorithm {}",
                envelope.algorithm
            )));
        }
        if envelope.iv.len() != IV_LENGTH || envelope.auth_tag.len() != TAG_LENGTH {
            return Err(SecurityError::MalformedEnvelope(
                "legacy envelope has mis-sized iv or authTag".to_string(),
            ));
        }

        Err(SecurityError::UnsupportedEnvelope(
            "legacy envelope key is not recoverable; re-encrypt from source".to_string(),
        ))
    }

    /// Replaces the master key with a fresh one and drops every cached
    /// derivation.
    ///
    /// Envelopes sealed under the previous key are not re-encrypted; callers
    /// that still need them must keep the returned old key themselves (see
    /// [`EncryptionEngine::export_master_key`]) before rotating.
    pub fn rotate_master_key(&self) -> SecurityResult<MasterKey> {
        let mut guard = self.master_key.write().map_err(|_| SecurityError::LockPoisoned)?;
        let new_key = MasterKey::generate();
        let returned = new_key.try_clone()?;

        self.lock_cache()?.clear();
        *guard = Some(new_key);

        info!("Master key rotated; derived key cache cleared");
        Ok(returned)
    }

    /// Zeroes the master key. Encrypt and decrypt fail until reinitialized.
    pub fn clear_master_key(&self) -> SecurityResult<()> {
        let mut guard = self.master_key.write().map_err(|_| SecurityError::LockPoisoned)?;
        if let Some(key) = guard.as_mut() {
            key.clear();
        }
        self.lock_cache()?.clear();
        debug!("Master key cleared");
        Ok(())
    }

    /// Drops cached derivations; subsequent operations re-run PBKDF2.
    pub fn clear_key_cache(&self) -> SecurityResult<()> {
        self.lock_cache()?.clear();
        Ok(())
    }

    /// Number of cached derivations.
    pub fn cached_key_count(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Whether the derivation for this envelope's salt and context is cached.
    pub fn is_cached(&self, envelope: &EncryptedEnvelope) -> bool {
        self.cache
            .lock()
            .map(|cache| cache.contains(&envelope.salt, envelope.context.as_deref()))
            .unwrap_or(false)
    }

    fn held_key(key: &Option<MasterKey>) -> SecurityResult<&MasterKey> {
        key.as_ref().ok_or(SecurityError::KeyUnavailable("engine not initialized"))
    }

    fn lock_cache(&self) -> SecurityResult<std::sync::MutexGuard<'_, KeyCache>> {
        self.cache.lock().map_err(|_| SecurityError::LockPoisoned)
    }

    /// Returns cached keys for `(salt, context)` or derives and caches them.
    fn keys_for(
        &self,
        master: &[u8; 32],
        salt: &[u8],
        context: Option<&str>,
    ) -> SecurityResult<Arc<DerivedKeys>> {
        if let Some(keys) = self.lock_cache()?.get(salt, context) {
            return Ok(keys);
        }

        // PBKDF2 runs outside the cache lock.
        let keys = Arc::new(Self::derive_keys(master, salt, context));
        self.lock_cache()?.insert(salt, context, Arc::clone(&keys));
        Ok(keys)
    }

    /// Derives cipher and HMAC keys from the master key using PBKDF2.
    fn derive_keys(master: &[u8; 32], salt: &[u8], context: Option<&str>) -> DerivedKeys {
        let mut input = Zeroizing::new(Vec::with_capacity(
            salt.len() + context.map_or(0, str::len),
        ));
        input.extend_from_slice(salt);
        if let Some(context) = context {
            input.extend_from_slice(context.as_bytes());
        }

        let mut okm = Zeroizing::new([0u8; 64]);
        pbkdf2_hmac::<Sha256>(master, &input, KDF_ITERATIONS, &mut okm[..]);

        let mut keys = DerivedKeys { cipher_key: [0u8; 32], hmac_key: [0u8; 32] };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.hmac_key.copy_from_slice(&okm[32..]);
        keys
    }

    fn compute_hmac(key: &[u8; 32], envelope: &EncryptedEnvelope) -> SecurityResult<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| SecurityError::Encryption("invalid integrity key"))?;
        mac.update(&envelope.authenticated_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl Default for EncryptionEngine {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("initialized", &self.is_initialized())
            .field("cached_keys", &self.cached_key_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encryption_decryption() {
        let engine = EncryptionEngine::generate();

        let envelope = engine.encrypt("sensitive data", None).unwrap();
        let decrypted = engine.decrypt(&envelope).unwrap();

        assert_eq!(decrypted, "sensitive data");
        assert_ne!(envelope.ciphertext, b"sensitive data".to_vec());
    }

    #[test]
    fn test_envelope_metadata() {
        let engine = EncryptionEngine::generate();
        let envelope = engine.encrypt("x", Some("agent-1")).unwrap();

        assert_eq!(envelope.version, 2);
        assert_eq!(envelope.algorithm, "aes-256-gcm");
        assert_eq!(envelope.kdf, "pbkdf2-sha256");
        assert_eq!(envelope.kdf_iterations, 100_000);
        assert_eq!(envelope.context.as_deref(), Some("agent-1"));
        assert!(chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_ok());
    }

    #[test]
    fn test_encrypt_caches_derivation() {
        let engine = EncryptionEngine::generate();
        let envelope = engine.encrypt("cached", Some("agent-1")).unwrap();

        assert!(engine.is_cached(&envelope));
        assert_eq!(engine.cached_key_count(), 1);
    }

    #[test]
    fn test_clear_key_cache_is_transparent() {
        let engine = EncryptionEngine::generate();
        let envelope = engine.encrypt("still readable", Some("agent-1")).unwrap();

        engine.clear_key_cache().unwrap();
        assert_eq!(engine.cached_key_count(), 0);
        assert_eq!(engine.decrypt(&envelope).unwrap(), "still readable");
    }

    #[test]
    fn test_object_roundtrip() {
        let engine = EncryptionEngine::generate();
        let value = json!({"id": "p1", "metrics": {"successRate": 0.9}});

        let envelope = engine.encrypt_object(&value, Some("agent-1")).unwrap();
        let decrypted: serde_json::Value = engine.decrypt_object(&envelope).unwrap();

        assert_eq!(decrypted, value);
    }

    #[test]
    fn test_uninitialized_engine() {
        let engine = EncryptionEngine::uninitialized();
        assert!(!engine.is_initialized());
        assert!(matches!(
            engine.encrypt("data", None),
            Err(SecurityError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_initialize_after_clear() {
        let engine = EncryptionEngine::generate();
        let escrow = engine.export_master_key().unwrap();
        let envelope = engine.encrypt("data", None).unwrap();

        engine.clear_master_key().unwrap();
        assert!(!engine.is_initialized());
        assert!(matches!(engine.decrypt(&envelope), Err(SecurityError::KeyUnavailable(_))));

        engine.initialize(escrow).unwrap();
        assert_eq!(engine.decrypt(&envelope).unwrap(), "data");
    }

    #[test]
    fn test_initialize_rejects_cleared_key() {
        let engine = EncryptionEngine::uninitialized();
        let mut key = MasterKey::generate();
        key.clear();
        assert!(engine.initialize(key).is_err());
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_legacy_envelope_rejected_explicitly() {
        let engine = EncryptionEngine::generate();
        let legacy = StoredEnvelope::Legacy(LegacyEnvelope {
            algorithm: ALGORITHM.to_string(),
            iv: vec![0; IV_LENGTH],
            ciphertext: vec![1, 2, 3],
            auth_tag: vec![0; TAG_LENGTH],
            timestamp: None,
        });

        assert!(matches!(
            engine.decrypt_stored(&legacy),
            Err(SecurityError::UnsupportedEnvelope(_))
        ));
    }

    #[test]
    fn test_decrypt_stored_current() {
        let engine = EncryptionEngine::generate();
        let envelope = engine.encrypt("current", Some("ctx")).unwrap();
        let stored = StoredEnvelope::from(envelope);
        assert_eq!(engine.decrypt_stored(&stored).unwrap(), b"current".to_vec());
    }

    #[test]
    fn test_debug_hides_key() {
        let engine = EncryptionEngine::generate();
        let debug = format!("{:?}", engine);
        assert!(debug.contains("initialized: true"));
    }
}
