//! Integration tests for the encryption engine.

use aml_core::security::{
    EncryptedEnvelope, EncryptionEngine, HMAC_LENGTH, IV_LENGTH, MasterKey, SALT_LENGTH,
    SecurityError, StoredEnvelope, TAG_LENGTH,
};
use serde_json::{Value, json};

fn assert_tamper_rejected(engine: &EncryptionEngine, envelope: &EncryptedEnvelope) {
    let err = engine.decrypt(envelope).unwrap_err();
    assert!(err.is_tamper(), "expected tamper error, got {err:?}");
}

#[test]
fn test_roundtrip_sensitive_data() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("sensitive data", Some("frontend-developer")).unwrap();

    assert_eq!(envelope.context.as_deref(), Some("frontend-developer"));
    assert_eq!(engine.decrypt(&envelope).unwrap(), "sensitive data");
}

#[test]
fn test_roundtrip_edge_payloads() {
    let engine = EncryptionEngine::generate();
    let large = "x".repeat(2 * 1024 * 1024);
    let payloads = ["", "héllo wörld ✓ 日本語 🚀", large.as_str()];

    for payload in payloads {
        let envelope = engine.encrypt(payload, None).unwrap();
        assert_eq!(engine.decrypt(&envelope).unwrap(), payload);
    }
}

#[test]
fn test_field_sizes() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("data", Some("ctx")).unwrap();

    assert_eq!(envelope.version, 2);
    assert_eq!(envelope.algorithm, "aes-256-gcm");
    assert_eq!(envelope.kdf, "pbkdf2-sha256");
    assert_eq!(envelope.kdf_iterations, 100_000);
    assert_eq!(envelope.salt.len(), SALT_LENGTH);
    assert_eq!(envelope.iv.len(), IV_LENGTH);
    assert_eq!(envelope.auth_tag.len(), TAG_LENGTH);
    assert_eq!(envelope.hmac.len(), HMAC_LENGTH);
    assert!(chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_ok());
}

#[test]
fn test_wire_format() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("data", None).unwrap();
    let json: Value = serde_json::to_value(&envelope).unwrap();

    for key in [
        "version",
        "algorithm",
        "kdf",
        "kdf_iterations",
        "salt",
        "iv",
        "ciphertext",
        "authTag",
        "hmac",
        "timestamp",
    ] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
    assert!(json.get("context").is_none());

    let parsed: EncryptedEnvelope = serde_json::from_value(json).unwrap();
    assert_eq!(engine.decrypt(&parsed).unwrap(), "data");
}

#[test]
fn test_encryption_is_not_deterministic() {
    let engine = EncryptionEngine::generate();
    let a = engine.encrypt("same input", Some("agent")).unwrap();
    let b = engine.encrypt("same input", Some("agent")).unwrap();

    assert_ne!(a.salt, b.salt);
    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext, b.ciphertext);
    assert_ne!(a.hmac, b.hmac);
}

#[test]
fn test_tampered_ciphertext_rejected() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("sensitive data", Some("agent")).unwrap();
    envelope.ciphertext[0] ^= 0x01;

    assert!(matches!(engine.decrypt(&envelope), Err(SecurityError::Integrity)));
}

#[test]
fn test_tampered_auth_tag_rejected() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("sensitive data", Some("agent")).unwrap();
    envelope.auth_tag[TAG_LENGTH - 1] ^= 0x80;

    assert_tamper_rejected(&engine, &envelope);
}

#[test]
fn test_tampered_iv_rejected() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("sensitive data", Some("agent")).unwrap();
    envelope.iv[0] ^= 0xff;

    assert_tamper_rejected(&engine, &envelope);
}

#[test]
fn test_tampered_hmac_rejected() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("sensitive data", None).unwrap();
    envelope.hmac[0] ^= 0x01;

    assert!(matches!(engine.decrypt(&envelope), Err(SecurityError::Integrity)));
}

#[test]
fn test_context_isolation() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("sensitive data", Some("agent-a")).unwrap();

    envelope.context = Some("agent-b".to_string());
    assert_tamper_rejected(&engine, &envelope);

    envelope.context = None;
    assert_tamper_rejected(&engine, &envelope);
}

#[test]
fn test_errors_do_not_leak_plaintext() {
    let engine = EncryptionEngine::generate();
    let mut envelope = engine.encrypt("top-secret-value", Some("agent")).unwrap();
    envelope.ciphertext[0] ^= 0x01;

    let message = engine.decrypt(&envelope).unwrap_err().to_string();
    assert!(!message.contains("top-secret-value"));
}

#[test]
fn test_different_master_key_rejected() {
    let engine = EncryptionEngine::generate();
    let other = EncryptionEngine::generate();
    let envelope = engine.encrypt("sensitive data", None).unwrap();

    assert_tamper_rejected(&other, &envelope);
}

#[test]
fn test_rotation_clears_cache_and_keeps_working() {
    let engine = EncryptionEngine::generate();
    let before = engine.encrypt("before rotation", Some("agent")).unwrap();
    assert!(engine.cached_key_count() > 0);

    let new_key = engine.rotate_master_key().unwrap();
    assert_eq!(engine.cached_key_count(), 0);
    assert!(!engine.is_cached(&before));

    let after = engine.encrypt("after rotation", Some("agent")).unwrap();
    assert_eq!(engine.decrypt(&after).unwrap(), "after rotation");

    // Not re-encrypted: data sealed under the old key no longer opens.
    assert_tamper_rejected(&engine, &before);

    let restored = EncryptionEngine::with_master_key(new_key);
    assert_eq!(restored.decrypt(&after).unwrap(), "after rotation");
}

#[test]
fn test_clear_key_cache_only_forces_rederivation() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("data", Some("agent")).unwrap();

    engine.clear_key_cache().unwrap();
    assert_eq!(engine.cached_key_count(), 0);
    assert_eq!(engine.decrypt(&envelope).unwrap(), "data");
    assert!(engine.is_cached(&envelope));
}

#[test]
fn test_cleared_master_key_blocks_operations() {
    let engine = EncryptionEngine::generate();
    let key = engine.export_master_key().unwrap();
    let envelope = engine.encrypt("data", None).unwrap();

    engine.clear_master_key().unwrap();
    assert!(!engine.is_initialized());
    assert!(matches!(engine.encrypt("data", None), Err(SecurityError::KeyUnavailable(_))));
    assert!(matches!(engine.decrypt(&envelope), Err(SecurityError::KeyUnavailable(_))));

    engine.initialize(key).unwrap();
    assert_eq!(engine.decrypt(&envelope).unwrap(), "data");
}

#[test]
fn test_master_key_base64_import() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("portable", Some("agent")).unwrap();

    let encoded = engine.export_master_key().unwrap().to_base64().unwrap();
    let imported = EncryptionEngine::with_master_key(MasterKey::from_base64(&encoded).unwrap());

    assert_eq!(imported.decrypt(&envelope).unwrap(), "portable");
    assert!(MasterKey::from_base64("dG9vIHNob3J0").is_err());
}

#[test]
fn test_object_roundtrip() {
    let engine = EncryptionEngine::generate();
    let value = json!({"patterns": [{"id": "p1"}], "count": 1});

    let envelope = engine.encrypt_object(&value, Some("agent")).unwrap();
    let decrypted: Value = engine.decrypt_object(&envelope).unwrap();
    assert_eq!(decrypted, value);
}

#[test]
fn test_legacy_envelope_recognized_but_rejected() {
    let engine = EncryptionEngine::generate();
    let legacy = r#"{
        "algorithm": "aes-256-gcm",
        "iv": "AAAAAAAAAAAAAAAA",
        "encrypted": "c2VjcmV0",
        "authTag": "AAAAAAAAAAAAAAAAAAAAAA==",
        "timestamp": "2024-01-01T00:00:00Z"
    }"#;

    let stored = StoredEnvelope::from_json(legacy).unwrap();
    assert!(matches!(stored, StoredEnvelope::Legacy(_)));
    assert!(matches!(engine.decrypt_stored(&stored), Err(SecurityError::UnsupportedEnvelope(_))));
}

#[test]
fn test_current_envelope_parses_as_current() {
    let engine = EncryptionEngine::generate();
    let envelope = engine.encrypt("data", Some("agent")).unwrap();
    let json = serde_json::to_string(&envelope).unwrap();

    let stored = StoredEnvelope::from_json(&json).unwrap();
    assert!(matches!(stored, StoredEnvelope::Current(_)));
    assert_eq!(engine.decrypt_stored(&stored).unwrap(), b"data");
}

#[test]
fn test_concurrent_encrypt_during_rotation() {
    use std::sync::Arc;

    let engine = Arc::new(EncryptionEngine::generate());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let envelope = engine.encrypt(&format!("payload {i}"), Some("agent")).unwrap();
                // Either key may seal it; a successful encrypt always yields a
                // well-formed envelope.
                assert_eq!(envelope.iv.len(), IV_LENGTH);
            })
        })
        .collect();

    engine.rotate_master_key().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let envelope = engine.encrypt("post", None).unwrap();
    assert_eq!(engine.decrypt(&envelope).unwrap(), "post");
}
