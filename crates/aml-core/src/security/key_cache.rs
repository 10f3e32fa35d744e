//! Derived-key cache keyed by `(salt, context)`.

use std::collections::HashMap;
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Upper bound on cached derivations before the cache is flushed.
const MAX_CACHE_ENTRIES: usize = 1024;

/// Cipher and HMAC keys produced by one PBKDF2 run.
///
/// The KDF output is 64 bytes: the first half keys AES-256-GCM, the second
/// half keys HMAC-SHA256, so the two keys are independent but share a
/// derivation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DerivedKeys {
    pub(crate) cipher_key: [u8; 32],
    pub(crate) hmac_key: [u8; 32],
}

/// Cache lookup key.
#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    salt: Vec<u8>,
    context: Option<String>,
}

/// Per-engine cache of derived keys.
#[derive(Default)]
pub(crate) struct KeyCache {
    entries: HashMap<CacheKey, Arc<DerivedKeys>>,
}

impl KeyCache {
    pub(crate) fn get(&self, salt: &[u8], context: Option<&str>) -> Option<Arc<DerivedKeys>> {
        let key = CacheKey { salt: salt.to_vec(), context: context.map(str::to_string) };
        self.entries.get(&key).cloned()
    }

    pub(crate) fn insert(&mut self, salt: &[u8], context: Option<&str>, keys: Arc<DerivedKeys>) {
        if self.entries.len() >= MAX_CACHE_ENTRIES {
            self.entries.clear();
        }
        let key = CacheKey { salt: salt.to_vec(), context: context.map(str::to_string) };
        self.entries.insert(key, keys);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, salt: &[u8], context: Option<&str>) -> bool {
        self.get(salt, context).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(fill: u8) -> Arc<DerivedKeys> {
        Arc::new(DerivedKeys { cipher_key: [fill; 32], hmac_key: [fill.wrapping_add(1); 32] })
    }

    #[test]
    fn test_context_is_part_of_key() {
        let mut cache = KeyCache::default();
        cache.insert(b"salt", Some("agent-1"), keys(1));

        assert!(cache.contains(b"salt", Some("agent-1")));
        assert!(!cache.contains(b"salt", Some("agent-2")));
        assert!(!cache.contains(b"salt", None));
    }

    #[test]
    fn test_clear() {
        let mut cache = KeyCache::default();
        cache.insert(b"a", None, keys(1));
        cache.insert(b"b", None, keys(2));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_flush_when_full() {
        let mut cache = KeyCache::default();
        for i in 0..MAX_CACHE_ENTRIES {
            cache.insert(&i.to_le_bytes(), None, keys(0));
        }
        assert_eq!(cache.len(), MAX_CACHE_ENTRIES);

        cache.insert(b"overflow", None, keys(0));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(b"overflow", None));
    }
}
