use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::Fingerprint;

/// Bounded LRU of serialized agent replies keyed by request fingerprint.
/// Entries are immutable once stored; a later insert under the same key
/// replaces the entry and refreshes its recency.
pub struct ResultCache {
    inner: Mutex<LruCache<Fingerprint, Bytes>>,
}

impl ResultCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Bytes> {
        self.inner.lock().get(fingerprint).cloned()
    }

    pub fn insert(&self, fingerprint: Fingerprint, response: Bytes) {
        self.inner.lock().put(fingerprint, response);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::Arc,
    };

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::ResultCache;
    use crate::Fingerprint;

    fn cache(capacity: usize) -> ResultCache {
        ResultCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_lookup_after_insert() {
        let cache = cache(5);
        let key = Fingerprint::digest("echo", b"hi");
        assert_eq!(cache.lookup(&key), None);
        cache.insert(key.clone(), Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nhi"));
        assert_eq!(
            cache.lookup(&key),
            Some(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nhi"))
        );
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let cache = cache(2);
        let a = Fingerprint::digest("a", b"");
        let b = Fingerprint::digest("b", b"");
        let c = Fingerprint::digest("c", b"");
        cache.insert(a.clone(), Bytes::from_static(b"a"));
        cache.insert(b.clone(), Bytes::from_static(b"b"));
        assert!(cache.lookup(&a).is_some());
        cache.insert(c.clone(), Bytes::from_static(b"c"));
        assert!(cache.lookup(&a).is_some());
        assert!(cache.lookup(&b).is_none());
        assert!(cache.lookup(&c).is_some());
    }

    #[test]
    fn test_concurrent_readers_see_inserted_bytes() {
        let cache = Arc::new(cache(5));
        let key = Fingerprint::digest("echo", b"x");
        let value = Bytes::from(vec![7u8; 4096]);
        cache.insert(key.clone(), value.clone());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.insert(
                            Fingerprint::digest(&format!("other-{i}-{j}"), b""),
                            Bytes::from_static(b"noise"),
                        );
                        if let Some(found) = cache.lookup(&key) {
                            assert_eq!(found.len(), 4096);
                            assert!(found.iter().all(|b| *b == 7));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_never_exceeds_capacity(
            capacity in 1usize..8,
            keys in prop::collection::vec(0u8..32, 0..64),
        ) {
            let cache = cache(capacity);
            for key in keys {
                cache.insert(Fingerprint::digest("f", &[key]), Bytes::from(vec![key]));
                prop_assert!(cache.len() <= cache.capacity());
            }
        }
    }
}
