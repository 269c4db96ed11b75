use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded in-process cache with a per-entry TTL, used to replay issuance
/// responses to client retries without a second debit.
pub struct TtlCache<V> {
    entries: Mutex<LruCache<String, (Instant, V)>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("ttl cache poisoned");

        if let Some((inserted, value)) = entries.get(key) {
            if inserted.elapsed() < self.ttl {
                return Some(value.clone());
            }
        } else {
            return None;
        }

        entries.pop(key);
        None
    }

    pub fn put(&self, key: String, value: V) {
        let mut entries = self.entries.lock().expect("ttl cache poisoned");
        entries.put(key, (Instant::now(), value));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
