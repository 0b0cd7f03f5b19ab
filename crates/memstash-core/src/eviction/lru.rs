use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use super::EvictionPolicy;

/// Least recently used.
///
/// Each access is stamped with the clock and a global sequence number; the
/// sequence orders accesses that land on the same clock tick.
#[derive(Debug, Default)]
pub struct LruPolicy {
    last_access: DashMap<String, (Instant, u64)>,
    sequence: AtomicU64,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.last_access.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_access.is_empty()
    }
}

impl EvictionPolicy for LruPolicy {
    fn record_access(&self, key: &str) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.last_access
            .insert(key.to_string(), (Instant::now(), seq));
    }

    fn select_victim(&self) -> Option<String> {
        self.last_access
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone())
    }

    fn forget(&self, key: &str) {
        self.last_access.remove(key);
    }

    fn name(&self) -> &str {
        "lru"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_recent_is_victim() {
        let lru = LruPolicy::new();
        for key in ["key1", "key2", "key3", "key1"] {
            lru.record_access(key);
        }
        assert_eq!(lru.select_victim().as_deref(), Some("key2"));
    }

    #[test]
    fn test_empty_and_forget() {
        let lru = LruPolicy::new();
        assert_eq!(lru.select_victim(), None);

        lru.record_access("a");
        lru.record_access("b");
        lru.forget("a");
        assert_eq!(lru.select_victim().as_deref(), Some("b"));
        assert_eq!(lru.len(), 1);
    }
}
