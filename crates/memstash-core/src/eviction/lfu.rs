use dashmap::DashMap;

use super::EvictionPolicy;

/// Least frequently used. Counts start at 1 on first access.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    counts: DashMap<String, u64>,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }
}

impl EvictionPolicy for LfuPolicy {
    fn record_access(&self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
    }

    fn select_victim(&self) -> Option<String> {
        self.counts
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone())
    }

    fn forget(&self, key: &str) {
        self.counts.remove(key);
    }

    fn name(&self) -> &str {
        "lfu"
    }
}
