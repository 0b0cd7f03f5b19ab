use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::EvictionPolicy;

/// Evicts entries whose absolute expiration has passed. Accesses are ignored.
#[derive(Debug, Default)]
pub struct TimeBasedPolicy {
    expires_at: DashMap<String, DateTime<Utc>>,
}

impl TimeBasedPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for TimeBasedPolicy {
    fn record_access(&self, _key: &str) {}

    fn select_victim(&self) -> Option<String> {
        let now = Utc::now();
        self.expires_at
            .iter()
            .filter(|entry| *entry.value() <= now)
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone())
    }

    fn set_expiration(&self, key: &str, expires_at: DateTime<Utc>) {
        self.expires_at.insert(key.to_string(), expires_at);
    }

    fn forget(&self, key: &str) {
        self.expires_at.remove(key);
    }

    fn name(&self) -> &str {
        "time_based"
    }
}
