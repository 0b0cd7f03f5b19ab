//! Advisory eviction policies.
//!
//! A policy only tracks accesses and names a victim on request. Nothing in
//! the cache removes the victim automatically; callers decide what to do with
//! [`crate::MemStash::eviction_candidate`].

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EvictionPolicyKind;
use crate::error::{StashError, StashResult};

mod lfu;
mod lru;
mod time_based;

pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use time_based::TimeBasedPolicy;

/// Victim selection over the keys a cache has touched.
pub trait EvictionPolicy: Send + Sync {
    fn record_access(&self, key: &str);

    /// Best victim right now, or `None` if the policy has no candidate.
    fn select_victim(&self) -> Option<String>;

    fn set_expiration(&self, _key: &str, _expires_at: DateTime<Utc>) {}

    /// Drop all bookkeeping for `key`.
    fn forget(&self, key: &str);

    fn name(&self) -> &str;
}

/// Build the stock policy for `kind`.
///
/// `Custom` has no stock implementation; supply one through
/// [`crate::MemStashBuilder::eviction_policy`].
pub fn policy_for(kind: EvictionPolicyKind) -> StashResult<Arc<dyn EvictionPolicy>> {
    match kind {
        EvictionPolicyKind::Default | EvictionPolicyKind::Lru => Ok(Arc::new(LruPolicy::new())),
        EvictionPolicyKind::Lfu => Ok(Arc::new(LfuPolicy::new())),
        EvictionPolicyKind::TimeBased => Ok(Arc::new(TimeBasedPolicy::new())),
        EvictionPolicyKind::Custom => Err(StashError::Config {
            message: "custom eviction policy selected but none was supplied".to_string(),
        }),
    }
}
