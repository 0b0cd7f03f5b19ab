//! Cache pre-population at startup.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::MemStash;

/// User-supplied source of entries to load before serving traffic.
#[async_trait]
pub trait CacheSeeder: Send + Sync {
    fn name(&self) -> &str;

    async fn seed(&self, cache: &MemStash, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub succeeded: usize,
    pub failed: usize,
    /// `(seeder, error)` for each failure.
    pub failures: Vec<(String, String)>,
}

impl WarmupReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Runs every registered seeder concurrently. A failing seeder is logged and
/// counted; it never stops the others.
#[derive(Default, Clone)]
pub struct CacheWarmer {
    seeders: Vec<Arc<dyn CacheSeeder>>,
}

impl CacheWarmer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seeder(mut self, seeder: Arc<dyn CacheSeeder>) -> Self {
        self.seeders.push(seeder);
        self
    }

    pub fn add_seeder(&mut self, seeder: Arc<dyn CacheSeeder>) {
        self.seeders.push(seeder);
    }

    pub fn len(&self) -> usize {
        self.seeders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeders.is_empty()
    }

    pub async fn warm(&self, cache: &MemStash, cancel: &CancellationToken) -> WarmupReport {
        let outcomes = join_all(self.seeders.iter().map(|seeder| async move {
            (seeder.name().to_string(), seeder.seed(cache, cancel).await)
        }))
        .await;

        let mut report = WarmupReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(seeder = %name, error = %e, "cache seeder failed");
                    report.failed += 1;
                    report.failures.push((name, format!("{:#}", e)));
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "cache warm-up finished"
        );
        report
    }
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.seeders.iter().map(|s| s.name()).collect();
        f.debug_struct("CacheWarmer").field("seeders", &names).finish()
    }
}
