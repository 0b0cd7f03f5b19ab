//! Single-flight deduplication of concurrent computations per key.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use tracing::trace;

use crate::error::{StashError, StashResult};

type Flight<V> = Shared<BoxFuture<'static, Result<V, Arc<StashError>>>>;

/// At most one computation in flight per key.
///
/// Callers arriving while a flight is running await the same shared future
/// and see the leader's value, or its error wrapped in
/// [`StashError::DedupLeader`]. The registration is dropped once the flight
/// completes, so the next call starts fresh.
pub struct SingleFlight<K, V> {
    flights: DashMap<K, Flight<V>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    pub async fn get_or_add<F, Fut>(&self, key: K, factory: F) -> StashResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StashResult<V>> + Send + 'static,
    {
        let flight = match self.join(&key) {
            Some(existing) => existing,
            None => {
                // Built outside the shard lock; `factory` may touch this map.
                let candidate = factory().map_err(Arc::new).boxed().shared();
                match self.flights.entry(key.clone()) {
                    Entry::Occupied(existing) => {
                        trace!(key = %key, "lost registration race, joining");
                        existing.get().clone()
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(candidate.clone());
                        candidate
                    }
                }
            }
        };

        let outcome = flight.clone().await;

        // Only this flight's registration; a newer one may already be there.
        self.flights
            .remove_if(&key, |_, registered| registered.ptr_eq(&flight));

        outcome.map_err(|source| StashError::DedupLeader {
            key: key.to_string(),
            source,
        })
    }

    fn join(&self, key: &K) -> Option<Flight<V>> {
        let existing = self.flights.get(key)?.value().clone();
        trace!(key = %key, "joining in-flight computation");
        Some(existing)
    }

    /// Number of keys with a live flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hundred_callers_one_computation() {
        let flights = Arc::new(SingleFlight::<String, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let arrived = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let flights = flights.clone();
            let calls = calls.clone();
            let arrived = arrived.clone();
            handles.push(tokio::spawn(async move {
                let gate = arrived.clone();
                arrived.fetch_add(1, Ordering::SeqCst);
                flights
                    .get_or_add("k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // hold the flight open until every caller has joined
                        while gate.load(Ordering::SeqCst) < 100 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                        // let late arrivals finish registering
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_shared_then_next_call_retries() {
        let flights = SingleFlight::<String, u64>::new();

        let err = flights
            .get_or_add("k".to_string(), || async {
                Err(StashError::backend("memory", "down"))
            })
            .await
            .unwrap_err();
        match err {
            StashError::DedupLeader { key, source } => {
                assert_eq!(key, "k");
                assert!(matches!(*source, StashError::Backend { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        // registration removed, so a fresh flight runs
        let value = flights
            .get_or_add("k".to_string(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_factory_may_inspect_the_map() {
        let flights = Arc::new(SingleFlight::<String, usize>::new());
        let observer = flights.clone();

        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            flights.get_or_add("k".to_string(), move || {
                // runs synchronously while get_or_add is registering
                let live = observer.in_flight();
                async move { Ok(live) }
            }),
        )
        .await
        .expect("factory deadlocked on the flight map")
        .unwrap();

        assert_eq!(seen, 0);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights = SingleFlight::<String, String>::new();
        let (a, b) = tokio::join!(
            flights.get_or_add("a".to_string(), || async { Ok("A".to_string()) }),
            flights.get_or_add("b".to_string(), || async { Ok("B".to_string()) }),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
    }
}
