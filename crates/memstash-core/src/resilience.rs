//! Retry and circuit breaking around a backend store.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{EntryOptions, RetrySettings};
use crate::error::{ensure_live, StashError, StashResult};
use crate::store::CacheStore;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// `max_retries` retries after the first attempt; 1s base delay capped at 30s.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (1-based): uniform in
    /// `0..=min(base * 2^retry, max)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        let ceiling = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let ceiling_ms = ceiling.as_millis() as u64;
        let jittered_ms = rand::thread_rng().gen_range(0..=ceiling_ms);
        Duration::from_millis(jittered_ms.max(1))
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Opens after `failure_threshold` consecutive failures and rejects calls for
/// `break_duration`. After that exactly one trial call is let through while
/// the rest stay rejected; its success closes the circuit and its failure
/// reopens it. A trial whose outcome is never recorded lapses after another
/// `break_duration`.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    break_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            break_duration,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reopen(&self, state: &mut BreakerState, now: Instant) {
        state.trial_started = None;
        state.open_until = Some(now.checked_add(self.break_duration).unwrap_or(now));
    }

    /// Whether a call may go through now.
    pub fn allow(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(started) = state.trial_started {
            if now.duration_since(started) < self.break_duration {
                return false;
            }
            // lapsed trial; start another
            state.trial_started = Some(now);
            return true;
        }
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                state.open_until = None;
                state.trial_started = Some(now);
                true
            }
            None => true,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().open_until, Some(until) if Instant::now() < until)
    }

    /// Whether a trial call is outstanding.
    pub fn is_half_open(&self) -> bool {
        self.lock().trial_started.is_some()
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
        state.trial_started = None;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.trial_started.is_some() {
            self.reopen(&mut state, now);
            return true;
        }
        if state.consecutive_failures >= self.failure_threshold && state.open_until.is_none() {
            self.reopen(&mut state, now);
            return true;
        }
        false
    }
}

/// Backend decorator adding retries and a circuit breaker.
///
/// Only retryable errors are retried and counted against the breaker.
/// Cancellation is never retried.
#[derive(Debug)]
pub struct ResilientStore<S> {
    inner: S,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<S: CacheStore> ResilientStore<S> {
    pub fn new(inner: S, retry: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            retry,
            breaker,
        }
    }

    pub fn from_settings(inner: S, settings: &RetrySettings) -> Self {
        Self::new(
            inner,
            RetryPolicy::new(settings.max_retries),
            CircuitBreaker::new(
                settings.failure_threshold,
                Duration::from_secs(settings.break_secs),
            ),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> StashResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StashResult<T>>,
    {
        let provider = self.inner.provider_name();
        let max_retries = self.retry.max_retries();
        let mut retries = 0;

        loop {
            ensure_live(cancel, operation)?;
            if !self.breaker.allow() {
                return Err(StashError::CircuitOpen {
                    provider: provider.to_string(),
                });
            }

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if self.breaker.record_failure() {
                        warn!(provider, operation, "circuit opened");
                    }
                    if retries >= max_retries {
                        return Err(e);
                    }
                    retries += 1;

                    let backoff = self.retry.backoff(retries);
                    warn!(
                        provider,
                        operation,
                        error = %e,
                        retry = retries,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying backend call"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StashError::cancelled(operation)),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for ResilientStore<S> {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
        self.run("get", cancel, || self.inner.get(key, cancel)).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        self.run("set", cancel, || {
            self.inner.set(key, value.clone(), options, cancel)
        })
        .await
    }

    async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        self.run("remove", cancel, || self.inner.remove(key, cancel))
            .await
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        self.run("exists", cancel, || self.inner.exists(key, cancel))
            .await
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with the given error.
    struct FlakyStore {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicU32::new(0),
                inner: MemoryStore::default(),
            }
        }

        fn trip(&self) -> StashResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(StashError::Backend {
                    provider: "flaky".into(),
                    message: format!("failure {}", n + 1),
                    retryable: self.retryable,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
            self.trip()?;
            self.inner.get(key, cancel).await
        }

        async fn set(
            &self,
            key: &str,
            value: Vec<u8>,
            options: &EntryOptions,
            cancel: &CancellationToken,
        ) -> StashResult<()> {
            self.trip()?;
            self.inner.set(key, value, options, cancel).await
        }

        async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
            self.trip()?;
            self.inner.remove(key, cancel).await
        }

        async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
            self.trip()?;
            self.inner.exists(key, cancel).await
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = ResilientStore::new(
            FlakyStore::new(2, true),
            fast_retry(3),
            CircuitBreaker::new(10, Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();

        store
            .set("k", b"v".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get("k", &cancel).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let store = ResilientStore::new(
            FlakyStore::new(10, true),
            fast_retry(2),
            CircuitBreaker::new(100, Duration::from_secs(30)),
        );
        let err = store
            .get("k", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let store = ResilientStore::new(
            FlakyStore::new(1, false),
            fast_retry(5),
            CircuitBreaker::new(1, Duration::from_secs(30)),
        );
        assert!(store.get("k", &CancellationToken::new()).await.is_err());
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 1);
        assert!(!store.breaker().is_open());
    }

    #[tokio::test]
    async fn test_circuit_opens_and_short_circuits() {
        let store = ResilientStore::new(
            FlakyStore::new(100, true),
            fast_retry(0),
            CircuitBreaker::new(2, Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();

        assert!(matches!(
            store.get("k", &cancel).await,
            Err(StashError::Backend { .. })
        ));
        assert!(matches!(
            store.get("k", &cancel).await,
            Err(StashError::Backend { .. })
        ));
        assert!(store.breaker().is_open());
        assert!(matches!(
            store.get("k", &cancel).await,
            Err(StashError::CircuitOpen { .. })
        ));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_half_open_after_break() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        assert!(breaker.record_failure());
        // zero-length break: next call is the trial
        assert!(breaker.allow());
        assert!(breaker.record_failure());
        breaker.allow();
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_admits_a_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));
        assert!(breaker.record_failure());
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow(), "first caller after the break is the trial");
        assert!(breaker.is_half_open());
        for _ in 0..5 {
            assert!(!breaker.allow(), "others wait for the trial's outcome");
        }

        // failed trial reopens for a full break
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow());
        breaker.record_success();
        assert!(!breaker.is_half_open());
        assert!(breaker.allow());
        assert!(breaker.allow());
    }

    #[test]
    fn test_unrecorded_trial_lapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow());
        assert!(!breaker.allow());

        // the trial's caller vanished without reporting back
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));
        for retry in 1..=40 {
            assert!(policy.backoff(retry) <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let store = ResilientStore::new(
            FlakyStore::new(u32::MAX, true),
            RetryPolicy::new(1_000).with_base_delay(Duration::from_secs(10)),
            CircuitBreaker::new(100, Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = store.get("k", &cancel).await.unwrap_err();
        assert!(matches!(err, StashError::Cancelled { .. }));
    }
}
