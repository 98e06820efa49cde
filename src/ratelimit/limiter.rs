//! Core rate limiter implementation.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::decision::Decision;
use super::key::{ClientKey, HeaderKey, KeyExtractor, PeerAddr, RequestMeta};
use super::store::{LockedStore, ShardedStore, WindowStore};
use super::window::ClientWindow;
use crate::clock::{Clock, SystemClock};
use crate::config::{FaultMode, LimiterConfig, StoreKind};
use crate::error::{RateKeeperError, Result};

/// Counters describing limiter activity.
#[derive(Debug, Default)]
pub struct LimiterStats {
    checks: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    faults: AtomicU64,
    sweeps: AtomicU64,
    swept: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub checks: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub faults: u64,
    pub sweeps: u64,
    pub swept: u64,
}

impl LimiterStats {
    fn record_decision(&self, admitted: bool) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_sweep(&self, removed: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept.fetch_add(removed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

/// Per-client admission control over fixed or sliding windows.
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// per-client state lives in the injected [`WindowStore`].
pub struct RateLimiter {
    config: LimiterConfig,
    store: Arc<dyn WindowStore>,
    extractor: Arc<dyn KeyExtractor>,
    clock: Arc<dyn Clock>,
    stats: LimiterStats,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("tracked_clients", &self.store.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter from a configuration.
    ///
    /// Fails if the configuration is invalid. The store and key extractor are
    /// chosen from the configuration and the wall clock is used; each can be
    /// replaced before the limiter is shared.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn WindowStore> = match config.store {
            StoreKind::Sharded => Arc::new(ShardedStore::new()),
            StoreKind::Locked => Arc::new(LockedStore::new()),
        };
        let extractor: Arc<dyn KeyExtractor> = match &config.key_header {
            Some(header) => Arc::new(HeaderKey::new(header.clone())),
            None => Arc::new(PeerAddr),
        };

        debug!(
            limit = config.limit,
            window_ms = config.window_ms,
            policy = ?config.policy,
            store = ?config.store,
            "Rate limiter created"
        );

        Ok(Self {
            config,
            store,
            extractor,
            clock: Arc::new(SystemClock),
            stats: LimiterStats::default(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_key_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Decide whether a request from `key` at `now` is admitted.
    ///
    /// Admitted requests are recorded against the client's window; rejected
    /// requests consume no budget.
    pub fn check_and_record(&self, key: &ClientKey, now: u64) -> Decision {
        let LimiterConfig {
            limit,
            window_ms,
            policy,
            ..
        } = self.config;

        let admission = self.store.update(
            key,
            &mut || {
                debug!(client = %key, policy = ?policy, "Tracking new client");
                ClientWindow::new(policy, now)
            },
            &mut |window: &mut ClientWindow| window.record(now, limit, window_ms),
        );

        let decision = Decision::from_admission(admission, limit);
        self.stats.record_decision(decision.admitted);

        trace!(
            client = %key,
            now = now,
            admitted = decision.admitted,
            remaining = decision.remaining,
            "Checked rate limit"
        );

        if !decision.admitted {
            debug!(
                client = %key,
                limit = limit,
                reset_at_ms = decision.reset_at_ms,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Key the request and check it against the current time.
    ///
    /// A request without a usable key and a failing clock are both reported
    /// as errors; neither is turned into an admission outcome here.
    pub fn check_request(&self, request: &RequestMeta) -> Result<Decision> {
        let key = self.extractor.extract(request).ok_or_else(|| {
            RateKeeperError::MissingKey(match &self.config.key_header {
                Some(header) => format!("header {header} absent or empty"),
                None => "peer address unknown".to_string(),
            })
        })?;
        let now = self.clock.now_millis()?;
        Ok(self.check_and_record(&key, now))
    }

    /// Like [`check_request`](Self::check_request), with faults resolved by
    /// the configured [`FaultMode`].
    pub fn check_request_or_fallback(&self, request: &RequestMeta) -> Decision {
        match self.check_request(request) {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                let admitted = self.config.on_fault == FaultMode::Open;
                warn!(
                    error = %e,
                    on_fault = ?self.config.on_fault,
                    "Rate limit check failed, applying fault mode"
                );
                Decision::fallback(admitted, self.config.limit)
            }
        }
    }

    /// Remove records with no admitted request within the window.
    ///
    /// Returns the number of removed records. Sweeping again at the same
    /// instant removes nothing.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let window_ms = self.config.window_ms;
        let removed = self
            .store
            .sweep(&|window: &ClientWindow| window.is_stale(now, window_ms));
        self.stats.record_sweep(removed);

        debug!(
            removed = removed,
            remaining = self.store.len(),
            "Swept expired client windows"
        );
        removed
    }

    /// Sweep against the limiter's clock.
    pub fn sweep_now(&self) -> Result<usize> {
        let now = self.clock.now_millis()?;
        Ok(self.sweep_expired(now))
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.store.len()
    }

    /// Snapshot of a client's window, if tracked.
    pub fn window_of(&self, key: &ClientKey) -> Option<ClientWindow> {
        self.store.get(key)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Forget every client.
    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::window::{Policy, WindowState};
    use futures::future::join_all;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(limit: u64, window_ms: u64, policy: Policy) -> RateLimiter {
        RateLimiter::new(LimiterConfig::new(limit, window_ms).with_policy(policy)).unwrap()
    }

    fn both_policies() -> [Policy; 2] {
        [Policy::FixedWindow, Policy::SlidingWindow]
    }

    #[derive(Debug)]
    struct BrokenClock;

    impl Clock for BrokenClock {
        fn now_millis(&self) -> Result<u64> {
            Err(RateKeeperError::Clock("clock unavailable".to_string()))
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_setup() {
        assert!(matches!(
            RateLimiter::new(LimiterConfig::new(0, 1000)),
            Err(RateKeeperError::Config(_))
        ));
        assert!(matches!(
            RateLimiter::new(LimiterConfig::new(3, 0)),
            Err(RateKeeperError::Config(_))
        ));
    }

    #[test]
    fn test_budget_exhausted_then_window_resets() {
        for policy in both_policies() {
            let limiter = limiter(3, 1000, policy);
            let a = ClientKey::from("A");

            for t in [0, 10, 20] {
                assert!(limiter.check_and_record(&a, t).admitted, "{policy:?} t={t}");
            }
            assert!(!limiter.check_and_record(&a, 30).admitted);
            assert!(limiter.check_and_record(&a, 1005).admitted);
        }
    }

    #[test]
    fn test_fixed_window_decision_metadata() {
        let limiter = limiter(3, 1000, Policy::FixedWindow);
        let a = ClientKey::from("A");

        let first = limiter.check_and_record(&a, 0);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at_ms, 1000);

        limiter.check_and_record(&a, 10);
        limiter.check_and_record(&a, 20);
        let rejected = limiter.check_and_record(&a, 30);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.status_code(), 429);
        assert_eq!(rejected.retry_after_secs(30), 1);
    }

    #[test]
    fn test_fixed_window_boundary_starts_new_window() {
        let limiter = limiter(1, 1000, Policy::FixedWindow);
        let a = ClientKey::from("A");

        assert!(limiter.check_and_record(&a, 0).admitted);
        assert!(!limiter.check_and_record(&a, 999).admitted);
        assert!(limiter.check_and_record(&a, 1000).admitted);
    }

    #[test]
    fn test_clients_have_independent_budgets() {
        for policy in both_policies() {
            let limiter = limiter(2, 1000, policy);
            let a = ClientKey::from("A");
            let b = ClientKey::from("B");

            limiter.check_and_record(&a, 0);
            limiter.check_and_record(&a, 1);
            assert!(!limiter.check_and_record(&a, 2).admitted);

            assert!(limiter.check_and_record(&b, 3).admitted);
            assert!(limiter.check_and_record(&b, 4).admitted);
            assert_eq!(limiter.tracked_clients(), 2);
        }
    }

    #[test]
    fn test_rejection_does_not_consume_budget() {
        let limiter = limiter(2, 1000, Policy::FixedWindow);
        let a = ClientKey::from("A");

        limiter.check_and_record(&a, 0);
        limiter.check_and_record(&a, 1);
        for t in 2..50 {
            limiter.check_and_record(&a, t);
        }

        assert_eq!(limiter.window_of(&a).map(|w| w.count()), Some(2));
    }

    #[test]
    fn test_sliding_window_never_exceeds_limit_in_any_window() {
        let limit = 4;
        let window_ms = 100;
        let limiter = limiter(limit, window_ms, Policy::SlidingWindow);
        let a = ClientKey::from("A");

        // Bursty arrivals every 7ms with occasional gaps.
        let mut admitted = Vec::new();
        let mut t = 0;
        for i in 0..300u64 {
            t += if i % 25 == 0 { 60 } else { 7 };
            if limiter.check_and_record(&a, t).admitted {
                admitted.push(t);
            }
        }

        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&ts| ts - start < window_ms)
                .count() as u64;
            assert!(in_window <= limit, "window at {start} admitted {in_window}");
        }
    }

    #[test]
    fn test_fixed_window_never_exceeds_limit_per_window() {
        let limiter = limiter(5, 1000, Policy::FixedWindow);
        let a = ClientKey::from("A");
        let mut per_window = std::collections::HashMap::new();

        for t in (0..10_000u64).step_by(13) {
            if limiter.check_and_record(&a, t).admitted {
                if let Some(WindowState::Fixed { window_start, .. }) =
                    limiter.window_of(&a).map(|w| w.state().clone())
                {
                    *per_window.entry(window_start).or_insert(0u64) += 1;
                }
            }
        }

        assert!(!per_window.is_empty());
        assert!(per_window.values().all(|&n| n <= 5));
    }

    #[test]
    fn test_sweep_removes_inactive_client() {
        for policy in both_policies() {
            let limiter = limiter(3, 1000, policy);
            let a = ClientKey::from("A");

            limiter.check_and_record(&a, 500);
            assert_eq!(limiter.sweep_expired(2000), 1);
            assert!(limiter.window_of(&a).is_none());

            // Seen again as a brand new client
            let decision = limiter.check_and_record(&a, 2001);
            assert!(decision.admitted);
            assert_eq!(decision.remaining, 2);
        }
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let limiter = limiter(3, 1000, Policy::FixedWindow);
        limiter.check_and_record(&ClientKey::from("A"), 0);
        limiter.check_and_record(&ClientKey::from("B"), 900);

        assert_eq!(limiter.sweep_expired(1500), 1);
        let after_first = limiter.window_of(&ClientKey::from("B"));
        assert_eq!(limiter.sweep_expired(1500), 0);

        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.window_of(&ClientKey::from("B")), after_first);
    }

    #[test]
    fn test_sweep_bounds_memory_to_active_clients() {
        for policy in both_policies() {
            let limiter = limiter(10, 1000, policy);

            for i in 0..100u64 {
                limiter.check_and_record(&ClientKey::new(format!("old-{i}")), i);
            }
            for i in 0..7u64 {
                limiter.check_and_record(&ClientKey::new(format!("new-{i}")), 1500 + i);
            }

            limiter.sweep_expired(2000);
            assert_eq!(limiter.tracked_clients(), 7);
        }
    }

    #[test]
    fn test_rejected_requests_do_not_keep_client_alive() {
        let limiter = limiter(1, 1000, Policy::SlidingWindow);
        let a = ClientKey::from("A");

        limiter.check_and_record(&a, 0);
        limiter.check_and_record(&a, 500);

        assert_eq!(limiter.sweep_expired(1000), 1);
    }

    #[test]
    fn test_concurrent_threads_admit_exactly_limit() {
        for policy in both_policies() {
            let limiter = Arc::new(limiter(5, 1000, policy));
            let barrier = Arc::new(Barrier::new(10));

            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        limiter.check_and_record(&ClientKey::from("A"), 42).admitted
                    })
                })
                .collect();

            let admitted = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&admitted| admitted)
                .count();

            assert_eq!(admitted, 5);
            let stats = limiter.stats();
            assert_eq!(stats.admitted, 5);
            assert_eq!(stats.rejected, 5);
        }
    }

    #[test]
    fn test_concurrent_sweeps_do_not_leak_admissions() {
        for policy in both_policies() {
            for _ in 0..20 {
                let limiter = Arc::new(limiter(5, 1000, policy));
                let stop = Arc::new(AtomicBool::new(false));

                let sweeper = {
                    let limiter = Arc::clone(&limiter);
                    let stop = Arc::clone(&stop);
                    thread::spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            limiter.sweep_expired(42);
                        }
                    })
                };

                let barrier = Arc::new(Barrier::new(16));
                let handles: Vec<_> = (0..16)
                    .map(|_| {
                        let limiter = Arc::clone(&limiter);
                        let barrier = Arc::clone(&barrier);
                        thread::spawn(move || {
                            barrier.wait();
                            (0..50)
                                .filter(|_| {
                                    limiter.check_and_record(&ClientKey::from("A"), 42).admitted
                                })
                                .count()
                        })
                    })
                    .collect();

                let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
                stop.store(true, Ordering::Relaxed);
                sweeper.join().unwrap();

                assert_eq!(admitted, 5, "{policy:?}");
                assert_eq!(limiter.window_of(&ClientKey::from("A")).map(|w| w.count()), Some(5));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_admit_exactly_limit() {
        let config = LimiterConfig::new(5, 1000).with_store(StoreKind::Locked);
        let limiter = Arc::new(RateLimiter::new(config).unwrap());

        let tasks = (0..10).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check_and_record(&ClientKey::from("A"), 7) })
        });

        let decisions: Vec<Decision> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(decisions.iter().filter(|d| d.admitted).count(), 5);
        assert_eq!(decisions.iter().filter(|d| !d.admitted).count(), 5);
    }

    #[test]
    fn test_check_request_uses_peer_address_and_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1, 1000, Policy::FixedWindow).with_clock(clock.clone());
        let request = RequestMeta::new().with_peer("192.0.2.1:4000".parse().unwrap());

        assert!(assert_ok!(limiter.check_request(&request)).admitted);
        assert!(!assert_ok!(limiter.check_request(&request)).admitted);

        clock.advance(1000);
        assert!(assert_ok!(limiter.check_request(&request)).admitted);
        assert!(limiter.window_of(&ClientKey::from("192.0.2.1")).is_some());
    }

    #[test]
    fn test_check_request_with_header_key() {
        let mut config = LimiterConfig::new(1, 1000);
        config.key_header = Some("X-Api-Key".to_string());
        let limiter = RateLimiter::new(config)
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(0)));

        let alice = RequestMeta::new().with_header("x-api-key", "alice");
        let bob = RequestMeta::new().with_header("x-api-key", "bob");

        assert!(assert_ok!(limiter.check_request(&alice)).admitted);
        assert!(assert_ok!(limiter.check_request(&bob)).admitted);
        assert!(!assert_ok!(limiter.check_request(&alice)).admitted);
    }

    #[test]
    fn test_custom_key_extractor() {
        let extractor = |request: &RequestMeta| request.header("x-tenant").map(ClientKey::from);
        let limiter = limiter(1, 1000, Policy::FixedWindow)
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_key_extractor(Arc::new(extractor));

        let request = RequestMeta::new().with_header("X-Tenant", "acme");
        assert_ok!(limiter.check_request(&request));
        assert!(limiter.window_of(&ClientKey::from("acme")).is_some());
    }

    #[test]
    fn test_missing_key_propagates() {
        let limiter = limiter(1, 1000, Policy::FixedWindow);
        let err = assert_err!(limiter.check_request(&RequestMeta::new()));

        assert!(matches!(err, RateKeeperError::MissingKey(_)));
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_clock_fault_propagates() {
        let limiter = limiter(1, 1000, Policy::FixedWindow).with_clock(Arc::new(BrokenClock));
        let request = RequestMeta::new().with_peer("192.0.2.1:4000".parse().unwrap());

        let err = assert_err!(limiter.check_request(&request));
        assert!(matches!(err, RateKeeperError::Clock(_)));
        assert!(limiter.sweep_now().is_err());
    }

    #[test]
    fn test_fault_mode_closed_rejects() {
        let limiter = limiter(1, 1000, Policy::FixedWindow).with_clock(Arc::new(BrokenClock));
        let decision = limiter.check_request_or_fallback(&RequestMeta::new());

        assert!(!decision.admitted);
        assert_eq!(decision.status_code(), 429);
        assert!(!decision.reset_known());
        assert!(decision
            .headers(0)
            .iter()
            .all(|(name, _)| *name != crate::ratelimit::HEADER_RESET));
        assert_eq!(limiter.stats().faults, 1);
    }

    #[test]
    fn test_fault_mode_open_admits() {
        let config = LimiterConfig::new(1, 1000).with_fault_mode(FaultMode::Open);
        let limiter = RateLimiter::new(config)
            .unwrap()
            .with_clock(Arc::new(BrokenClock));
        let request = RequestMeta::new().with_peer("192.0.2.1:4000".parse().unwrap());

        assert!(limiter.check_request_or_fallback(&request).admitted);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_injected_store_is_used() {
        let store = Arc::new(LockedStore::new());
        let limiter = limiter(3, 1000, Policy::FixedWindow).with_store(store.clone());

        limiter.check_and_record(&ClientKey::from("A"), 0);
        assert_eq!(store.len(), 1);

        limiter.clear();
        assert!(store.is_empty());
    }
}
