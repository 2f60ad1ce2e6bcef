//! Core sliding window log rate limiter.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::Timestamp;
use super::limit::{LimitConfig, OutOfOrderPolicy};
use super::log::RequestLog;
use crate::error::{Result, SlidegateError};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request was accepted
    pub allowed: bool,
    /// Accepted requests for the key inside the window after this check
    pub in_window: usize,
    /// Further requests the key may make before the window slides
    pub remaining: usize,
}

/// Per-key sliding window log rate limiter.
///
/// Each key owns an ascending log of the timestamps at which its requests
/// were accepted. Logs live in a sharded concurrent map: an admission check
/// holds the shard lock for its key across evict, count and append, so two
/// checks for the same key can never both see spare capacity. Checks for
/// keys on different shards proceed in parallel.
///
/// This struct is thread-safe and is meant to be shared behind an `Arc`.
pub struct RateLimiter<K: Eq + Hash> {
    /// Request logs indexed by key
    logs: DashMap<K, RequestLog>,
    /// Window, capacity and ordering policy
    config: LimitConfig,
}

impl<K: Eq + Hash + Debug> RateLimiter<K> {
    /// Create a new rate limiter.
    pub fn new(config: LimitConfig) -> Self {
        debug!(
            window = config.window(),
            max_requests = config.max_requests(),
            out_of_order = ?config.out_of_order(),
            "Creating rate limiter"
        );
        Self {
            logs: DashMap::new(),
            config,
        }
    }

    /// Decide whether a request for `key` at `timestamp` is admitted.
    ///
    /// Timestamps for a given key are expected to be non-decreasing. An
    /// out-of-order timestamp refused by [`OutOfOrderPolicy::Reject`] is
    /// reported as a rejection.
    pub fn allow_request(&self, timestamp: Timestamp, key: K) -> bool {
        match self.try_allow_request(timestamp, key) {
            Ok(decision) => decision.allowed,
            Err(e) => {
                warn!(error = %e, "Refusing request");
                false
            }
        }
    }

    /// Like [`allow_request`](Self::allow_request), but reports the full
    /// decision and surfaces out-of-order timestamps as an error.
    pub fn try_allow_request(&self, timestamp: Timestamp, key: K) -> Result<Decision> {
        trace!(key = ?key, timestamp = timestamp, "Checking rate limit");

        let window = self.config.window();
        let max_requests = self.config.max_requests();

        // The guard holds the shard lock until this function returns.
        let mut log = match self.logs.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                debug!(key = ?entry.key(), "Tracking new key");
                entry.insert(RequestLog::with_capacity(max_requests))
            }
        };

        if let Some(latest) = log.latest_seen() {
            if timestamp < latest && self.config.out_of_order() == OutOfOrderPolicy::Reject {
                return Err(SlidegateError::OutOfOrder { timestamp, latest });
            }
        }
        log.observe(timestamp);

        let evicted = log.evict_expired(timestamp, window);
        if evicted > 0 {
            trace!(key = ?log.key(), evicted = evicted, "Evicted expired timestamps");
        }

        if log.len() >= max_requests {
            debug!(
                key = ?log.key(),
                timestamp = timestamp,
                limit = max_requests,
                "Rate limit exceeded"
            );
            return Ok(Decision {
                allowed: false,
                in_window: log.len(),
                remaining: 0,
            });
        }

        if log.newest().map_or(true, |newest| newest <= timestamp) {
            log.push(timestamp);
        } else {
            log.insert_sorted(timestamp);
        }

        Ok(Decision {
            allowed: true,
            in_window: log.len(),
            remaining: max_requests - log.len(),
        })
    }

    /// Remove every key whose newest accepted timestamp has expired at `now`.
    ///
    /// Each shard is write-locked while it is swept, so a key is never
    /// deleted out from under an in-flight admission check. Returns the
    /// number of keys removed.
    pub fn prune_inactive(&self, now: Timestamp) -> usize {
        let window = self.config.window();
        let mut removed = 0;

        self.logs.retain(|_, log| {
            let stale = log.is_stale(now, window);
            if stale {
                removed += 1;
            }
            !stale
        });

        debug!(
            now = now,
            removed = removed,
            remaining = self.logs.len(),
            "Pruned inactive keys"
        );
        removed
    }

    /// Get the limiter's configuration.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Get the number of keys currently holding a log.
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Get the number of logged timestamps for a key.
    ///
    /// Returns `None` if the key is not tracked. The count reflects the last
    /// check for the key and may include entries that have since expired.
    pub fn log_len<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.logs.get(key).map(|log| log.len())
    }

    /// Copy out the logged timestamps for a key, oldest first.
    pub fn log_snapshot<Q>(&self, key: &Q) -> Option<Vec<Timestamp>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.logs.get(key).map(|log| log.iter().collect())
    }

    /// Clear all logs.
    pub fn clear(&self) {
        self.logs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn limiter(window: Timestamp, max_requests: usize) -> RateLimiter<u32> {
        RateLimiter::new(LimitConfig::new(window, max_requests).unwrap())
    }

    #[test]
    fn test_allows_up_to_capacity_within_window() {
        let limiter = limiter(30, 3);

        assert!(limiter.allow_request(10, 1));
        assert!(limiter.allow_request(15, 1));
        assert!(limiter.allow_request(20, 1));
        assert!(!limiter.allow_request(25, 1));
        // 10 has expired: 10 <= 41 - 30
        assert!(limiter.allow_request(41, 1));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(30, 3);

        for t in 10..13 {
            assert!(limiter.allow_request(t, 1));
            assert!(limiter.allow_request(t, 2));
        }

        assert!(!limiter.allow_request(13, 1));
        assert!(!limiter.allow_request(13, 2));
        assert!(limiter.allow_request(13, 3));
    }

    #[test]
    fn test_window_boundary_is_half_open() {
        let limiter = limiter(30, 1);

        assert!(limiter.allow_request(10, 1));
        // Still counted one tick before the window closes
        assert!(!limiter.allow_request(39, 1));
        // Exactly `window` old is expired
        assert!(limiter.allow_request(40, 1));
    }

    #[test]
    fn test_epoch_scale_timestamps() {
        let limiter = limiter(30, 3);

        assert!(limiter.allow_request(1_700_000_010, 1));
        assert!(limiter.allow_request(1_700_000_011, 2));
        assert!(limiter.allow_request(1_700_000_020, 1));
        assert!(limiter.allow_request(1_700_000_035, 1));
        assert!(limiter.allow_request(1_700_000_040, 1));
    }

    #[test]
    fn test_identical_timestamps_all_count() {
        let limiter = limiter(30, 3);

        assert!(limiter.allow_request(50, 7));
        assert!(limiter.allow_request(50, 7));
        assert!(limiter.allow_request(50, 7));
        assert!(!limiter.allow_request(50, 7));
        assert_eq!(limiter.log_snapshot(&7), Some(vec![50, 50, 50]));
    }

    #[test]
    fn test_rejection_does_not_append() {
        let limiter = limiter(30, 2);

        limiter.allow_request(10, 1);
        limiter.allow_request(20, 1);
        assert_eq!(limiter.log_snapshot(&1), Some(vec![10, 20]));

        let decision = limiter.try_allow_request(25, 1).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(limiter.log_snapshot(&1), Some(vec![10, 20]));

        // Once 10 expires its slot is reused
        let decision = limiter.try_allow_request(40, 1).unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.log_snapshot(&1), Some(vec![20, 40]));
    }

    #[test]
    fn test_decision_reports_window_usage() {
        let limiter = limiter(30, 3);

        let first = limiter.try_allow_request(10, 1).unwrap();
        assert_eq!(
            first,
            Decision {
                allowed: true,
                in_window: 1,
                remaining: 2
            }
        );

        limiter.allow_request(11, 1);
        let third = limiter.try_allow_request(12, 1).unwrap();
        assert_eq!(third.in_window, 3);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn test_out_of_order_rejected_by_default() {
        let limiter = limiter(30, 3);

        assert!(limiter.allow_request(20, 1));
        let err = limiter.try_allow_request(15, 1).unwrap_err();
        assert!(matches!(
            err,
            SlidegateError::OutOfOrder {
                timestamp: 15,
                latest: 20
            }
        ));
        assert!(!limiter.allow_request(15, 1));
        assert_eq!(limiter.log_snapshot(&1), Some(vec![20]));

        // Other keys keep their own clocks
        assert!(limiter.allow_request(5, 2));
    }

    #[test]
    fn test_out_of_order_after_rejection_is_detected() {
        let limiter = limiter(30, 1);

        assert!(limiter.allow_request(10, 1));
        assert!(!limiter.allow_request(30, 1));
        // 25 precedes the rejected 30, even though the log only holds 10
        assert!(matches!(
            limiter.try_allow_request(25, 1),
            Err(SlidegateError::OutOfOrder { latest: 30, .. })
        ));
    }

    #[test]
    fn test_out_of_order_inserted_in_sorted_position() {
        let config = LimitConfig::new(30, 4)
            .unwrap()
            .with_out_of_order(OutOfOrderPolicy::Insert);
        let limiter: RateLimiter<u32> = RateLimiter::new(config);

        assert!(limiter.allow_request(20, 1));
        assert!(limiter.allow_request(30, 1));
        assert!(limiter.allow_request(25, 1));
        assert_eq!(limiter.log_snapshot(&1), Some(vec![20, 25, 30]));

        // The sweeper still sees 30 as the newest entry
        assert_eq!(limiter.prune_inactive(59), 0);
        assert_eq!(limiter.prune_inactive(60), 1);
    }

    #[test]
    fn test_insert_policy_does_not_recount_evicted_history() {
        let config = LimitConfig::new(10, 2)
            .unwrap()
            .with_out_of_order(OutOfOrderPolicy::Insert);
        let limiter: RateLimiter<u32> = RateLimiter::new(config);

        assert!(limiter.allow_request(20, 1));
        assert!(limiter.allow_request(21, 1));
        // 35 evicts both earlier entries
        assert!(limiter.allow_request(35, 1));
        // 24 only sees 35 in the log, so (14, 24] ends up with three accepts
        assert!(limiter.allow_request(24, 1));
        assert_eq!(limiter.log_snapshot(&1), Some(vec![24, 35]));
    }

    #[test]
    fn test_config_accessor() {
        let limiter = limiter(30, 3);
        assert_eq!(limiter.config().window(), 30);
        assert_eq!(limiter.config().max_requests(), 3);
        assert_eq!(limiter.config().out_of_order(), OutOfOrderPolicy::Reject);
    }

    #[test]
    fn test_prune_removes_fully_expired_keys() {
        let limiter = limiter(30, 3);

        limiter.allow_request(10, 1);
        limiter.allow_request(11, 2);
        limiter.allow_request(12, 3);

        assert_eq!(limiter.prune_inactive(100), 3);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_prune_retains_recent_keys() {
        let limiter = limiter(30, 3);

        limiter.allow_request(71, 1);
        limiter.allow_request(72, 2);
        limiter.allow_request(10, 3);

        assert_eq!(limiter.prune_inactive(100), 1);
        assert_eq!(limiter.tracked_keys(), 2);
        assert!(limiter.log_len(&1).is_some());
        assert!(limiter.log_len(&2).is_some());
        assert!(limiter.log_len(&3).is_none());
    }

    #[test]
    fn test_prune_is_idempotent() {
        let limiter = limiter(30, 3);

        limiter.allow_request(71, 1);
        limiter.allow_request(10, 2);

        limiter.prune_inactive(100);
        let after_once = limiter.tracked_keys();
        assert_eq!(limiter.prune_inactive(100), 0);
        assert_eq!(limiter.tracked_keys(), after_once);
    }

    #[test]
    fn test_prune_does_not_affect_decisions() {
        let pruned = limiter(30, 2);
        let unpruned = limiter(30, 2);

        for (t, key) in [(10, 1), (11, 1), (12, 1), (45, 1), (46, 2), (80, 1), (81, 1)] {
            pruned.prune_inactive(t);
            assert_eq!(pruned.allow_request(t, key), unpruned.allow_request(t, key));
        }
    }

    #[test]
    fn test_string_keys_borrow_lookup() {
        let limiter: RateLimiter<String> = RateLimiter::new(LimitConfig::new(30, 3).unwrap());

        limiter.allow_request(10, "alice".to_string());
        assert_eq!(limiter.log_len("alice"), Some(1));
        assert_eq!(limiter.log_len("bob"), None);
    }

    #[test]
    fn test_capacity_holds_at_top_of_timestamp_range() {
        let limiter = limiter(30, 1);

        assert!(limiter.allow_request(u64::MAX - 1, 1));
        assert!(!limiter.allow_request(u64::MAX, 1));
        assert_eq!(limiter.log_snapshot(&1), Some(vec![u64::MAX - 1]));

        assert!(limiter.allow_request(u64::MAX, 2));
        assert!(!limiter.allow_request(u64::MAX, 2));
    }

    #[test]
    fn test_prune_keeps_live_keys_at_top_of_timestamp_range() {
        let limiter = limiter(30, 3);

        limiter.allow_request(u64::MAX - 5, 1);
        limiter.allow_request(u64::MAX - 30, 2);

        assert_eq!(limiter.prune_inactive(u64::MAX), 1);
        assert!(limiter.log_len(&1).is_some());
        assert!(limiter.log_len(&2).is_none());
    }

    #[test]
    fn test_clear() {
        let limiter = limiter(30, 3);

        limiter.allow_request(10, 1);
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_capacity_invariant_against_reference_model() {
        let window = 10;
        let max_requests = 3;
        let limiter = limiter(window, max_requests);
        let mut accepted: Vec<Vec<Timestamp>> = vec![Vec::new(); 4];
        let mut rng = StdRng::seed_from_u64(7);
        let mut now = 0;

        for _ in 0..2000 {
            now += rng.gen_range(0..4);
            let key = rng.gen_range(0..4u32);
            let history = &mut accepted[key as usize];

            let live = history.iter().filter(|&&t| t + window > now).count();
            let allowed = limiter.allow_request(now, key);
            assert_eq!(allowed, live < max_requests, "key {} at {}", key, now);

            if allowed {
                history.push(now);
            }
            let in_window = history.iter().filter(|&&t| t + window > now).count();
            assert!(in_window <= max_requests);

            if rng.gen_bool(0.05) {
                limiter.prune_inactive(now);
            }
        }
    }

    #[test]
    fn test_concurrent_same_key_never_exceeds_capacity() {
        let limiter = Arc::new(limiter(30, 5));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let accepted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        if limiter.allow_request(100, 1) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.log_len(&1), Some(5));
    }

    #[test]
    fn test_concurrent_prune_does_not_reset_live_keys() {
        let limiter = Arc::new(limiter(30, 5));
        let accepted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let mut handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let accepted = Arc::clone(&accepted);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for key in 0..50u32 {
                        for _ in 0..10 {
                            if limiter.allow_request(100, key) {
                                accepted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                })
            })
            .collect();

        let sweeper = Arc::clone(&limiter);
        let sweep_barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            sweep_barrier.wait();
            for _ in 0..200 {
                // 100 is still live at 129, so nothing may be removed
                sweeper.prune_inactive(129);
            }
        }));

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 50 * 5);
        assert_eq!(limiter.tracked_keys(), 50);
    }
}
