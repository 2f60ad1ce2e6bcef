//! Per-key request log.

use std::collections::VecDeque;

use super::clock::Timestamp;

/// Upper bound on the capacity reserved up front for a new log.
const PREALLOCATE_LIMIT: usize = 64;

/// The accepted timestamps for a single key, oldest first.
///
/// After every admission decision the log holds at most `max_requests`
/// entries, so a ring buffer sized to the capacity never reallocates.
#[derive(Debug, Clone)]
pub struct RequestLog {
    /// Accepted timestamps in ascending order (duplicates allowed)
    entries: VecDeque<Timestamp>,
    /// Newest timestamp ever supplied for this key, accepted or not
    latest_seen: Option<Timestamp>,
}

impl RequestLog {
    /// Create an empty log sized for `max_requests` entries.
    pub fn with_capacity(max_requests: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_requests.min(PREALLOCATE_LIMIT)),
            latest_seen: None,
        }
    }

    /// Drop every entry that has fallen out of the window ending at `now`.
    ///
    /// An entry `e` is expired when `e <= now - window`, so the live window is
    /// the half-open interval `(now - window, now]`. Returns the number evicted.
    pub fn evict_expired(&mut self, now: Timestamp, window: Timestamp) -> usize {
        let mut evicted = 0;
        while let Some(&oldest) = self.entries.front() {
            if !is_expired(oldest, now, window) {
                break;
            }
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Append a timestamp that is not older than anything already logged.
    pub fn push(&mut self, timestamp: Timestamp) {
        debug_assert!(self.entries.back().map_or(true, |&last| last <= timestamp));
        self.entries.push_back(timestamp);
    }

    /// Insert a timestamp at its sorted position, after any equal entries.
    pub fn insert_sorted(&mut self, timestamp: Timestamp) {
        let index = self.entries.partition_point(|&e| e <= timestamp);
        self.entries.insert(index, timestamp);
    }

    /// Record that `timestamp` was supplied for this key.
    pub fn observe(&mut self, timestamp: Timestamp) {
        self.latest_seen = Some(self.latest_seen.map_or(timestamp, |t| t.max(timestamp)));
    }

    /// Newest timestamp ever supplied for this key.
    pub fn latest_seen(&self) -> Option<Timestamp> {
        self.latest_seen
    }

    /// Most recent accepted timestamp.
    pub fn newest(&self) -> Option<Timestamp> {
        self.entries.back().copied()
    }

    /// Whether every logged timestamp has expired relative to `now`.
    ///
    /// Only the newest entry is inspected; the ascending order guarantees
    /// that everything before it is at least as old. An empty log is stale.
    pub fn is_stale(&self, now: Timestamp, window: Timestamp) -> bool {
        self.newest().map_or(true, |last| is_expired(last, now, window))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.entries.iter().copied()
    }
}

/// `entry <= now - window`. Nothing has expired while `now < window`.
fn is_expired(entry: Timestamp, now: Timestamp, window: Timestamp) -> bool {
    now.checked_sub(window).map_or(false, |cutoff| entry <= cutoff)
}
