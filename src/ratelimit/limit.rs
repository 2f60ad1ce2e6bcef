//! Limiter configuration and validation.

use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use crate::error::{Result, SlidegateError};

/// What to do when a key receives a timestamp older than one it has already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfOrderPolicy {
    /// Refuse the request and leave the key's log untouched.
    #[default]
    Reject,
    /// Accept the timestamp into its sorted position in the log.
    ///
    /// A late timestamp is counted only against entries still in the log.
    /// Entries already evicted by a newer call are not reconsidered, so the
    /// per-window capacity can be exceeded for windows ending at a late
    /// timestamp.
    Insert,
}

/// Validated configuration for a [`RateLimiter`](super::RateLimiter).
///
/// Both the window and the capacity are fixed for the lifetime of the limiter;
/// there is no per-key override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    window: Timestamp,
    max_requests: usize,
    out_of_order: OutOfOrderPolicy,
}

impl LimitConfig {
    /// Create a configuration, failing if either the window or the capacity is zero.
    pub fn new(window: Timestamp, max_requests: usize) -> Result<Self> {
        if window == 0 {
            return Err(SlidegateError::Config(
                "window must be a positive duration".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(SlidegateError::Config(
                "max_requests must be a positive integer".to_string(),
            ));
        }

        Ok(Self {
            window,
            max_requests,
            out_of_order: OutOfOrderPolicy::default(),
        })
    }

    /// Replace the out-of-order policy.
    pub fn with_out_of_order(mut self, policy: OutOfOrderPolicy) -> Self {
        self.out_of_order = policy;
        self
    }

    /// Length of the trailing window, in caller clock units.
    pub fn window(&self) -> Timestamp {
        self.window
    }

    /// Maximum number of accepted requests per key inside one window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn out_of_order(&self) -> OutOfOrderPolicy {
        self.out_of_order
    }
}
