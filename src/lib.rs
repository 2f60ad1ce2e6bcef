//! Slidegate - Sliding Window Log Rate Limiting
//!
//! This crate implements a per-key sliding window log rate limiter for a
//! single in-process instance. Admission checks are atomic per key and run
//! in parallel across keys; a separate sweeper reclaims keys whose history
//! has fully expired so that long-lived processes do not grow without bound.

pub mod config;
pub mod driver;
pub mod error;
pub mod ratelimit;
pub mod sweeper;
