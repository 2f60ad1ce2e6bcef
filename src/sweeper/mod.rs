//! Scheduled reclamation of idle rate limit keys.
//!
//! Admission checks evict expired timestamps lazily, but a key that is never
//! checked again keeps its log forever. The sweeper periodically removes keys
//! whose entire history has expired, bounding memory for processes that see
//! many short-lived keys. It never changes admission decisions.

mod task;

pub use task::{SweepReport, Sweeper, SweeperHandle};
