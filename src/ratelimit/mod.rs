//! Sliding window log rate limiting and per-key state.

mod clock;
mod limit;
mod limiter;
mod log;

pub use clock::{Clock, ClockUnit, ManualClock, Timestamp, UnixClock};
pub use limit::{LimitConfig, OutOfOrderPolicy};
pub use limiter::{Decision, RateLimiter};
pub use log::RequestLog;
