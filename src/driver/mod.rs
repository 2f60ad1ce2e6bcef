//! Drivers that feed the limiter from traces or synthetic load.
//!
//! These back the `slidegate` binary. Both operate on string keys.

mod replay;
mod simulate;

pub use replay::{replay, OutputFormat, ReplaySummary, TraceEvent};
pub use simulate::{simulate, SimulationOptions, SimulationStats};
