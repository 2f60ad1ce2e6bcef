//! Replay of recorded request traces.
//!
//! A trace holds one event per line:
//!
//! ```text
//! # comment
//! 10 alice
//! 15 bob
//! prune 100
//! ```
//!
//! `<timestamp> <key>` runs an admission check, `prune <now>` runs a sweep.

use std::io::{BufRead, Write};

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{RateLimiter, Timestamp};

/// How replay results are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A single parsed trace line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Request { timestamp: Timestamp, key: String },
    Prune { now: Timestamp },
}

impl TraceEvent {
    /// Parse one line of a trace. Blank lines and `#` comments yield `None`.
    pub fn parse(line_no: usize, line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (first, second) = match fields.as_slice() {
            [first, second] => (*first, *second),
            _ => {
                return Err(trace_error(
                    line_no,
                    format!("expected two fields, found {}", fields.len()),
                ))
            }
        };

        if first == "prune" {
            let now = parse_timestamp(line_no, second)?;
            return Ok(Some(TraceEvent::Prune { now }));
        }

        let timestamp = parse_timestamp(line_no, first)?;
        Ok(Some(TraceEvent::Request {
            timestamp,
            key: second.to_string(),
        }))
    }
}

fn parse_timestamp(line_no: usize, field: &str) -> Result<Timestamp> {
    field
        .parse()
        .map_err(|e| trace_error(line_no, format!("invalid timestamp {:?}: {}", field, e)))
}

fn trace_error(line: usize, reason: String) -> SlidegateError {
    SlidegateError::Trace { line, reason }
}

/// One line of replay output.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ReplayOutcome<'a> {
    Request {
        line: usize,
        timestamp: Timestamp,
        key: &'a str,
        allowed: bool,
        in_window: usize,
        remaining: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Prune {
        line: usize,
        now: Timestamp,
        removed: usize,
        remaining: usize,
    },
}

/// Totals for a completed replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub accepted: usize,
    pub rejected: usize,
    /// Requests refused because their timestamp went backwards
    pub out_of_order: usize,
    pub pruned_keys: usize,
}

/// Run every event in `input` against `limiter`, writing one result per event.
pub fn replay<R, W>(
    limiter: &RateLimiter<String>,
    input: R,
    mut output: W,
    format: OutputFormat,
) -> Result<ReplaySummary>
where
    R: BufRead,
    W: Write,
{
    let mut summary = ReplaySummary::default();

    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;

        let Some(event) = TraceEvent::parse(line_no, &line)? else {
            continue;
        };

        let outcome = match &event {
            TraceEvent::Request { timestamp, key } => {
                let (allowed, in_window, remaining, error) =
                    match limiter.try_allow_request(*timestamp, key.clone()) {
                        Ok(decision) => {
                            if decision.allowed {
                                summary.accepted += 1;
                            } else {
                                summary.rejected += 1;
                            }
                            (decision.allowed, decision.in_window, decision.remaining, None)
                        }
                        Err(e @ SlidegateError::OutOfOrder { .. }) => {
                            summary.out_of_order += 1;
                            let in_window = limiter.log_len(key.as_str()).unwrap_or(0);
                            (false, in_window, 0, Some(e.to_string()))
                        }
                        Err(e) => return Err(e),
                    };

                ReplayOutcome::Request {
                    line: line_no,
                    timestamp: *timestamp,
                    key,
                    allowed,
                    in_window,
                    remaining,
                    error,
                }
            }
            TraceEvent::Prune { now } => {
                let removed = limiter.prune_inactive(*now);
                summary.pruned_keys += removed;
                ReplayOutcome::Prune {
                    line: line_no,
                    now: *now,
                    removed,
                    remaining: limiter.tracked_keys(),
                }
            }
        };

        write_outcome(&mut output, &outcome, format)?;
    }

    debug!(?summary, "Replay finished");
    Ok(summary)
}

fn write_outcome<W: Write>(output: &mut W, outcome: &ReplayOutcome<'_>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer(&mut *output, outcome).map_err(std::io::Error::from)?;
            writeln!(output)?;
        }
        OutputFormat::Text => match outcome {
            ReplayOutcome::Request {
                timestamp,
                key,
                allowed,
                in_window,
                error,
                ..
            } => {
                let verdict = if *allowed { "allowed" } else { "rejected" };
                match error {
                    Some(reason) => writeln!(output, "{} {} {} ({})", timestamp, key, verdict, reason)?,
                    None => writeln!(output, "{} {} {} [{} in window]", timestamp, key, verdict, in_window)?,
                }
            }
            ReplayOutcome::Prune {
                now,
                removed,
                remaining,
                ..
            } => {
                writeln!(output, "prune {} removed {} ({} remaining)", now, removed, remaining)?;
            }
        },
    }
    Ok(())
}
