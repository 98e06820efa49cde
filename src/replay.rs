//! Deterministic replay of request traces.
//!
//! A trace is a text stream with one request per line, `<t_ms> <client>`.
//! Blank lines and lines starting with `#` are ignored. Timestamps must not
//! decrease.

use serde::Serialize;
use std::io::BufRead;
use tracing::debug;

use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{ClientKey, Decision, RateLimiter};

/// A single request in a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// 1-based source line
    pub line: usize,
    pub at_ms: u64,
    pub client: ClientKey,
}

/// Decision taken for a trace event.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayRecord {
    pub line: usize,
    pub at_ms: u64,
    pub client: String,
    pub status: u16,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Totals for a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub requests: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub swept: u64,
    pub tracked_at_end: u64,
}

/// Parse a trace from a reader.
pub fn parse_trace<R: BufRead>(reader: R) -> Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    let mut last_at = 0;

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let event = parse_line(line_no, text)?;
        if event.at_ms < last_at {
            return Err(RateKeeperError::Trace {
                line: line_no,
                reason: format!("timestamp {} is before {}", event.at_ms, last_at),
            });
        }
        last_at = event.at_ms;
        events.push(event);
    }

    Ok(events)
}

fn parse_line(line: usize, text: &str) -> Result<TraceEvent> {
    let mut fields = text.split_whitespace();
    let (Some(at), Some(client), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(RateKeeperError::Trace {
            line,
            reason: "expected `<t_ms> <client>`".to_string(),
        });
    };

    let at_ms = at.parse::<u64>().map_err(|e| RateKeeperError::Trace {
        line,
        reason: format!("invalid timestamp {at:?}: {e}"),
    })?;

    Ok(TraceEvent {
        line,
        at_ms,
        client: ClientKey::from(client),
    })
}

/// Run `events` through `limiter`.
///
/// When `sweep_every_ms` is set, [`RateLimiter::sweep_expired`] runs at trace
/// time before the first event at or past each sweep deadline.
pub fn replay<F>(
    limiter: &RateLimiter,
    events: &[TraceEvent],
    sweep_every_ms: Option<u64>,
    mut on_record: F,
) -> ReplaySummary
where
    F: FnMut(&ReplayRecord),
{
    let mut summary = ReplaySummary::default();
    let mut next_sweep = events
        .first()
        .zip(sweep_every_ms)
        .map(|(first, every)| first.at_ms.saturating_add(every));

    for event in events {
        if let (Some(deadline), Some(every)) = (next_sweep, sweep_every_ms) {
            if event.at_ms >= deadline {
                summary.swept += limiter.sweep_expired(event.at_ms) as u64;
                next_sweep = Some(event.at_ms.saturating_add(every));
            }
        }

        let decision = limiter.check_and_record(&event.client, event.at_ms);
        summary.requests += 1;
        if decision.admitted {
            summary.admitted += 1;
        } else {
            summary.rejected += 1;
        }

        on_record(&ReplayRecord {
            line: event.line,
            at_ms: event.at_ms,
            client: event.client.as_str().to_owned(),
            status: decision.status_code(),
            decision,
        });
    }

    summary.tracked_at_end = limiter.tracked_clients() as u64;
    debug!(
        requests = summary.requests,
        admitted = summary.admitted,
        rejected = summary.rejected,
        "Replay finished"
    );
    summary
}
