//! Per-client window records and the counting policies applied to them.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Counting strategy used to decide admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Count resets when the window that started at the first request expires
    #[default]
    FixedWindow,
    /// Count covers the trailing window ending at the current time
    SlidingWindow,
}

/// Counting state of a [`ClientWindow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowState {
    Fixed { window_start: u64, count: u64 },
    Sliding { timestamps: VecDeque<u64> },
}

/// Result of applying a policy to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request was admitted
    pub admitted: bool,
    /// Requests counted in the window after the decision
    pub used: u64,
    /// When budget next becomes available (ms since the Unix epoch)
    pub reset_at_ms: u64,
}

/// Rate tracking record for a single client.
///
/// Records are created by the first request from a client and only mutated
/// by admitted requests. Window expiry and pruning are applied lazily on the
/// next decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWindow {
    state: WindowState,
    /// Timestamp of the last admitted request
    last_seen: u64,
}

impl ClientWindow {
    /// Create an empty record for the given policy.
    pub fn new(policy: Policy, now: u64) -> Self {
        let state = match policy {
            Policy::FixedWindow => WindowState::Fixed {
                window_start: now,
                count: 0,
            },
            Policy::SlidingWindow => WindowState::Sliding {
                timestamps: VecDeque::new(),
            },
        };

        Self {
            state,
            last_seen: now,
        }
    }

    /// Decide whether a request at `now` fits in the budget, recording it if so.
    pub fn record(&mut self, now: u64, limit: u64, window_ms: u64) -> Admission {
        let admission = match &mut self.state {
            WindowState::Fixed {
                window_start,
                count,
            } => {
                if now.saturating_sub(*window_start) >= window_ms {
                    *window_start = now;
                    *count = 0;
                }

                let admitted = *count < limit;
                if admitted {
                    *count += 1;
                }

                Admission {
                    admitted,
                    used: *count,
                    reset_at_ms: window_start.saturating_add(window_ms),
                }
            }
            WindowState::Sliding { timestamps } => {
                prune(timestamps, now, window_ms);

                let admitted = (timestamps.len() as u64) < limit;
                if admitted {
                    timestamps.push_back(now);
                }

                let oldest = timestamps.front().copied().unwrap_or(now);
                Admission {
                    admitted,
                    used: timestamps.len() as u64,
                    reset_at_ms: oldest.saturating_add(window_ms),
                }
            }
        };

        if admission.admitted {
            self.last_seen = now;
        }
        admission
    }

    /// Whether the record has seen no admitted request within the window.
    pub fn is_stale(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) >= window_ms
    }

    /// Requests currently counted, without applying expiry.
    pub fn count(&self) -> u64 {
        match &self.state {
            WindowState::Fixed { count, .. } => *count,
            WindowState::Sliding { timestamps } => timestamps.len() as u64,
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }
}

/// Drop timestamps that fell out of the trailing window.
fn prune(timestamps: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while let Some(&oldest) = timestamps.front() {
        if now.saturating_sub(oldest) < window_ms {
            break;
        }
        timestamps.pop_front();
    }
}
