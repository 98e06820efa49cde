//! Admission decisions and their HTTP rendering.

use serde::Serialize;
use std::time::Duration;

use super::window::Admission;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Configured requests per window
    pub limit: u64,
    /// Budget left in the current window after this decision
    pub remaining: u64,
    /// When budget next frees up (ms since the Unix epoch), or 0 when unknown
    pub reset_at_ms: u64,
}

impl Decision {
    pub(crate) fn from_admission(admission: Admission, limit: u64) -> Self {
        Self {
            admitted: admission.admitted,
            limit,
            remaining: limit.saturating_sub(admission.used),
            reset_at_ms: admission.reset_at_ms,
        }
    }

    /// Decision taken without consulting the store, after an internal fault.
    ///
    /// The reset point is unknown.
    pub(crate) fn fallback(admitted: bool, limit: u64) -> Self {
        Self {
            admitted,
            limit,
            remaining: 0,
            reset_at_ms: 0,
        }
    }

    /// Whether the decision carries a reset point.
    pub fn reset_known(&self) -> bool {
        self.reset_at_ms != 0
    }

    /// HTTP status a serving layer should answer a rejection with.
    pub fn status_code(&self) -> u16 {
        if self.admitted {
            200
        } else {
            429
        }
    }

    /// Time from `now` until the reset point.
    pub fn reset_after(&self, now: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now))
    }

    /// Seconds a rejected client should wait, never less than one.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)
    }

    /// Reset point as a Unix timestamp in whole seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Advisory rate limit headers. `X-RateLimit-Reset` is omitted when the
    /// reset point is unknown; `Retry-After` is only present on rejection.
    pub fn headers(&self, now: u64) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
        ];
        if self.reset_known() {
            headers.push((HEADER_RESET, self.reset_epoch_secs().to_string()));
        }

        if !self.admitted {
            headers.push((HEADER_RETRY_AFTER, self.retry_after_secs(now).to_string()));
        }
        headers
    }
}
