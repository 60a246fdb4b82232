//! Wall-clock helpers and reconnection backoff.

use chrono::Utc;
use std::cmp;
use std::time::Duration;

/// Seconds since the Unix epoch.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// How long to wait between reconnection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait the configured reconnect delay.
    Fixed,
    /// Double the reconnect delay for every consecutive failure, never
    /// waiting longer than `max`.
    Exponential {
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::Fixed
    }
}

impl Backoff {
    /// The delay to wait after `failures` consecutive failures, given the base
    /// reconnect delay.
    ///
    /// `failures` of zero or one both yield `base`.
    pub fn delay(&self, base: Duration, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed => base,
            Backoff::Exponential { max } => {
                let factor = 1u32
                    .checked_shl(failures.saturating_sub(1))
                    .unwrap_or(u32::max_value());
                let delay = base.checked_mul(factor).unwrap_or(max);
                cmp::min(cmp::max(delay, base), cmp::max(max, base))
            }
        }
    }
}
