//! Per-request admission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::Consumption;

/// The result of one admission check. Owned by the caller for the
/// duration of the request; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Configured limit or capacity for the key
    pub limit: u64,
    /// Hits in the window, tokens used, or queued level (rounded up)
    pub used: u64,
    /// `limit - used`, floored at zero
    pub remaining: u64,
    /// When the quota next resets
    pub reset_at: Option<DateTime<Utc>>,
    /// Whether the request may proceed
    pub admitted: bool,
}

impl Decision {
    /// Assemble a decision from a store's consumption result.
    pub fn from_consumption(limit: u64, consumption: &Consumption) -> Self {
        let used = if consumption.used.is_finite() && consumption.used > 0.0 {
            consumption.used.ceil() as u64
        } else {
            0
        };
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_at: consumption
                .reset_at_ms
                .and_then(DateTime::from_timestamp_millis),
            admitted: consumption.admitted,
        }
    }

    /// Decision reported when the store failed and the limiter fails open.
    pub fn fail_open(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            remaining: limit,
            reset_at: None,
            admitted: true,
        }
    }

    /// Alias of `used` kept for consumers that expect a `current` count.
    /// Deliberately left out of the serialized form.
    pub fn current(&self) -> u64 {
        self.used
    }
}

/// How the downstream request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}
