//! Per-key bucket state and the result of consuming from it.

use serde::{Deserialize, Serialize};

/// Per-key mutable record. The shape depends on the algorithm.
///
/// Persistent backends store every shape as a `(level, stamp)` pair; see
/// [`BucketState::to_row`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum BucketState {
    /// Fixed window: hits observed in the window ending at `reset_at_ms`.
    Window { count: u64, reset_at_ms: i64 },
    /// Token bucket: tokens left, last time tokens were added.
    Tokens { tokens: f64, last_refill_ms: i64 },
    /// Leaky bucket: queued cost, last time the level was drained.
    Leak { level: f64, last_leak_ms: i64 },
}

impl BucketState {
    /// The stored numeric level.
    pub fn level(&self) -> f64 {
        match *self {
            BucketState::Window { count, .. } => count as f64,
            BucketState::Tokens { tokens, .. } => tokens,
            BucketState::Leak { level, .. } => level,
        }
    }

    /// The stored timestamp (window reset, last refill or last leak).
    pub fn stamp_ms(&self) -> i64 {
        match *self {
            BucketState::Window { reset_at_ms, .. } => reset_at_ms,
            BucketState::Tokens { last_refill_ms, .. } => last_refill_ms,
            BucketState::Leak { last_leak_ms, .. } => last_leak_ms,
        }
    }

    /// Flatten into the `(level, last_update)` pair used by the networked
    /// and relational backends.
    pub fn to_row(&self) -> (f64, i64) {
        (self.level(), self.stamp_ms())
    }
}

/// The post-consumption view returned by `Store::increment`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// Whether the unit was admitted
    pub admitted: bool,
    /// Hits in the window, tokens used, or queued level after the call
    pub used: f64,
    /// When the quota next resets, in epoch milliseconds
    pub reset_at_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_layout() {
        let window = BucketState::Window {
            count: 3,
            reset_at_ms: 2_000,
        };
        assert_eq!(window.to_row(), (3.0, 2_000));

        let tokens = BucketState::Tokens {
            tokens: 4.0,
            last_refill_ms: 10,
        };
        assert_eq!(tokens.to_row(), (4.0, 10));
    }

    #[test]
    fn test_state_serializes_with_shape_tag() {
        let leak = BucketState::Leak {
            level: 1.5,
            last_leak_ms: 42,
        };
        let json = serde_json::to_value(leak).unwrap();
        assert_eq!(json["shape"], "leak");
        assert_eq!(json["level"], 1.5);
    }
}
