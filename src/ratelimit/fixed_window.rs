//! Fixed window counter.
//!
//! Windows are aligned to multiples of the window length since the epoch, so
//! every key resets at the same instant.

use super::state::{BucketState, Consumption};

/// Fixed window counter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedWindow {
    /// Admissions allowed per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: i64,
}

impl FixedWindow {
    pub fn new(limit: u64, window_ms: i64) -> Self {
        Self { limit, window_ms }
    }

    /// Start of the window containing `now_ms`.
    pub fn window_start(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.window_ms) * self.window_ms
    }

    /// State of a key that has never been seen.
    pub fn fresh(&self, now_ms: i64) -> BucketState {
        BucketState::Window {
            count: 0,
            reset_at_ms: self.window_start(now_ms) + self.window_ms,
        }
    }

    /// Roll the window over if it has expired.
    pub fn advance(&self, state: BucketState, now_ms: i64) -> BucketState {
        match state {
            BucketState::Window { reset_at_ms, .. } if now_ms < reset_at_ms => state,
            _ => self.fresh(now_ms),
        }
    }

    /// Count one hit. The hit that reaches the limit is still admitted; the
    /// first hit past it is rejected.
    pub fn consume(&self, state: Option<BucketState>, now_ms: i64) -> (BucketState, Consumption) {
        let state = match state {
            Some(state) => self.advance(state, now_ms),
            None => self.fresh(now_ms),
        };

        let (count, reset_at_ms) = match state {
            BucketState::Window { count, reset_at_ms } => (count + 1, reset_at_ms),
            _ => unreachable!("advance always yields a window state"),
        };

        let next = BucketState::Window { count, reset_at_ms };
        let consumption = Consumption {
            admitted: count <= self.limit,
            used: count as f64,
            reset_at_ms: Some(reset_at_ms),
        };
        (next, consumption)
    }

    /// Take back one hit, never going below zero.
    pub fn release(&self, state: BucketState, now_ms: i64) -> BucketState {
        match self.advance(state, now_ms) {
            BucketState::Window { count, reset_at_ms } => BucketState::Window {
                count: count.saturating_sub(1),
                reset_at_ms,
            },
            other => other,
        }
    }

    /// Milliseconds until the key's state is worthless.
    pub fn ttl_ms(&self, state: &BucketState, now_ms: i64) -> i64 {
        (state.stamp_ms() - now_ms).max(1)
    }
}
