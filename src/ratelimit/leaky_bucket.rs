//! Leaky bucket, counter shape.
//!
//! The level rises by the cost of each admitted unit and drains
//! continuously. A unit that would overflow the bucket is rejected and
//! leaves the level untouched.

use super::state::{BucketState, Consumption};

/// Leaky bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucket {
    /// Maximum queued cost
    pub capacity: f64,
    /// Units drained per second
    pub leak_rate: f64,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            leak_rate,
        }
    }

    pub fn fresh(&self, now_ms: i64) -> BucketState {
        BucketState::Leak {
            level: 0.0,
            last_leak_ms: now_ms,
        }
    }

    /// Drain whatever leaked out since the last call.
    pub fn advance(&self, state: BucketState, now_ms: i64) -> BucketState {
        match state {
            BucketState::Leak {
                level,
                last_leak_ms,
            } => {
                if now_ms <= last_leak_ms {
                    return state;
                }
                let leaked = (now_ms - last_leak_ms) as f64 / 1000.0 * self.leak_rate;
                BucketState::Leak {
                    level: (level - leaked).max(0.0),
                    last_leak_ms: now_ms,
                }
            }
            _ => self.fresh(now_ms),
        }
    }

    pub fn consume(&self, state: Option<BucketState>, now_ms: i64) -> (BucketState, Consumption) {
        self.consume_cost(state, now_ms, 1.0)
    }

    /// Admit `cost` units if they fit.
    pub fn consume_cost(
        &self,
        state: Option<BucketState>,
        now_ms: i64,
        cost: f64,
    ) -> (BucketState, Consumption) {
        let state = match state {
            Some(state) => self.advance(state, now_ms),
            None => self.fresh(now_ms),
        };

        let level = state.level();
        let admitted = level + cost <= self.capacity;
        let next = BucketState::Leak {
            level: if admitted { level + cost } else { level },
            last_leak_ms: state.stamp_ms(),
        };
        let consumption = Consumption {
            admitted,
            used: next.level(),
            reset_at_ms: Some(self.reset_at(&next)),
        };
        (next, consumption)
    }

    /// Drain one unit immediately.
    pub fn release(&self, state: BucketState, now_ms: i64) -> BucketState {
        match self.advance(state, now_ms) {
            BucketState::Leak {
                level,
                last_leak_ms,
            } => BucketState::Leak {
                level: (level - 1.0).max(0.0),
                last_leak_ms,
            },
            other => other,
        }
    }

    /// Time at which the bucket will have drained empty.
    pub fn reset_at(&self, state: &BucketState) -> i64 {
        state.stamp_ms() + (state.level() / self.leak_rate * 1000.0).ceil() as i64
    }

    pub fn ttl_ms(&self, state: &BucketState, now_ms: i64) -> i64 {
        (self.reset_at(state) - now_ms).max(0) + 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_fill_to_capacity_then_reject() {
        let bucket = LeakyBucket::new(3, 1.0);
        let mut state = None;

        for _ in 0..3 {
            let (next, c) = bucket.consume(state, T0);
            assert!(c.admitted);
            state = Some(next);
        }

        let (next, c) = bucket.consume(state, T0);
        assert!(!c.admitted);
        assert_eq!(c.used, 3.0);
        assert_eq!(Some(next), state);
    }

    #[test]
    fn test_leak_frees_room() {
        let bucket = LeakyBucket::new(3, 2.0);
        let full = BucketState::Leak {
            level: 3.0,
            last_leak_ms: T0,
        };

        let (_, c) = bucket.consume(Some(full), T0 + 499);
        assert!(!c.admitted);

        let (next, c) = bucket.consume(Some(full), T0 + 500);
        assert!(c.admitted);
        assert_eq!(next.level(), 3.0);
    }

    #[test]
    fn test_level_never_negative() {
        let bucket = LeakyBucket::new(3, 100.0);
        let state = BucketState::Leak {
            level: 1.0,
            last_leak_ms: T0,
        };
        assert_eq!(bucket.advance(state, T0 + 60_000).level(), 0.0);
        assert_eq!(bucket.release(bucket.fresh(T0), T0).level(), 0.0);
    }

    #[test]
    fn test_oversized_cost_rejected_without_mutation() {
        let bucket = LeakyBucket::new(3, 1.0);
        let (next, c) = bucket.consume_cost(None, T0, 4.0);
        assert!(!c.admitted);
        assert_eq!(next, bucket.fresh(T0));
    }

    #[test]
    fn test_reset_at_is_drain_time() {
        let bucket = LeakyBucket::new(10, 2.0);
        let state = BucketState::Leak {
            level: 4.0,
            last_leak_ms: T0,
        };
        assert_eq!(bucket.reset_at(&state), T0 + 2_000);
    }
}
