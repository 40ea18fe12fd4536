//! Token bucket.

use super::state::{BucketState, Consumption};

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
        }
    }

    /// Milliseconds between two whole tokens.
    pub fn refill_interval_ms(&self) -> f64 {
        1000.0 / self.refill_rate
    }

    pub fn fresh(&self, now_ms: i64) -> BucketState {
        BucketState::Tokens {
            tokens: self.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Add the whole tokens accrued since the last refill.
    ///
    /// The refill stamp only moves when at least one token was added, so
    /// frequent calls do not keep discarding partial accrual.
    pub fn advance(&self, state: BucketState, now_ms: i64) -> BucketState {
        let (tokens, last_refill_ms) = match state {
            BucketState::Tokens {
                tokens,
                last_refill_ms,
            } => (tokens, last_refill_ms),
            _ => return self.fresh(now_ms),
        };

        let elapsed = (now_ms - last_refill_ms).max(0) as f64;
        let to_add = (elapsed / 1000.0 * self.refill_rate).floor();
        if to_add > 0.0 {
            BucketState::Tokens {
                tokens: (tokens + to_add).min(self.capacity),
                last_refill_ms: now_ms,
            }
        } else {
            state
        }
    }

    pub fn consume(&self, state: Option<BucketState>, now_ms: i64) -> (BucketState, Consumption) {
        let state = match state {
            Some(state) => self.advance(state, now_ms),
            None => self.fresh(now_ms),
        };
        let (tokens, last_refill_ms) = match state {
            BucketState::Tokens {
                tokens,
                last_refill_ms,
            } => (tokens, last_refill_ms),
            _ => (self.capacity, now_ms),
        };

        let admitted = tokens >= 1.0;
        let tokens = if admitted { tokens - 1.0 } else { tokens };

        let next = BucketState::Tokens {
            tokens,
            last_refill_ms,
        };
        let consumption = Consumption {
            admitted,
            used: self.capacity - tokens,
            reset_at_ms: Some(self.reset_at(&next)),
        };
        (next, consumption)
    }

    /// Refund one token, bounded by capacity.
    pub fn release(&self, state: BucketState, now_ms: i64) -> BucketState {
        match self.advance(state, now_ms) {
            BucketState::Tokens {
                tokens,
                last_refill_ms,
            } => BucketState::Tokens {
                tokens: (tokens + 1.0).min(self.capacity),
                last_refill_ms,
            },
            other => other,
        }
    }

    /// Time of the next whole-token refill.
    pub fn reset_at(&self, state: &BucketState) -> i64 {
        state.stamp_ms() + self.refill_interval_ms().ceil() as i64
    }

    /// Milliseconds until an idle bucket is full again.
    pub fn ttl_ms(&self, state: &BucketState, _now_ms: i64) -> i64 {
        let missing = (self.capacity - state.level()).max(0.0);
        ((missing + 1.0) * self.refill_interval_ms()).ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_burst_then_reject() {
        let bucket = TokenBucket::new(5, 1.0);
        let mut state = None;

        for i in 1..=5 {
            let (next, c) = bucket.consume(state, T0);
            assert!(c.admitted, "request {} should be admitted", i);
            assert_eq!(c.used, i as f64);
            state = Some(next);
        }

        let (next, c) = bucket.consume(state, T0);
        assert!(!c.admitted);
        assert_eq!(c.used, 5.0);
        assert_eq!(next.level(), 0.0);
    }

    #[test]
    fn test_refill_after_one_second_admits_exactly_one() {
        let bucket = TokenBucket::new(5, 1.0);
        let mut state = Some(BucketState::Tokens {
            tokens: 0.0,
            last_refill_ms: T0,
        });

        let (next, c) = bucket.consume(state, T0 + 1_000);
        assert!(c.admitted);
        state = Some(next);

        let (_, c) = bucket.consume(state, T0 + 1_000);
        assert!(!c.admitted);
    }

    #[test]
    fn test_partial_accrual_is_not_lost() {
        let bucket = TokenBucket::new(5, 1.0);
        let empty = BucketState::Tokens {
            tokens: 0.0,
            last_refill_ms: T0,
        };

        // Sub-token elapsed time leaves the stamp alone...
        let state = bucket.advance(empty, T0 + 600);
        assert_eq!(state, empty);

        // ...so the accrual completes on the next call.
        let state = bucket.advance(state, T0 + 1_100);
        assert_eq!(
            state,
            BucketState::Tokens {
                tokens: 1.0,
                last_refill_ms: T0 + 1_100
            }
        );
    }

    #[test]
    fn test_refill_is_capped() {
        let bucket = TokenBucket::new(5, 10.0);
        let state = BucketState::Tokens {
            tokens: 2.0,
            last_refill_ms: T0,
        };
        assert_eq!(bucket.advance(state, T0 + 60_000).level(), 5.0);
    }

    #[test]
    fn test_release_never_exceeds_capacity() {
        let bucket = TokenBucket::new(3, 1.0);
        let mut state = bucket.fresh(T0);
        for _ in 0..10 {
            state = bucket.release(state, T0);
        }
        assert_eq!(state.level(), 3.0);
    }

    #[test]
    fn test_reset_at_is_one_interval_after_refill() {
        let bucket = TokenBucket::new(5, 4.0);
        let state = bucket.fresh(T0);
        assert_eq!(bucket.reset_at(&state), T0 + 250);
    }
}
