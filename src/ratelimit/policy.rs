//! Algorithm selection and dispatch.
//!
//! A [`Policy`] is the validated, runtime form of an
//! [`AlgorithmConfig`](crate::config::AlgorithmConfig). Stores hold one and
//! apply its transitions under their own atomicity mechanism.

use std::fmt;

use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::state::{BucketState, Consumption};
use super::token_bucket::TokenBucket;
use crate::config::AlgorithmConfig;
use crate::error::{FloodgateError, Result};

/// Algorithm identifier, also used as the script/row discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    FixedWindow,
    TokenBucket,
    LeakyBucket,
}

impl AlgorithmKind {
    /// Numeric code understood by the networked store's scripts.
    pub fn code(&self) -> u8 {
        match self {
            AlgorithmKind::FixedWindow => 0,
            AlgorithmKind::TokenBucket => 1,
            AlgorithmKind::LeakyBucket => 2,
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlgorithmKind::FixedWindow => "fixed-window",
            AlgorithmKind::TokenBucket => "token-bucket",
            AlgorithmKind::LeakyBucket => "leaky-bucket",
        };
        f.write_str(name)
    }
}

/// A validated algorithm with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    FixedWindow(FixedWindow),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
}

impl Policy {
    pub fn fixed_window(limit: u64, window_ms: i64) -> Self {
        Policy::FixedWindow(FixedWindow::new(limit, window_ms))
    }

    pub fn token_bucket(capacity: u64, refill_rate: f64) -> Self {
        Policy::TokenBucket(TokenBucket::new(capacity, refill_rate))
    }

    pub fn leaky_bucket(capacity: u64, leak_rate: f64) -> Self {
        Policy::LeakyBucket(LeakyBucket::new(capacity, leak_rate))
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Policy::FixedWindow(_) => AlgorithmKind::FixedWindow,
            Policy::TokenBucket(_) => AlgorithmKind::TokenBucket,
            Policy::LeakyBucket(_) => AlgorithmKind::LeakyBucket,
        }
    }

    /// The configured limit or capacity.
    pub fn capacity(&self) -> u64 {
        match self {
            Policy::FixedWindow(w) => w.limit,
            Policy::TokenBucket(b) => b.capacity as u64,
            Policy::LeakyBucket(b) => b.capacity as u64,
        }
    }

    /// Interval and per-interval rate, as passed to the networked store's
    /// scripts: the window length and limit for a fixed window, one second
    /// and the per-second rate for the buckets.
    pub fn interval_and_rate(&self) -> (i64, f64) {
        match self {
            Policy::FixedWindow(w) => (w.window_ms, w.limit as f64),
            Policy::TokenBucket(b) => (1000, b.refill_rate),
            Policy::LeakyBucket(b) => (1000, b.leak_rate),
        }
    }

    /// State of a never-seen key.
    pub fn fresh(&self, now_ms: i64) -> BucketState {
        match self {
            Policy::FixedWindow(w) => w.fresh(now_ms),
            Policy::TokenBucket(b) => b.fresh(now_ms),
            Policy::LeakyBucket(b) => b.fresh(now_ms),
        }
    }

    /// Apply pending refill, leak or window rollover.
    pub fn advance(&self, state: BucketState, now_ms: i64) -> BucketState {
        match self {
            Policy::FixedWindow(w) => w.advance(state, now_ms),
            Policy::TokenBucket(b) => b.advance(state, now_ms),
            Policy::LeakyBucket(b) => b.advance(state, now_ms),
        }
    }

    /// Advance, then consume one unit.
    pub fn consume(&self, state: Option<BucketState>, now_ms: i64) -> (BucketState, Consumption) {
        match self {
            Policy::FixedWindow(w) => w.consume(state, now_ms),
            Policy::TokenBucket(b) => b.consume(state, now_ms),
            Policy::LeakyBucket(b) => b.consume(state, now_ms),
        }
    }

    /// Advance, then give one unit back.
    pub fn release(&self, state: BucketState, now_ms: i64) -> BucketState {
        match self {
            Policy::FixedWindow(w) => w.release(state, now_ms),
            Policy::TokenBucket(b) => b.release(state, now_ms),
            Policy::LeakyBucket(b) => b.release(state, now_ms),
        }
    }

    /// How long an untouched key needs to be kept.
    pub fn ttl_ms(&self, state: &BucketState, now_ms: i64) -> i64 {
        match self {
            Policy::FixedWindow(w) => w.ttl_ms(state, now_ms),
            Policy::TokenBucket(b) => b.ttl_ms(state, now_ms),
            Policy::LeakyBucket(b) => b.ttl_ms(state, now_ms),
        }
    }

    /// Whether `state` is indistinguishable from a never-seen key.
    pub fn is_pristine(&self, state: &BucketState, now_ms: i64) -> bool {
        let state = self.advance(*state, now_ms);
        match self {
            Policy::TokenBucket(b) => state.level() >= b.capacity,
            Policy::FixedWindow(_) | Policy::LeakyBucket(_) => state.level() <= 0.0,
        }
    }

    /// Rebuild a typed state from the `(level, last_update)` row layout.
    pub fn state_from_row(&self, level: f64, stamp_ms: i64) -> BucketState {
        match self {
            Policy::FixedWindow(_) => BucketState::Window {
                count: level.max(0.0) as u64,
                reset_at_ms: stamp_ms,
            },
            Policy::TokenBucket(_) => BucketState::Tokens {
                tokens: level,
                last_refill_ms: stamp_ms,
            },
            Policy::LeakyBucket(_) => BucketState::Leak {
                level,
                last_leak_ms: stamp_ms,
            },
        }
    }
}

impl TryFrom<&AlgorithmConfig> for Policy {
    type Error = FloodgateError;

    fn try_from(config: &AlgorithmConfig) -> Result<Self> {
        match *config {
            AlgorithmConfig::FixedWindow {
                limit,
                window_ms,
                unit,
            } => {
                let window_ms = match (window_ms, unit) {
                    (Some(ms), _) => ms,
                    (None, Some(unit)) => unit.duration().as_millis() as u64,
                    (None, None) => {
                        return Err(FloodgateError::Config(
                            "fixed-window needs window_ms or unit".to_string(),
                        ))
                    }
                };
                if limit == 0 {
                    return Err(FloodgateError::Config("limit must be at least 1".to_string()));
                }
                if window_ms == 0 || window_ms > i64::MAX as u64 {
                    return Err(FloodgateError::Config(format!(
                        "window_ms out of range: {}",
                        window_ms
                    )));
                }
                Ok(Policy::fixed_window(limit, window_ms as i64))
            }
            AlgorithmConfig::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => {
                check_bucket(capacity, refill_rate_per_second, "refill_rate_per_second")?;
                Ok(Policy::token_bucket(capacity, refill_rate_per_second))
            }
            AlgorithmConfig::LeakyBucket {
                capacity,
                leak_rate_per_second,
            } => {
                check_bucket(capacity, leak_rate_per_second, "leak_rate_per_second")?;
                Ok(Policy::leaky_bucket(capacity, leak_rate_per_second))
            }
        }
    }
}

fn check_bucket(capacity: u64, rate: f64, field: &str) -> Result<()> {
    if capacity == 0 {
        return Err(FloodgateError::Config("capacity must be at least 1".to_string()));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(FloodgateError::Config(format!(
            "{} must be a positive number, got {}",
            field, rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeUnit;

    #[test]
    fn test_policy_from_config() {
        let policy = Policy::try_from(&AlgorithmConfig::FixedWindow {
            limit: 10,
            window_ms: None,
            unit: Some(TimeUnit::Minute),
        })
        .unwrap();
        assert_eq!(policy, Policy::fixed_window(10, 60_000));
        assert_eq!(policy.kind(), AlgorithmKind::FixedWindow);
        assert_eq!(policy.capacity(), 10);
    }

    #[test]
    fn test_invalid_rates_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = Policy::try_from(&AlgorithmConfig::TokenBucket {
                capacity: 5,
                refill_rate_per_second: rate,
            });
            assert!(result.is_err(), "rate {} should be rejected", rate);
        }
    }

    #[test]
    fn test_missing_window_rejected() {
        let result = Policy::try_from(&AlgorithmConfig::FixedWindow {
            limit: 10,
            window_ms: None,
            unit: None,
        });
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_row_round_trip_per_kind() {
        let now = 1_700_000_000_000;
        for policy in [
            Policy::fixed_window(3, 1_000),
            Policy::token_bucket(5, 1.0),
            Policy::leaky_bucket(5, 1.0),
        ] {
            let (state, _) = policy.consume(None, now);
            let (level, stamp) = state.to_row();
            assert_eq!(policy.state_from_row(level, stamp), state);
        }
    }

    #[test]
    fn test_pristine_states() {
        let now = 1_700_000_000_000;
        for policy in [
            Policy::fixed_window(3, 1_000),
            Policy::token_bucket(5, 1.0),
            Policy::leaky_bucket(5, 1.0),
        ] {
            assert!(policy.is_pristine(&policy.fresh(now), now));
            let (used, _) = policy.consume(None, now);
            assert!(!policy.is_pristine(&used, now), "{} consumed", policy.kind());
        }
    }

    #[test]
    fn test_script_parameters() {
        assert_eq!(Policy::fixed_window(3, 1_000).interval_and_rate(), (1_000, 3.0));
        assert_eq!(Policy::token_bucket(5, 2.0).interval_and_rate(), (1_000, 2.0));
        assert_eq!(AlgorithmKind::LeakyBucket.code(), 2);
    }
}
