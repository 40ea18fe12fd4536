//! Floodgate - Admission Control Engine
//!
//! This crate decides whether to admit a client's next unit of work under a
//! fixed window, token bucket or leaky bucket policy. Counter state lives in
//! a pluggable store: process memory, Redis (server-side scripts) or
//! PostgreSQL (row locks), each applying refill-then-consume atomically.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlgorithmConfig, FloodgateConfig, LimiterConfig, StoreConfig};
pub use error::{FloodgateError, Result};
pub use ratelimit::{Admission, Decision, LeakyQueue, Outcome, OutcomeHandle, RateLimiter};
pub use store::{ManagedStore, MemoryStore, PostgresStore, RedisStore, Store};
