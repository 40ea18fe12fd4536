//! Store contract and backends.
//!
//! Every backend implements [`Store`], the admission-critical subset:
//! `increment`, `decrement` and `reset_key`. Lifecycle and inspection
//! operations live in [`ManagedStore`], which callers reach through
//! [`Store::managed`] instead of assuming every backend supports them.

mod memory;
mod postgres;
mod redis;

pub use memory::MemoryStore;
pub use postgres::{PostgresStore, PostgresStoreBuilder};
pub use redis::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::ratelimit::{BucketState, Consumption, Policy};

/// Capability flags advertised by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// State is only visible inside this process
    pub local_keys: bool,
    /// Namespace prepended to every key
    pub prefix: String,
    /// The store may back several limiters at once
    pub shareable: bool,
}

/// The admission-critical store operations.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> StoreCapabilities;

    /// Apply refill/leak and consume one unit as a single atomic step,
    /// returning the post-consumption view.
    async fn increment(&self, key: &str) -> Result<Consumption>;

    /// Give back one unit, bounded by capacity.
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Forget a key; it behaves as never seen afterwards.
    async fn reset_key(&self, key: &str) -> Result<()>;

    /// Lifecycle and inspection operations, if supported.
    fn managed(&self) -> Option<&dyn ManagedStore> {
        None
    }
}

/// Optional store operations.
#[async_trait]
pub trait ManagedStore: Send + Sync {
    /// One-time setup. Calling it again with the same policy is a no-op.
    async fn init(&self, policy: &Policy) -> Result<()>;

    /// Current state with pending refill/leak applied, or `None` for a
    /// never-seen key.
    async fn get(&self, key: &str) -> Result<Option<BucketState>>;

    /// Forget every key owned by this store.
    async fn reset_all(&self) -> Result<()>;

    /// Release backend resources. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Build a freshly owned store for one limiter.
pub fn create(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config {
        StoreConfig::Memory => Arc::new(MemoryStore::with_clock(clock)),
        StoreConfig::Redis { url, prefix } => {
            Arc::new(RedisStore::open(url, prefix.clone(), clock)?)
        }
        StoreConfig::Postgres {
            url,
            table,
            max_connections,
            max_conflict_retries,
            prefix,
        } => Arc::new(
            PostgresStore::builder(url.clone())
                .table(table.clone())?
                .max_connections(*max_connections)
                .max_conflict_retries(*max_conflict_retries)
                .prefix(prefix.clone())
                .clock(clock)
                .build(),
        ),
    };
    Ok(store)
}
