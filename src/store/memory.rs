//! Process-local store.
//!
//! State lives in a [`DashMap`]; the entry guard serializes mutation of a
//! key while other keys proceed independently. Refill and leak are applied
//! lazily on access. Fixed-window stores also run a sweep at each window
//! boundary that drops expired windows to bound memory.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{ManagedStore, Store, StoreCapabilities};
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{BucketState, Consumption, Policy};

const NAME: &str = "memory";

/// In-memory store. Not visible outside this process.
pub struct MemoryStore {
    entries: Arc<DashMap<String, BucketState>>,
    policy: OnceLock<Policy>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .field("policy", &self.policy.get())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            policy: OnceLock::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    fn policy(&self) -> Result<&Policy> {
        self.policy.get().ok_or(FloodgateError::NotInitialized(NAME))
    }

    /// Start the fixed-window sweep unless one is already running.
    fn ensure_sweeper(&self, policy: &Policy) {
        let Policy::FixedWindow(window) = policy else {
            return;
        };
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = self.spawn_sweeper(window.window_ms);
        }
    }

    fn spawn_sweeper(&self, window_ms: i64) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, fixed-window sweep disabled");
            return None;
        };

        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);
        let now = clock.now_ms();
        let first = window_ms - now.rem_euclid(window_ms);

        Some(handle.spawn(async move {
            let period = Duration::from_millis(window_ms as u64);
            let start = tokio::time::Instant::now() + Duration::from_millis(first as u64);
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let now = clock.now_ms();
                let before = entries.len();
                entries.retain(|_, state| state.stamp_ms() > now);
                trace!(removed = before - entries.len(), "Swept expired windows");
            }
        }))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            local_keys: true,
            prefix: String::new(),
            shareable: false,
        }
    }

    async fn increment(&self, key: &str) -> Result<Consumption> {
        let policy = self.policy()?;
        let now = self.clock.now_ms();

        let consumption = match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let (next, consumption) = policy.consume(Some(*entry.get()), now);
                entry.insert(next);
                consumption
            }
            Entry::Vacant(entry) => {
                let (next, consumption) = policy.consume(None, now);
                entry.insert(next);
                consumption
            }
        };

        trace!(key, admitted = consumption.admitted, used = consumption.used, "Memory increment");
        Ok(consumption)
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let policy = self.policy()?;
        let now = self.clock.now_ms();
        if let Some(mut state) = self.entries.get_mut(key) {
            *state = policy.release(*state, now);
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn managed(&self) -> Option<&dyn ManagedStore> {
        Some(self)
    }
}

#[async_trait]
impl ManagedStore for MemoryStore {
    async fn init(&self, policy: &Policy) -> Result<()> {
        if let Some(existing) = self.policy.get() {
            if existing != policy {
                return Err(FloodgateError::Config(format!(
                    "memory store already initialised for {}",
                    existing.kind()
                )));
            }
            // A shut down store is reinitialised with its sweep stopped.
            self.ensure_sweeper(policy);
            return Ok(());
        }
        if self.policy.set(*policy).is_err() {
            // Lost a concurrent init race; the winner's policy stands.
            return match self.policy.get() {
                Some(existing) if existing == policy => Ok(()),
                _ => Err(FloodgateError::Config(
                    "memory store initialised concurrently with another policy".to_string(),
                )),
            };
        }

        self.ensure_sweeper(policy);
        info!(algorithm = %policy.kind(), "Memory store initialised");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let policy = self.policy()?;
        let now = self.clock.now_ms();
        Ok(self.entries.get(key).map(|state| policy.advance(*state, now)))
    }

    async fn reset_all(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
            info!("Memory store shut down");
        }
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;

    async fn store_with(policy: Policy) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        store.init(&policy).await.unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn test_increment_before_init_fails() {
        let store = MemoryStore::new();
        let err = store.increment("k").await.unwrap_err();
        assert!(matches!(err, FloodgateError::NotInitialized("memory")));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (store, _) = store_with(Policy::token_bucket(5, 1.0)).await;
        store.init(&Policy::token_bucket(5, 1.0)).await.unwrap();
        assert!(store.init(&Policy::leaky_bucket(5, 1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_fixed_window_sequence() {
        let (store, clock) = store_with(Policy::fixed_window(3, 1_000)).await;

        for _ in 0..3 {
            assert!(store.increment("k").await.unwrap().admitted);
        }
        let c = store.increment("k").await.unwrap();
        assert!(!c.admitted);
        assert_eq!(c.used, 4.0);

        clock.advance(Duration::from_millis(1_000));
        let c = store.increment("k").await.unwrap();
        assert!(c.admitted);
        assert_eq!(c.used, 1.0);
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let (store, clock) = store_with(Policy::token_bucket(5, 1.0)).await;

        for _ in 0..5 {
            assert!(store.increment("k").await.unwrap().admitted);
        }
        assert!(!store.increment("k").await.unwrap().admitted);

        clock.advance(Duration::from_secs(1));
        assert!(store.increment("k").await.unwrap().admitted);
        assert!(!store.increment("k").await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_get_applies_pending_leak() {
        let (store, clock) = store_with(Policy::leaky_bucket(4, 1.0)).await;
        for _ in 0..4 {
            store.increment("k").await.unwrap();
        }

        clock.advance(Duration::from_millis(2_500));
        let state = store.get("k").await.unwrap().unwrap();
        assert!((state.level() - 1.5).abs() < 1e-9);
        assert_eq!(state.stamp_ms(), T0 + 2_500);
    }

    #[tokio::test]
    async fn test_decrement_is_bounded() {
        let (store, _) = store_with(Policy::token_bucket(2, 1.0)).await;
        store.increment("k").await.unwrap();
        for _ in 0..5 {
            store.decrement("k").await.unwrap();
        }
        assert_eq!(store.get("k").await.unwrap().unwrap().level(), 2.0);

        // Unknown keys have nothing to give back.
        store.decrement("missing").await.unwrap();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_key_and_reset_all() {
        let (store, _) = store_with(Policy::fixed_window(3, 1_000)).await;
        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();

        store.reset_key("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.key_count(), 1);

        store.reset_all().await.unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_admit_exactly_capacity() {
        let store = Arc::new(MemoryStore::new());
        store.init(&Policy::token_bucket(25, 0.001)).await.unwrap();

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot").await.unwrap().admitted })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_windows() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        store.init(&Policy::fixed_window(3, 1_000)).await.unwrap();

        store.increment("a").await.unwrap();
        assert_eq!(store.key_count(), 1);

        clock.advance(Duration::from_millis(1_000));
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(store.key_count(), 0);

        store.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resumes_after_reinit() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let policy = Policy::fixed_window(3, 1_000);
        store.init(&policy).await.unwrap();
        store.shutdown().await.unwrap();
        store.init(&policy).await.unwrap();

        for i in 0..50 {
            store.increment(&format!("k{}", i)).await.unwrap();
        }
        assert_eq!(store.key_count(), 50);

        clock.advance(Duration::from_millis(1_000));
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(store.key_count(), 0);

        store.shutdown().await.unwrap();
    }
}
