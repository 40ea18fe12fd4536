//! Redis-backed store.
//!
//! Refill/leak and consume run as one server-side Lua script, so clients in
//! different processes never race on a read-modify-write. Scripts are loaded
//! at `init` and invoked by SHA afterwards. Each key is a hash holding
//! `level` and `last_update`, with a TTL long enough for the bucket to idle
//! back to its pristine state.

use std::sync::{Arc, OnceLock};

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script, ScriptInvocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{ManagedStore, Store, StoreCapabilities};
use crate::clock::Clock;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{namespaced, BucketState, Consumption, Policy};

const NAME: &str = "redis";

const COMMON: &str = include_str!("scripts/common.lua");
const CONSUME: &str = include_str!("scripts/consume.lua");
const RELEASE: &str = include_str!("scripts/release.lua");
const RESET: &str = include_str!("scripts/reset.lua");

const SCAN_BATCH: usize = 500;

/// Store backed by Redis server-side scripts.
pub struct RedisStore {
    client: Client,
    prefix: String,
    clock: Arc<dyn Clock>,
    policy: OnceLock<Policy>,
    connection: Mutex<Option<ConnectionManager>>,
    consume: Script,
    release: Script,
    reset: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("policy", &self.policy.get())
            .field("connected", &self.connection.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Parse `url` and prepare the scripts. No connection is made until
    /// [`ManagedStore::init`].
    pub fn open(url: &str, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            clock,
            policy: OnceLock::new(),
            connection: Mutex::new(None),
            consume: Script::new(&compose(CONSUME)),
            release: Script::new(&compose(RELEASE)),
            reset: Script::new(&compose(RESET)),
        })
    }

    fn policy(&self) -> Result<&Policy> {
        self.policy.get().ok_or(FloodgateError::NotInitialized(NAME))
    }

    /// Bind the store to `policy`. Concurrent callers agree on one winner.
    fn claim_policy(&self, policy: &Policy) -> Result<()> {
        let existing = self.policy.get_or_init(|| *policy);
        if existing != policy {
            return Err(FloodgateError::Config(format!(
                "redis store already initialised for {}",
                existing.kind()
            )));
        }
        Ok(())
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .lock()
            .clone()
            .ok_or(FloodgateError::NotInitialized(NAME))
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.prefix, key)
    }

    /// Bind the key and the policy arguments every script expects.
    fn invocation<'a>(&self, script: &'a Script, key: &str, policy: &Policy) -> ScriptInvocation<'a> {
        let (interval_ms, rate) = policy.interval_and_rate();
        let mut invocation = script.key(self.key(key));
        invocation
            .arg(self.clock.now_ms())
            .arg(policy.kind().code())
            .arg(interval_ms)
            .arg(policy.capacity())
            .arg(rate);
        invocation
    }
}

/// Prepend the shared prelude to a script body.
fn compose(body: &str) -> String {
    let mut script = String::with_capacity(COMMON.len() + body.len() + 1);
    script.push_str(COMMON);
    script.push('\n');
    script.push_str(body);
    script
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            local_keys: false,
            prefix: self.prefix.clone(),
            shareable: false,
        }
    }

    async fn increment(&self, key: &str) -> Result<Consumption> {
        let policy = self.policy()?;
        let mut conn = self.connection()?;

        let invocation = self.invocation(&self.consume, key, policy);
        let (admitted, used, reset_at_ms): (i64, String, i64) =
            invocation.invoke_async(&mut conn).await?;

        let used: f64 = used
            .parse()
            .map_err(|_| FloodgateError::backend(NAME, format!("bad level reply {:?}", used)))?;

        trace!(key, admitted, used, "Redis increment");
        Ok(Consumption {
            admitted: admitted == 1,
            used,
            reset_at_ms: Some(reset_at_ms),
        })
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let policy = self.policy()?;
        let mut conn = self.connection()?;

        let invocation = self.invocation(&self.release, key, policy);
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        if applied == 0 {
            debug!(key, "Decrement on unknown key ignored");
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        let policy = self.policy()?;
        let mut conn = self.connection()?;

        let invocation = self.invocation(&self.reset, key, policy);
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    fn managed(&self) -> Option<&dyn ManagedStore> {
        Some(self)
    }
}

#[async_trait]
impl ManagedStore for RedisStore {
    async fn init(&self, policy: &Policy) -> Result<()> {
        self.claim_policy(policy)?;
        if self.connection.lock().is_some() {
            return Ok(());
        }

        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        for (name, script) in [
            ("consume", &self.consume),
            ("release", &self.release),
            ("reset", &self.reset),
        ] {
            let sha = script.prepare_invoke().load_async(&mut conn).await?;
            debug!(script = name, sha = %sha, "Loaded Redis script");
        }

        *self.connection.lock() = Some(conn);

        info!(
            algorithm = %policy.kind(),
            prefix = %self.prefix,
            "Redis store initialised"
        );
        Ok(())
    }

    /// Best-effort read: refill/leak is applied client-side without the
    /// script's atomicity.
    async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let policy = self.policy()?;
        let mut conn = self.connection()?;

        let (level, stamp): (Option<String>, Option<String>) = ::redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("level")
            .arg("last_update")
            .query_async(&mut conn)
            .await?;

        let (Some(level), Some(stamp)) = (level, stamp) else {
            return Ok(None);
        };
        let (Ok(level), Ok(stamp)) = (level.parse::<f64>(), stamp.parse::<f64>()) else {
            warn!(key, "Unparseable bucket hash, treating as unseen");
            return Ok(None);
        };

        let state = policy.state_from_row(level, stamp as i64);
        Ok(Some(policy.advance(state, self.clock.now_ms())))
    }

    async fn reset_all(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(FloodgateError::Config(
                "refusing to reset every key of an unprefixed redis store".to_string(),
            ));
        }
        let mut conn = self.connection()?;
        let pattern = format!("{}*", self.prefix);

        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                let _: i64 = ::redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(prefix = %self.prefix, removed, "Redis store reset");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.connection.lock().take().is_some() {
            info!(prefix = %self.prefix, "Redis store shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store(prefix: &str) -> RedisStore {
        RedisStore::open("redis://127.0.0.1:6379", prefix, Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_open_rejects_bad_url() {
        let result = RedisStore::open("not a url", "p:", Arc::new(SystemClock));
        assert!(matches!(result, Err(FloodgateError::BackendUnavailable { .. })));
    }

    #[test]
    fn test_scripts_share_prelude() {
        for body in [CONSUME, RELEASE, RESET] {
            let script = compose(body);
            assert!(script.starts_with(COMMON));
            assert!(script.ends_with(body));
        }
    }

    #[test]
    fn test_capabilities() {
        let store = store("limits:");
        let caps = store.capabilities();
        assert!(!caps.local_keys);
        assert_eq!(caps.prefix, "limits:");
        assert_eq!(store.key("abc"), "limits:abc");
    }

    #[tokio::test]
    async fn test_operations_before_init_fail() {
        let store = store("limits:");
        assert!(matches!(
            store.increment("k").await,
            Err(FloodgateError::NotInitialized("redis"))
        ));
        assert!(matches!(
            store.get("k").await,
            Err(FloodgateError::NotInitialized("redis"))
        ));
        // Shutting down an unconnected store is fine.
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_all_requires_prefix() {
        let store = store("");
        assert!(matches!(store.reset_all().await, Err(FloodgateError::Config(_))));
    }

    #[tokio::test]
    async fn test_init_rejects_second_policy() {
        let store = store("limits:");
        let window = Policy::fixed_window(3, 1_000);
        store.claim_policy(&window).unwrap();
        store.claim_policy(&window).unwrap();

        // Fails before any connection attempt.
        let err = store.init(&Policy::token_bucket(5, 1.0)).await.unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
        assert_eq!(store.policy().unwrap(), &window);
    }
}
