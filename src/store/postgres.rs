//! PostgreSQL-backed store.
//!
//! One row per key. Every mutation runs in a transaction that takes a row
//! lock (`SELECT ... FOR UPDATE`) before applying the policy transition,
//! so concurrent callers on the same key serialize in the database.
//! Serialization failures and deadlocks are retried with jittered backoff
//! up to a configured bound.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use super::{ManagedStore, Store, StoreCapabilities};
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{namespaced, BucketState, Consumption, Policy};

const NAME: &str = "postgres";

/// SQLSTATEs worth retrying: serialization_failure, deadlock_detected.
const RETRYABLE: [&str; 2] = ["40001", "40P01"];
/// SQLSTATEs raised when two sessions race on `CREATE TABLE IF NOT EXISTS`.
const ALREADY_EXISTS: [&str; 2] = ["42P07", "23505"];

const BACKOFF_BASE_MS: u64 = 5;

/// Store backed by a PostgreSQL table.
pub struct PostgresStore {
    url: String,
    table: String,
    max_connections: u32,
    max_conflict_retries: u32,
    prefix: String,
    clock: Arc<dyn Clock>,
    policy: OnceLock<Policy>,
    pool: Mutex<Option<PgPool>>,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("table", &self.table)
            .field("prefix", &self.prefix)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .field("policy", &self.policy.get())
            .finish_non_exhaustive()
    }
}

/// Builder for [`PostgresStore`].
pub struct PostgresStoreBuilder {
    url: String,
    table: String,
    max_connections: u32,
    max_conflict_retries: u32,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl PostgresStoreBuilder {
    /// Table holding the bucket rows. Must be a plain SQL identifier.
    pub fn table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(FloodgateError::Config(format!(
                "invalid table name {:?}",
                table
            )));
        }
        self.table = table;
        Ok(self)
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// How many times a conflicting transaction is retried before the
    /// operation fails.
    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> PostgresStore {
        PostgresStore {
            url: self.url,
            table: self.table,
            max_connections: self.max_connections,
            max_conflict_retries: self.max_conflict_retries,
            prefix: self.prefix,
            clock: self.clock,
            policy: OnceLock::new(),
            pool: Mutex::new(None),
        }
    }
}

impl PostgresStore {
    /// Start building a store for the database at `url`. No connection is
    /// made until [`ManagedStore::init`].
    pub fn builder(url: impl Into<String>) -> PostgresStoreBuilder {
        PostgresStoreBuilder {
            url: url.into(),
            table: "floodgate_buckets".to_string(),
            max_connections: 10,
            max_conflict_retries: 3,
            prefix: String::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn policy(&self) -> Result<&Policy> {
        self.policy.get().ok_or(FloodgateError::NotInitialized(NAME))
    }

    /// Bind the store to `policy`. Concurrent callers agree on one winner.
    fn claim_policy(&self, policy: &Policy) -> Result<()> {
        let existing = self.policy.get_or_init(|| *policy);
        if existing != policy {
            return Err(FloodgateError::Config(format!(
                "postgres store already initialised for {}",
                existing.kind()
            )));
        }
        Ok(())
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool
            .lock()
            .clone()
            .ok_or(FloodgateError::NotInitialized(NAME))
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.prefix, key)
    }

    /// Run `op` in its own transaction, retrying conflicts.
    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = sqlx::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying conflicting transaction");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if is_retryable(&err) {
                        warn!(op, attempts = attempt + 1, "Giving up on conflicting transaction");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    async fn consume_once(&self, pool: &PgPool, policy: &Policy, key: &str) -> sqlx::Result<Consumption> {
        let mut tx = pool.begin().await?;
        match self.consume_in(&mut tx, policy, key).await {
            Ok(consumption) => {
                tx.commit().await?;
                Ok(consumption)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn consume_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy: &Policy,
        key: &str,
    ) -> sqlx::Result<Consumption> {
        let now = self.clock.now_ms();
        let (level, stamp) = policy.fresh(now).to_row();
        let (_, rate) = policy.interval_and_rate();

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (key, level, last_update, capacity, rate)
            VALUES ($1, $2::float8::numeric, $3, $4::float8::numeric, $5::float8::numeric)
            ON CONFLICT (key) DO NOTHING
            "#,
            self.table
        ))
        .bind(key)
        .bind(level)
        .bind(timestamp(stamp)?)
        .bind(policy.capacity() as f64)
        .bind(rate)
        .execute(&mut **tx)
        .await?;

        let (level, last_update): (f64, DateTime<Utc>) = sqlx::query_as(&format!(
            "SELECT level::float8, last_update FROM {} WHERE key = $1 FOR UPDATE",
            self.table
        ))
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;

        let state = policy.state_from_row(level, last_update.timestamp_millis());
        let (next, consumption) = policy.consume(Some(state), now);
        self.write_row(tx, policy, key, &next).await?;
        Ok(consumption)
    }

    async fn release_once(&self, pool: &PgPool, policy: &Policy, key: &str) -> sqlx::Result<bool> {
        let mut tx = pool.begin().await?;
        match self.release_in(&mut tx, policy, key).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn release_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy: &Policy,
        key: &str,
    ) -> sqlx::Result<bool> {
        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT level::float8, last_update FROM {} WHERE key = $1 FOR UPDATE",
            self.table
        ))
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((level, last_update)) = row else {
            return Ok(false);
        };
        let state = policy.state_from_row(level, last_update.timestamp_millis());
        let next = policy.release(state, self.clock.now_ms());
        self.write_row(tx, policy, key, &next).await?;
        Ok(true)
    }

    async fn write_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy: &Policy,
        key: &str,
        state: &BucketState,
    ) -> sqlx::Result<()> {
        let (level, stamp) = state.to_row();
        let (_, rate) = policy.interval_and_rate();
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET level = $2::float8::numeric,
                last_update = $3,
                capacity = $4::float8::numeric,
                rate = $5::float8::numeric
            WHERE key = $1
            "#,
            self.table
        ))
        .bind(key)
        .bind(level)
        .bind(timestamp(stamp)?)
        .bind(policy.capacity() as f64)
        .bind(rate)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
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
        let pool = self.pool()?;
        let key = self.key(key);
        self.with_retries("increment", || self.consume_once(&pool, policy, &key))
            .await
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let policy = self.policy()?;
        let pool = self.pool()?;
        let key = self.key(key);
        let applied = self
            .with_retries("decrement", || self.release_once(&pool, policy, &key))
            .await?;
        if !applied {
            debug!(key = %key, "Decrement on unknown key ignored");
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table))
            .bind(self.key(key))
            .execute(&pool)
            .await?;
        Ok(())
    }

    fn managed(&self) -> Option<&dyn ManagedStore> {
        Some(self)
    }
}

#[async_trait]
impl ManagedStore for PostgresStore {
    async fn init(&self, policy: &Policy) -> Result<()> {
        self.claim_policy(policy)?;
        if self.pool.lock().is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await?;

        let created = sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                level NUMERIC NOT NULL,
                last_update TIMESTAMPTZ NOT NULL,
                capacity NUMERIC NOT NULL,
                rate NUMERIC NOT NULL
            )
            "#,
            self.table
        ))
        .execute(&pool)
        .await;
        match created {
            Ok(_) => {}
            Err(err) if has_code(&err, &ALREADY_EXISTS) => {
                debug!(table = %self.table, "Table created concurrently");
            }
            Err(err) => return Err(err.into()),
        }

        *self.pool.lock() = Some(pool);

        info!(
            algorithm = %policy.kind(),
            table = %self.table,
            "Postgres store initialised"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let policy = self.policy()?;
        let pool = self.pool()?;

        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT level::float8, last_update FROM {} WHERE key = $1",
            self.table
        ))
        .bind(self.key(key))
        .fetch_optional(&pool)
        .await?;

        Ok(row.map(|(level, last_update)| {
            let state = policy.state_from_row(level, last_update.timestamp_millis());
            policy.advance(state, self.clock.now_ms())
        }))
    }

    async fn reset_all(&self) -> Result<()> {
        let pool = self.pool()?;
        let removed = if self.prefix.is_empty() {
            sqlx::query(&format!("DELETE FROM {}", self.table))
                .execute(&pool)
                .await?
                .rows_affected()
        } else {
            sqlx::query(&format!("DELETE FROM {} WHERE key LIKE $1 ESCAPE '\\'", self.table))
                .bind(format!("{}%", escape_like(&self.prefix)))
                .execute(&pool)
                .await?
                .rows_affected()
        };

        info!(table = %self.table, removed, "Postgres store reset");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(table = %self.table, "Postgres store shut down");
        }
        Ok(())
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(err) = tx.rollback().await {
        debug!(error = %err, "Rollback failed");
    }
}

fn timestamp(ms: i64) -> sqlx::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| sqlx::Error::Protocol(format!("timestamp out of range: {}", ms)))
}

fn has_code(err: &sqlx::Error, codes: &[&str]) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| codes.contains(&code.as_ref()))
}

fn is_retryable(err: &sqlx::Error) -> bool {
    has_code(err, &RETRYABLE)
}

fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base + jitter)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
