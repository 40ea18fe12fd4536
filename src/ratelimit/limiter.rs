//! Core rate limiter implementation.
//!
//! A [`RateLimiter`] resolves a key from the caller's request context,
//! consumes one unit from its store and turns the result into a
//! [`Decision`]. It is built once and shared across request handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::decision::{Decision, Outcome};
use super::guard::{check_single_count, ConstructionTracker, Guard, StoreClaim, StoreRegistry};
use super::policy::Policy;
use super::state::BucketState;
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, ReverseOnOutcome, StoreConfig};
use crate::error::{FloodgateError, Result};
use crate::store::{self, Store};

/// Maps a request context to its rate key.
pub type KeyResolver<C> = Arc<dyn Fn(&C) -> String + Send + Sync>;
/// Called for every rejected request.
pub type RejectionHandler<C> = Arc<dyn Fn(&C, &Decision) + Send + Sync>;
/// Per-request limit override for fixed windows.
pub type LimitResolver<C> = Arc<dyn Fn(&C) -> f64 + Send + Sync>;

/// The decision for one request plus the handle used to report how the
/// request finished.
#[derive(Debug)]
pub struct Admission {
    pub decision: Decision,
    pub outcome: OutcomeHandle,
}

/// Single-shot completion signal for one admitted request.
///
/// Depending on [`ReverseOnOutcome`], reporting an outcome gives the
/// consumed unit back to the store. Only the first report counts, across
/// all clones of the handle.
#[derive(Debug, Clone, Default)]
pub struct OutcomeHandle {
    reversal: Option<Arc<Reversal>>,
}

struct Reversal {
    store: Arc<dyn Store>,
    key: String,
    reverse: ReverseOnOutcome,
    reported: AtomicBool,
}

impl std::fmt::Debug for Reversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reversal")
            .field("key", &self.key)
            .field("reverse", &self.reverse)
            .field("reported", &self.reported.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl OutcomeHandle {
    fn armed(store: Arc<dyn Store>, key: String, reverse: ReverseOnOutcome) -> Self {
        Self {
            reversal: Some(Arc::new(Reversal {
                store,
                key,
                reverse,
                reported: AtomicBool::new(false),
            })),
        }
    }

    /// Whether reporting an outcome can have any effect.
    pub fn is_armed(&self) -> bool {
        self.reversal.is_some()
    }

    /// Report how the request finished. Returns `true` if this call gave
    /// the consumed unit back; repeated reports are no-ops returning `false`.
    /// A failed reversal leaves the handle unreported so it can be retried.
    pub async fn report(&self, outcome: Outcome) -> Result<bool> {
        let Some(reversal) = &self.reversal else {
            return Ok(false);
        };
        if reversal.reported.swap(true, Ordering::AcqRel) {
            trace!(key = %reversal.key, "Outcome already reported");
            return Ok(false);
        }

        let reverse = match outcome {
            Outcome::Success => reversal.reverse.on_success,
            Outcome::Failure => reversal.reverse.on_failure,
        };
        if !reverse {
            return Ok(false);
        }

        if let Err(err) = reversal.store.decrement(&reversal.key).await {
            reversal.reported.store(false, Ordering::Release);
            warn!(key = %reversal.key, error = %err, "Failed to reverse consumption");
            return Err(err);
        }
        debug!(key = %reversal.key, ?outcome, "Reversed consumption");
        Ok(true)
    }
}

/// Admission-control front end for one policy and one store.
pub struct RateLimiter<C> {
    id: Uuid,
    config: LimiterConfig,
    policy: Policy,
    store: Arc<dyn Store>,
    shared: bool,
    claim: Mutex<Option<StoreClaim<'static>>>,
    guard: Guard,
    key_resolver: KeyResolver<C>,
    on_rejected: Option<RejectionHandler<C>>,
    limit_resolver: Option<LimitResolver<C>>,
    served: AtomicBool,
    closed: AtomicBool,
}

impl<C> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("store", &self.store.name())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl<C> RateLimiter<C> {
    /// Start building a limiter from its configuration.
    pub fn builder(config: LimiterConfig) -> RateLimiterBuilder<C> {
        RateLimiterBuilder {
            config,
            key_resolver: None,
            on_rejected: None,
            limit_resolver: None,
            store: None,
            store_config: StoreConfig::default(),
            clock: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Check and consume one unit for the request.
    ///
    /// Rejection is reported through [`Decision::admitted`]; errors are
    /// store failures (when not failing open) and guard violations.
    pub async fn check(&self, ctx: &C) -> Result<Admission> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FloodgateError::InvariantViolation(
                "rate limiter used after shutdown".to_string(),
            ));
        }

        let key = (self.key_resolver)(ctx);
        let raw_limit = match &self.limit_resolver {
            Some(resolve) => resolve(ctx),
            None => self.policy.capacity() as f64,
        };

        trace!(limiter = %self.id, key = %key, "Checking rate limit");

        if matches!(self.policy, Policy::FixedWindow(_)) && self.guard.claim_count_check() {
            self.check_single_count().await?;
        }

        let consumption = match self.store.increment(&key).await {
            Ok(consumption) => consumption,
            Err(err) if err.is_backend() && self.config.fail_open_on_store_error => {
                warn!(
                    limiter = %self.id,
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Store unavailable, admitting request"
                );
                return Ok(Admission {
                    decision: Decision::fail_open(effective_limit(raw_limit)),
                    outcome: OutcomeHandle::default(),
                });
            }
            Err(err) => {
                error!(
                    limiter = %self.id,
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit check failed"
                );
                return Err(err);
            }
        };

        if self.guard.is_active() {
            self.guard.check(
                &self.policy,
                &consumption,
                raw_limit,
                self.config.standard_headers,
            )?;
            self.guard.pass();
        }
        if !self.served.swap(true, Ordering::AcqRel) {
            ConstructionTracker::global().record_served(Instant::now());
        }

        let limit = effective_limit(raw_limit);
        let mut decision = Decision::from_consumption(limit, &consumption);
        if self.limit_resolver.is_some() {
            decision.admitted = decision.used <= limit;
        }

        // Fixed windows count every hit; the buckets only consume on admit.
        let consumed = decision.admitted || matches!(self.policy, Policy::FixedWindow(_));
        let outcome = if consumed && self.config.reverse_on_outcome.any() {
            OutcomeHandle::armed(
                Arc::clone(&self.store),
                key.clone(),
                self.config.reverse_on_outcome,
            )
        } else {
            OutcomeHandle::default()
        };

        if decision.admitted {
            trace!(
                limiter = %self.id,
                key = %key,
                used = decision.used,
                limit = decision.limit,
                "Request admitted"
            );
        } else {
            debug!(
                limiter = %self.id,
                key = %key,
                used = decision.used,
                limit = decision.limit,
                "Rate limit exceeded"
            );
            if let Some(handler) = &self.on_rejected {
                handler(ctx, &decision);
            }
        }

        Ok(Admission { decision, outcome })
    }

    /// Increment a key private to this limiter and expect exactly one hit.
    async fn check_single_count(&self) -> Result<()> {
        let key = format!("floodgate-guard:{}", self.id);
        let consumption = match self.store.increment(&key).await {
            Ok(consumption) => consumption,
            Err(err) if err.is_backend() => {
                // Left to the request's own increment to report.
                debug!(limiter = %self.id, error = %err, "Skipped single-count check");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = self.store.reset_key(&key).await {
            warn!(limiter = %self.id, key = %key, error = %err, "Failed to clear guard key");
        }
        check_single_count(&consumption)
    }

    /// Forget all state for `key`.
    pub async fn reset_key(&self, key: &str) -> Result<()> {
        self.store.reset_key(key).await?;
        debug!(limiter = %self.id, key, "Key reset");
        Ok(())
    }

    /// Current state for `key`, if the store supports reads.
    pub async fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let managed = self.store.managed().ok_or_else(|| {
            FloodgateError::Config(format!("{} store does not support get", self.store.name()))
        })?;
        managed.get(key).await
    }

    /// Release the store. Shareable stores and stores handed over with
    /// `shared_store` are left running for their other limiters. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(self.claim.lock().take());

        if !self.shared {
            if let Some(managed) = self.store.managed() {
                managed.shutdown().await?;
            }
        }
        info!(limiter = %self.id, store = self.store.name(), "Rate limiter shut down");
        Ok(())
    }
}

/// Clamp a resolved limit into a whole, non-negative count.
fn effective_limit(limit: f64) -> u64 {
    if limit.is_finite() && limit > 0.0 {
        limit.floor() as u64
    } else {
        0
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<C> {
    config: LimiterConfig,
    key_resolver: Option<KeyResolver<C>>,
    on_rejected: Option<RejectionHandler<C>>,
    limit_resolver: Option<LimitResolver<C>>,
    store: Option<(Arc<dyn Store>, bool)>,
    store_config: StoreConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl<C> RateLimiterBuilder<C> {
    pub fn key_resolver<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.key_resolver = Some(Arc::new(resolve));
        self
    }

    pub fn on_rejected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&C, &Decision) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(handler));
        self
    }

    /// Resolve the limit per request. Fixed-window only.
    pub fn limit_resolver<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&C) -> f64 + Send + Sync + 'static,
    {
        self.limit_resolver = Some(Arc::new(resolve));
        self
    }

    /// Use `store` exclusively.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some((store, false));
        self
    }

    /// Use `store` alongside other limiters.
    pub fn shared_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some((store, true));
        self
    }

    /// Store to create when none is passed in. Defaults to memory.
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Clock for a store created from `store_config`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate, attach and initialise the store.
    pub async fn build(self) -> Result<RateLimiter<C>> {
        let policy = Policy::try_from(&self.config.algorithm)?;
        let key_resolver = self
            .key_resolver
            .ok_or_else(|| FloodgateError::Config("a key resolver is required".to_string()))?;
        if self.limit_resolver.is_some() && !matches!(policy, Policy::FixedWindow(_)) {
            return Err(FloodgateError::Config(format!(
                "a limit resolver needs a fixed-window algorithm, not {}",
                policy.kind()
            )));
        }

        let validate = self.config.validate;
        if validate {
            ConstructionTracker::global().record_construction(Instant::now())?;
        }

        let (store, shared) = match self.store {
            Some(given) => given,
            None => {
                let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
                (store::create(&self.store_config, clock)?, false)
            }
        };

        let capabilities = store.capabilities();
        let shared = shared || capabilities.shareable;
        let claim = if validate {
            Some(StoreRegistry::global().claim(&store, shared)?)
        } else {
            None
        };

        match store.managed() {
            Some(managed) => managed.init(&policy).await?,
            None => debug!(store = store.name(), "Store has no lifecycle operations"),
        }

        let id = Uuid::new_v4();
        info!(
            limiter = %id,
            algorithm = %policy.kind(),
            limit = policy.capacity(),
            store = store.name(),
            shared,
            "Rate limiter ready"
        );
        if capabilities.local_keys {
            debug!(limiter = %id, "Store state is local to this process");
        }

        Ok(RateLimiter {
            id,
            policy,
            store,
            shared,
            claim: Mutex::new(claim),
            guard: Guard::new(validate),
            key_resolver,
            on_rejected: self.on_rejected,
            limit_resolver: self.limit_resolver,
            served: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config: self.config,
        })
    }
}
