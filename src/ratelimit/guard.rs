//! Integration checks that catch limiter misconfiguration early.
//!
//! Two process-wide checks run at construction time: a limiter must not be
//! rebuilt on every request, and a store must not back two limiters unless it
//! is shareable or handed over with `shared_store`. The per-decision checks
//! run on a limiter's first call and switch themselves off once they pass.
//! Fixed-window limiters also increment a private key once and expect exactly
//! one hit back, which catches stores that count a request twice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::DateTime;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::policy::Policy;
use super::state::Consumption;
use crate::error::{FloodgateError, Result};
use crate::store::Store;

/// Constructions tolerated per window once traffic is flowing.
const LATE_CONSTRUCTION_LIMIT: usize = 100;
const LATE_CONSTRUCTION_WINDOW: Duration = Duration::from_secs(1);

/// Counts limiter constructions that happen after some limiter already
/// served requests. A burst of those means a limiter is being built inside
/// a request handler.
#[derive(Debug)]
pub struct ConstructionTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    serving_since: Option<Instant>,
    late: VecDeque<Instant>,
}

impl ConstructionTracker {
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(TrackerState {
                serving_since: None,
                late: VecDeque::new(),
            }),
        }
    }

    /// The process-wide tracker.
    pub fn global() -> &'static ConstructionTracker {
        static GLOBAL: ConstructionTracker = ConstructionTracker::new();
        &GLOBAL
    }

    /// Note that some limiter has answered a request.
    pub fn record_served(&self, at: Instant) {
        self.state.lock().serving_since.get_or_insert(at);
    }

    pub fn record_construction(&self, at: Instant) -> Result<()> {
        let mut state = self.state.lock();
        match state.serving_since {
            Some(since) if at >= since => {}
            _ => return Ok(()),
        }

        state.late.push_back(at);
        while let Some(&oldest) = state.late.front() {
            if at.duration_since(oldest) > LATE_CONSTRUCTION_WINDOW {
                state.late.pop_front();
            } else {
                break;
            }
        }

        if state.late.len() > LATE_CONSTRUCTION_LIMIT {
            return Err(FloodgateError::InvariantViolation(format!(
                "{} rate limiters constructed within {:?} while serving requests; \
                 build the limiter once and reuse it",
                state.late.len(),
                LATE_CONSTRUCTION_WINDOW
            )));
        }
        Ok(())
    }
}

impl Default for ConstructionTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct Claim {
    store: Weak<dyn Store>,
    holders: usize,
    shared: bool,
}

/// Records which stores are attached to a live limiter.
#[derive(Default)]
pub struct StoreRegistry {
    claims: DashMap<usize, Claim>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("claims", &self.claims.len())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static StoreRegistry {
        static GLOBAL: OnceLock<StoreRegistry> = OnceLock::new();
        GLOBAL.get_or_init(StoreRegistry::new)
    }

    /// Attach `store` to a limiter. Exclusive claims fail while any other
    /// live claim exists, unless the store declares itself shareable.
    /// Shared claims only conflict with an exclusive one.
    pub fn claim(&self, store: &Arc<dyn Store>, shared: bool) -> Result<StoreClaim<'_>> {
        let shared = shared || store.capabilities().shareable;
        let id = store_id(store);

        match self.claims.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(Claim {
                    store: Arc::downgrade(store),
                    holders: 1,
                    shared,
                });
            }
            Entry::Occupied(mut entry) => {
                let claim = entry.get_mut();
                if claim.store.upgrade().is_none() {
                    // Stale claim left by a dropped store.
                    *claim = Claim {
                        store: Arc::downgrade(store),
                        holders: 1,
                        shared,
                    };
                } else if shared && claim.shared {
                    claim.holders += 1;
                } else {
                    return Err(FloodgateError::InvariantViolation(format!(
                        "{} store is already attached to another rate limiter; \
                         pass it with shared_store to share it intentionally",
                        store.name()
                    )));
                }
            }
        }

        debug!(store = store.name(), shared, "Store claimed");
        Ok(StoreClaim { registry: self, id })
    }

    pub fn is_claimed(&self, store: &Arc<dyn Store>) -> bool {
        self.claims
            .get(&store_id(store))
            .map_or(false, |claim| claim.store.upgrade().is_some())
    }

    fn release(&self, id: usize) {
        if let Entry::Occupied(mut entry) = self.claims.entry(id) {
            let claim = entry.get_mut();
            claim.holders = claim.holders.saturating_sub(1);
            if claim.holders == 0 {
                entry.remove();
            }
        }
    }
}

fn store_id(store: &Arc<dyn Store>) -> usize {
    Arc::as_ptr(store) as *const () as usize
}

/// A store attachment, released on drop.
pub struct StoreClaim<'r> {
    registry: &'r StoreRegistry,
    id: usize,
}

impl std::fmt::Debug for StoreClaim<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClaim").field("id", &self.id).finish()
    }
}

impl Drop for StoreClaim<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Per-limiter decision checks, active until the first clean pass.
#[derive(Debug)]
pub struct Guard {
    enabled: bool,
    passed: AtomicBool,
    count_checked: AtomicBool,
}

impl Guard {
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            warn!("Rate limiter guard checks disabled");
        }
        Self {
            enabled,
            passed: AtomicBool::new(false),
            count_checked: AtomicBool::new(false),
        }
    }

    /// Returns `true` exactly once per enabled guard, for the caller that
    /// runs the single-count check.
    pub fn claim_count_check(&self) -> bool {
        self.enabled && !self.count_checked.swap(true, Ordering::AcqRel)
    }

    /// Whether the next decision should be checked.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.passed.load(Ordering::Acquire)
    }

    /// Validate one store result. `limit` is the effective limit after any
    /// resolver; `require_reset` demands a concrete reset time.
    pub fn check(
        &self,
        policy: &Policy,
        consumption: &Consumption,
        limit: f64,
        require_reset: bool,
    ) -> Result<()> {
        check_limit(limit)?;
        check_hits(policy, consumption)?;
        if require_reset {
            check_reset(consumption)?;
        }
        Ok(())
    }

    /// Turn the checks off after a clean pass.
    pub fn pass(&self) {
        if !self.passed.swap(true, Ordering::AcqRel) {
            debug!("Rate limiter guard checks passed");
        }
    }
}

/// A resolved limit must be a finite, non-negative number.
pub fn check_limit(limit: f64) -> Result<()> {
    if !limit.is_finite() || limit < 0.0 {
        return Err(FloodgateError::InvariantViolation(format!(
            "limit must be a finite non-negative number, got {}",
            limit
        )));
    }
    Ok(())
}

/// A single increment must report a positive usage that fits the policy: a
/// whole hit count for a fixed window, a level within capacity for the
/// buckets.
pub fn check_hits(policy: &Policy, consumption: &Consumption) -> Result<()> {
    let used = consumption.used;
    if !used.is_finite() || used <= 0.0 {
        return Err(FloodgateError::InvariantViolation(format!(
            "store reported a non-positive hit count {} after one increment",
            used
        )));
    }
    match policy {
        Policy::FixedWindow(_) => {
            if used.fract() != 0.0 {
                return Err(FloodgateError::InvariantViolation(format!(
                    "fixed-window hit count {} is not a whole number",
                    used
                )));
            }
        }
        Policy::TokenBucket(_) | Policy::LeakyBucket(_) => {
            let capacity = policy.capacity() as f64;
            if used > capacity + f64::EPSILON * capacity.max(1.0) {
                return Err(FloodgateError::InvariantViolation(format!(
                    "store reported usage {} above capacity {}",
                    used, capacity
                )));
            }
        }
    }
    Ok(())
}

/// The first increment of a never-seen fixed-window key must count one hit.
pub fn check_single_count(consumption: &Consumption) -> Result<()> {
    if consumption.used != 1.0 {
        return Err(FloodgateError::InvariantViolation(format!(
            "store counted {} hits for a single increment of a new key",
            consumption.used
        )));
    }
    Ok(())
}

/// A decision advertising its reset time must have a concrete one.
pub fn check_reset(consumption: &Consumption) -> Result<()> {
    match consumption.reset_at_ms.and_then(DateTime::from_timestamp_millis) {
        Some(_) => Ok(()),
        None => Err(FloodgateError::InvariantViolation(
            "standard headers are enabled but the store reported no reset time".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn consumption(used: f64, reset_at_ms: Option<i64>) -> Consumption {
        Consumption {
            admitted: true,
            used,
            reset_at_ms,
        }
    }

    #[test]
    fn test_construction_before_traffic_is_unbounded() {
        let tracker = ConstructionTracker::new();
        let now = Instant::now();
        for _ in 0..1_000 {
            tracker.record_construction(now).unwrap();
        }
    }

    #[test]
    fn test_construction_burst_while_serving() {
        let tracker = ConstructionTracker::new();
        let start = Instant::now();
        tracker.record_served(start);

        for _ in 0..LATE_CONSTRUCTION_LIMIT {
            tracker.record_construction(start).unwrap();
        }
        let err = tracker.record_construction(start).unwrap_err();
        assert!(matches!(err, FloodgateError::InvariantViolation(_)));
    }

    #[test]
    fn test_construction_spread_out_is_fine() {
        let tracker = ConstructionTracker::new();
        let start = Instant::now();
        tracker.record_served(start);

        for i in 0..(LATE_CONSTRUCTION_LIMIT as u64 * 3) {
            let at = start + Duration::from_millis(i * 20);
            tracker.record_construction(at).unwrap();
        }
    }

    #[test]
    fn test_exclusive_claim_conflicts() {
        let registry = StoreRegistry::new();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let claim = registry.claim(&store, false).unwrap();
        assert!(registry.is_claimed(&store));
        assert!(matches!(
            registry.claim(&store, false),
            Err(FloodgateError::InvariantViolation(_))
        ));
        assert!(registry.claim(&store, true).is_err());

        drop(claim);
        assert!(!registry.is_claimed(&store));
        registry.claim(&store, false).unwrap();
    }

    #[test]
    fn test_shared_claims_coexist() {
        let registry = StoreRegistry::new();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let a = registry.claim(&store, true).unwrap();
        let b = registry.claim(&store, true).unwrap();
        assert!(registry.claim(&store, false).is_err());

        drop(a);
        assert!(registry.is_claimed(&store));
        drop(b);
        assert!(!registry.is_claimed(&store));
    }

    #[test]
    fn test_distinct_stores_do_not_conflict() {
        let registry = StoreRegistry::new();
        let a: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let b: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let _ca = registry.claim(&a, false).unwrap();
        let _cb = registry.claim(&b, false).unwrap();
    }

    #[test]
    fn test_hit_checks() {
        let window = Policy::fixed_window(3, 1_000);
        assert!(check_hits(&window, &consumption(1.0, None)).is_ok());
        assert!(check_hits(&window, &consumption(0.0, None)).is_err());
        assert!(check_hits(&window, &consumption(-1.0, None)).is_err());
        assert!(check_hits(&window, &consumption(1.5, None)).is_err());
        assert!(check_hits(&window, &consumption(f64::NAN, None)).is_err());

        let bucket = Policy::token_bucket(5, 1.0);
        assert!(check_hits(&bucket, &consumption(5.0, None)).is_ok());
        assert!(check_hits(&bucket, &consumption(6.0, None)).is_err());
    }

    #[test]
    fn test_single_count_check() {
        assert!(check_single_count(&consumption(1.0, None)).is_ok());
        assert!(matches!(
            check_single_count(&consumption(2.0, None)),
            Err(FloodgateError::InvariantViolation(_))
        ));
        assert!(check_single_count(&consumption(0.0, None)).is_err());
    }

    #[test]
    fn test_limit_and_reset_checks() {
        assert!(check_limit(0.0).is_ok());
        assert!(check_limit(10.0).is_ok());
        assert!(check_limit(-1.0).is_err());
        assert!(check_limit(f64::INFINITY).is_err());

        assert!(check_reset(&consumption(1.0, Some(1_700_000_000_000))).is_ok());
        assert!(check_reset(&consumption(1.0, None)).is_err());
        assert!(check_reset(&consumption(1.0, Some(i64::MAX))).is_err());
    }

    #[test]
    fn test_guard_switches_off_after_pass() {
        let guard = Guard::new(true);
        assert!(guard.is_active());
        guard.pass();
        assert!(!guard.is_active());

        assert!(!Guard::new(false).is_active());
    }

    #[test]
    fn test_count_check_claimed_once() {
        let guard = Guard::new(true);
        assert!(guard.claim_count_check());
        assert!(!guard.claim_count_check());

        assert!(!Guard::new(false).claim_count_check());
    }
}
