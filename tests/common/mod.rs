//! Store conformance checks shared by the backend suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use floodgate::clock::{Clock, ManualClock, SystemClock};
use floodgate::ratelimit::Policy;
use floodgate::store::{ManagedStore, Store};

pub const T0: i64 = 1_700_000_000_000;

/// Builds a fresh, uninitialised store on the given clock.
pub type StoreFactory = Box<dyn Fn(Arc<dyn Clock>) -> Arc<dyn Store>>;

pub fn unique_key(label: &str) -> String {
    format!("{}-{}", label, uuid::Uuid::new_v4())
}

fn managed(store: &Arc<dyn Store>) -> &dyn ManagedStore {
    store.managed().expect("store supports lifecycle operations")
}

async fn setup(factory: &StoreFactory, policy: Policy) -> (Arc<dyn Store>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = factory(clock.clone());
    managed(&store).init(&policy).await.unwrap();
    (store, clock)
}

pub async fn fixed_window_boundary(factory: &StoreFactory) {
    let (store, clock) = setup(factory, Policy::fixed_window(3, 1_000)).await;
    let key = unique_key("fw");

    for i in 1..=3 {
        let c = store.increment(&key).await.unwrap();
        assert!(c.admitted, "hit {} should be admitted", i);
        assert_eq!(c.used, i as f64);
        assert_eq!(c.reset_at_ms, Some(T0 + 1_000));
    }
    let c = store.increment(&key).await.unwrap();
    assert!(!c.admitted);
    assert_eq!(c.used, 4.0);

    clock.advance(Duration::from_millis(1_000));
    let c = store.increment(&key).await.unwrap();
    assert!(c.admitted);
    assert_eq!(c.used, 1.0);
    assert_eq!(c.reset_at_ms, Some(T0 + 2_000));

    managed(&store).shutdown().await.unwrap();
}

pub async fn token_bucket_refill(factory: &StoreFactory) {
    let (store, clock) = setup(factory, Policy::token_bucket(5, 1.0)).await;
    let key = unique_key("tb");

    for _ in 0..5 {
        assert!(store.increment(&key).await.unwrap().admitted);
    }
    let c = store.increment(&key).await.unwrap();
    assert!(!c.admitted);
    assert_eq!(c.used, 5.0);

    clock.advance(Duration::from_millis(999));
    assert!(!store.increment(&key).await.unwrap().admitted);

    clock.advance(Duration::from_millis(1));
    assert!(store.increment(&key).await.unwrap().admitted);
    assert!(!store.increment(&key).await.unwrap().admitted);

    managed(&store).shutdown().await.unwrap();
}

pub async fn leaky_bucket_admission(factory: &StoreFactory) {
    let (store, clock) = setup(factory, Policy::leaky_bucket(3, 1.0)).await;
    let key = unique_key("lb");

    for _ in 0..3 {
        assert!(store.increment(&key).await.unwrap().admitted);
    }
    // Rejection leaves the level untouched.
    let c = store.increment(&key).await.unwrap();
    assert!(!c.admitted);
    assert_eq!(c.used, 3.0);

    clock.advance(Duration::from_millis(1_500));
    let c = store.increment(&key).await.unwrap();
    assert!(c.admitted);
    assert!((c.used - 2.5).abs() < 1e-6);

    let state = managed(&store).get(&key).await.unwrap().unwrap();
    assert!(state.level() <= 3.0);

    managed(&store).shutdown().await.unwrap();
}

pub async fn reset_key_is_pristine(factory: &StoreFactory) {
    let policy = Policy::token_bucket(5, 1.0);
    let (store, _) = setup(factory, policy).await;
    let key = unique_key("reset");

    for _ in 0..3 {
        store.increment(&key).await.unwrap();
    }
    store.reset_key(&key).await.unwrap();

    match managed(&store).get(&key).await.unwrap() {
        None => {}
        Some(state) => assert!(policy.is_pristine(&state, T0), "{:?}", state),
    }
    for _ in 0..5 {
        assert!(store.increment(&key).await.unwrap().admitted);
    }

    managed(&store).shutdown().await.unwrap();
}

pub async fn decrement_is_bounded(factory: &StoreFactory) {
    let (store, _) = setup(factory, Policy::token_bucket(3, 1.0)).await;
    let key = unique_key("dec");

    store.increment(&key).await.unwrap();
    for _ in 0..10 {
        store.decrement(&key).await.unwrap();
    }
    let state = managed(&store).get(&key).await.unwrap().unwrap();
    assert_eq!(state.level(), 3.0);

    // Nothing to give back on a key that was never seen.
    let unseen = unique_key("unseen");
    store.decrement(&unseen).await.unwrap();
    assert_eq!(managed(&store).get(&unseen).await.unwrap(), None);

    managed(&store).shutdown().await.unwrap();
}

pub async fn reset_all_forgets_keys(factory: &StoreFactory) {
    let (store, _) = setup(factory, Policy::fixed_window(1, 60_000)).await;
    let a = unique_key("a");
    let b = unique_key("b");

    store.increment(&a).await.unwrap();
    store.increment(&b).await.unwrap();
    managed(&store).reset_all().await.unwrap();

    assert_eq!(managed(&store).get(&a).await.unwrap(), None);
    assert!(store.increment(&b).await.unwrap().admitted);

    managed(&store).shutdown().await.unwrap();
}

/// Fire `callers` increments at one fresh key at once; exactly `capacity`
/// must be admitted.
pub async fn concurrent_increments_admit_capacity(
    factory: &StoreFactory,
    callers: usize,
    capacity: u64,
) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = factory(clock);
    managed(&store)
        .init(&Policy::token_bucket(capacity, 0.000_1))
        .await
        .unwrap();
    let key = unique_key("hot");

    let calls = (0..callers).map(|_| {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move { store.increment(&key).await.unwrap().admitted })
    });
    let admitted = join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|admitted| *admitted)
        .count();

    assert_eq!(admitted as u64, capacity);
    managed(&store).shutdown().await.unwrap();
}
