//! Rate limiting logic and state management.

mod decision;
mod fixed_window;
mod guard;
mod key;
mod leaky_bucket;
mod limiter;
mod policy;
mod queue;
mod state;
mod token_bucket;

pub use decision::{Decision, Outcome};
pub use fixed_window::FixedWindow;
pub use guard::{ConstructionTracker, StoreRegistry};
pub use key::namespaced;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{
    Admission, KeyResolver, LimitResolver, OutcomeHandle, RateLimiter, RateLimiterBuilder,
    RejectionHandler,
};
pub use policy::{AlgorithmKind, Policy};
pub use queue::{LeakyQueue, Permit};
pub use state::{BucketState, Consumption};
pub use token_bucket::TokenBucket;
