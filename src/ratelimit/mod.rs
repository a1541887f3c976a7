//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod policy;
mod store;
mod sweeper;

pub use backend::Limiter;
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::MockClock;
pub use clock::{Clock, SystemClock};
pub use counter::{Decision, WindowCounter};
pub use policy::{
    Policy, PolicyRegistry, PolicySpec, DEFAULT_GROUP, DEFAULT_INTERVAL_SECS, DEFAULT_LIMIT,
};
pub use store::CounterStore;
pub use sweeper::Sweeper;
