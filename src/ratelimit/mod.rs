//! Rate limiting logic and state management.

mod clock;
mod counter;
mod limiter;
mod policy;
mod snapshot;
mod store;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterKey, CounterRecord};
pub use limiter::{Decision, RateLimiter};
pub use policy::{Policy, PolicyRegistry};
pub use snapshot::{RecordState, Snapshot, SNAPSHOT_VERSION};
pub use store::{CounterStore, Hit, LimiterStats};
pub use sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};
