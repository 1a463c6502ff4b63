//! Forecast coordination crate.
//!
//! Turns provider payloads into reading snapshots, polls on a schedule with
//! backoff, and tells subscribers what changed.

pub mod backoff;
pub mod coordinator;
pub mod normalize;
pub mod persist;
pub mod registry;
pub mod source;

pub use backoff::BackoffPolicy;
pub use coordinator::{CoordinatorSettings, ForecastCoordinator};
pub use normalize::Normalizer;
pub use registry::{
    changed_keys, ForecastSubscriber, SnapshotUpdate, SubscriberRegistry, SubscriptionHandle,
};
pub use source::ForecastSource;
