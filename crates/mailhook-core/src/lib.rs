//! Core domain models and collaborator interfaces.
//!
//! Provides the strongly-typed primitives shared by the webhook delivery
//! pipeline and the coordinator link: queued notification jobs, custom
//! routes, header layering, error flags, the metrics observer interface and
//! the storage traits the worker consumes. The storage engines themselves
//! live outside this workspace; `storage::mock` carries in-memory doubles.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryStatus, JobStatus, Metric, MulticastObserver, NoOpObserver, Observer, RecordingObserver,
};
pub use models::{
    CustomRoute, EffectiveDestination, ErrorFlag, ErrorScope, HeaderEntry, HeaderSet, Job, JobId,
    RouteRef,
};
pub use storage::{AccountStore, RouteStore, SecretProvider, SettingsStore, StaticSecret};
pub use time::{Clock, RealClock, TestClock};
