//! Correlated command/response protocol over the coordinator link.
//!
//! The worker and its coordinator share one duplex link carrying JSON
//! frames. Either side may issue `call` frames and must answer each with
//! exactly one `resp`. On top of that the worker announces `ready` once,
//! sends a `heartbeat` periodically and streams `metrics` frames.
//!
//! ```text
//!              ┌─────────────── LinkRuntime ───────────────┐
//! inbound ───▶ │ dispatch ─┬─ resp ─▶ CallChannel (pending)│
//!              │           └─ call ─▶ CommandRouter (task) │
//! outbound ◀── │ ready · heartbeat · resp · call · metrics │
//!              └───────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod call;
pub mod error;
pub mod link;
pub mod router;
pub mod wire;

pub use call::CallChannel;
pub use error::{ChannelError, CommandError, Result};
pub use link::{duplex, LinkConfig, LinkEnd, LinkMetricsObserver, LinkRuntime};
pub use router::{Command, CommandRouter, NoPushSubscription, PushSubscription, UNHANDLED};
pub use wire::{Frame, FrameSink, RemoteError, Reply};
