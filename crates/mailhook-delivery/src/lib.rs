//! Webhook delivery pipeline for queued notification jobs.
//!
//! For each job the pipeline resolves the destination (custom route, account
//! URL or global default), filters by event, signs the payload with
//! HMAC-SHA256, posts it once and records the outcome as an error flag on
//! the matching scope. Retries belong to the queue: a failed attempt is
//! reported as an error and the queue decides when to try again.
//!
//! ```text
//! JobQueue ──▶ NotifyWorker ──▶ NotificationJobHandler
//!                                 │
//!                                 ├─ RouteResolver     (stores, filters)
//!                                 ├─ PayloadSigner     (body, signature)
//!                                 └─ DeliveryExecutor  (POST, error flags, metrics)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod resolver;
pub mod signing;
pub mod telemetry;
pub mod worker;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use config::Config;
pub use error::{DeliveryError, ErrorCategory, Result};
pub use executor::{DeliveryExecutor, Outcome};
pub use handler::{Collaborators, HandleOutcome, NotificationJobHandler};
pub use resolver::{DropReason, Resolution, RouteResolver};
pub use signing::{PayloadSigner, SignedPayload};
pub use telemetry::init_tracing;
pub use worker::{JobQueue, NotifyWorker, WorkerConfig, WorkerStats};
