//! Metric observations emitted by the delivery pipeline.
//!
//! The pipeline reports what happened through an injected `Observer` and
//! never talks to a telemetry backend directly. In production the observer
//! forwards observations to the coordinator over the duplex link; tests use
//! `RecordingObserver` or `NoOpObserver`.
//!
//! ```text
//! ┌──────────────────────┐   Metric    ┌────────────────────┐
//! │ NotificationJob-     │ ──────────▶ │ MulticastObserver  │
//! │ Handler / Executor   │             └────────────────────┘
//! └──────────────────────┘                  │          │
//!                                           ▼          ▼
//!                                 link metrics    recording (tests)
//! ```

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use serde_json::{json, Value};

/// Outcome label attached to per-event delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Endpoint accepted the notification.
    Success,
    /// Transport failure or non-2xx response.
    Fail,
}

impl DeliveryStatus {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

/// Queue lifecycle label attached to processed-job counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Handler returned normally.
    Completed,
    /// Handler failed; the queue decides about retries.
    Failed,
}

impl JobStatus {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// Counter of delivery outcomes per event name.
    Webhooks {
        /// Event name of the delivered job.
        event: String,
        /// Delivery outcome.
        status: DeliveryStatus,
    },

    /// Duration of a webhook request that was actually attempted.
    WebhookRequest {
        /// Time spent in the HTTP request.
        duration: Duration,
    },

    /// Counter of jobs finished by the queue.
    QueueProcessed {
        /// Queue name.
        queue: String,
        /// Lifecycle outcome.
        status: JobStatus,
    },
}

impl Metric {
    /// Metric name as understood by the coordinator.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Webhooks { .. } => "webhooks",
            Self::WebhookRequest { .. } => "webhookReq",
            Self::QueueProcessed { .. } => "queuesProcessed",
        }
    }

    /// Aggregation method: `inc` for counters, `observe` for histograms.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Webhooks { .. } | Self::QueueProcessed { .. } => "inc",
            Self::WebhookRequest { .. } => "observe",
        }
    }

    /// Positional arguments for the aggregation method.
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::Webhooks { event, status } => {
                vec![json!({ "event": event, "status": status.as_str() })]
            },
            Self::WebhookRequest { duration } => vec![json!(duration.as_secs_f64())],
            Self::QueueProcessed { queue, status } => {
                vec![json!({ "queue": queue, "status": status.as_str() })]
            },
        }
    }
}

/// Receives metric observations.
///
/// Observation is fire-and-forget: implementations must not block and must
/// swallow their own failures so that reporting never alters delivery.
pub trait Observer: Send + Sync + std::fmt::Debug {
    /// Records one observation.
    fn observe(&self, metric: &Metric);
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn observe(&self, _metric: &Metric) {}
}

/// Observer that forwards to several observers in registration order.
#[derive(Debug, Clone, Default)]
pub struct MulticastObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MulticastObserver {
    /// Creates a multicast observer with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Number of subscribers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Observer for MulticastObserver {
    fn observe(&self, metric: &Metric) {
        for observer in &self.observers {
            observer.observe(metric);
        }
    }
}

/// Observer that keeps every observation for later assertions.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    recorded: Arc<Mutex<Vec<Metric>>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations so far, oldest first.
    pub fn recorded(&self) -> Vec<Metric> {
        self.recorded.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Observations with the given metric key.
    pub fn recorded_with_key(&self, key: &str) -> Vec<Metric> {
        self.recorded().into_iter().filter(|metric| metric.key() == key).collect()
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, metric: &Metric) {
        if let Ok(mut guard) = self.recorded.lock() {
            guard.push(metric.clone());
        }
    }
}
