//! Per-job entry point registered with the notification queue.
//!
//! `handle` returns `Ok` for delivered and dropped jobs alike and `Err` only
//! when a delivery attempt failed, which the queue turns into a retry.

use std::{fmt, sync::Arc};

use mailhook_core::{
    AccountStore, Clock, Job, JobStatus, Metric, Observer, RouteStore, SecretProvider,
    SettingsStore,
};
use serde_json::{Map, Value};

use crate::{
    client::DeliveryClient,
    error::{ErrorCategory, Result},
    executor::{DeliveryExecutor, Outcome},
    resolver::{DropReason, Resolution, RouteResolver},
    signing::{split_credentials, PayloadSigner},
};

/// Queue the handler consumes, used as the metrics label.
pub const NOTIFY_QUEUE: &str = "notify";

/// Payload fields that identify a message without exposing its content.
const LOGGABLE_FIELDS: [&str; 4] = ["id", "uid", "path", "messageId"];

/// External collaborators shared by the pipeline stages.
#[derive(Clone)]
pub struct Collaborators {
    /// Account hashes and route error flags.
    pub accounts: Arc<dyn AccountStore>,
    /// Global settings.
    pub settings: Arc<dyn SettingsStore>,
    /// Custom route metadata.
    pub routes: Arc<dyn RouteStore>,
    /// Signing secret.
    pub secrets: Arc<dyn SecretProvider>,
    /// Metrics sink.
    pub observer: Arc<dyn Observer>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("observer", &self.observer)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// What happened to a job that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The endpoint accepted the notification.
    Delivered(Outcome),
    /// The job was skipped.
    Dropped(DropReason),
}

/// Orchestrates resolution, signing and delivery for one job.
#[derive(Debug, Clone)]
pub struct NotificationJobHandler {
    resolver: RouteResolver,
    signer: PayloadSigner,
    executor: DeliveryExecutor,
    observer: Arc<dyn Observer>,
}

impl NotificationJobHandler {
    /// Wires the pipeline stages over shared collaborators.
    pub fn new(client: DeliveryClient, collaborators: Collaborators) -> Self {
        let Collaborators { accounts, settings, routes, secrets, observer, clock } = collaborators;

        Self {
            resolver: RouteResolver::new(accounts.clone(), settings.clone(), routes.clone()),
            signer: PayloadSigner::new(secrets),
            executor: DeliveryExecutor::new(
                client,
                accounts,
                settings,
                routes,
                observer.clone(),
                clock,
            ),
            observer,
        }
    }

    /// The executor, for reading error flags.
    pub fn executor(&self) -> &DeliveryExecutor {
        &self.executor
    }

    /// Processes one job.
    ///
    /// # Errors
    ///
    /// Returns the delivery error when the POST failed or returned non-2xx,
    /// and store or signing errors that prevented an attempt.
    pub async fn handle(&self, job: &Job) -> Result<HandleOutcome> {
        let account = job.account().unwrap_or_default();

        let destination = match self.resolver.resolve(job).await? {
            Resolution::Deliver(destination) => destination,
            Resolution::Dropped(reason) => {
                tracing::debug!(
                    job_id = %job.id,
                    event = %job.name,
                    account,
                    %reason,
                    "skipping notification"
                );
                return Ok(HandleOutcome::Dropped(reason));
            },
        };

        let data = redacted_view(&job.data);
        tracing::debug!(
            job_id = %job.id,
            event = %job.name,
            account,
            scope = %destination.scope,
            routed = destination.is_routed(),
            %data,
            "processing notification"
        );

        let signed = self.signer.sign(job).await?;

        match self.executor.deliver(job, &destination, signed).await {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %job.id,
                    event = %job.name,
                    account,
                    url = %outcome.url,
                    status = outcome.status_code,
                    duration_ms = outcome.duration.as_millis(),
                    %data,
                    "posted webhook"
                );
                Ok(HandleOutcome::Delivered(outcome))
            },
            Err(error) => {
                let url = split_credentials(&destination.url)
                    .map(|target| target.url)
                    .unwrap_or_default();
                tracing::error!(
                    job_id = %job.id,
                    event = %job.name,
                    account,
                    url = %url,
                    scope = %destination.scope,
                    status = ?error.status_code(),
                    category = %ErrorCategory::from(&error),
                    retryable = error.is_retryable(),
                    error = %error,
                    %data,
                    "failed posting webhook"
                );
                Err(error)
            },
        }
    }

    /// Queue hook for a job that finished without error.
    pub fn on_completed(&self, job: &Job) {
        self.observer.observe(&Metric::QueueProcessed {
            queue: NOTIFY_QUEUE.to_string(),
            status: JobStatus::Completed,
        });
        tracing::info!(queue = NOTIFY_QUEUE, job_id = %job.id, event = %job.name, "job completed");
    }

    /// Queue hook for a job whose attempt failed.
    pub fn on_failed(&self, job: &Job, reason: &str) {
        self.observer.observe(&Metric::QueueProcessed {
            queue: NOTIFY_QUEUE.to_string(),
            status: JobStatus::Failed,
        });
        tracing::info!(
            queue = NOTIFY_QUEUE,
            job_id = %job.id,
            event = %job.name,
            attempts_made = job.attempts_made,
            reason,
            "job failed"
        );
    }
}

/// Job data safe to log: the nested message payload is reduced to its
/// identifying fields.
pub fn redacted_view(data: &Map<String, Value>) -> Value {
    let mut view = data.clone();
    view.remove("eventId");
    if let Some(payload) = view.get("data").and_then(Value::as_object).map(redact_fields) {
        view.insert("data".to_string(), payload);
    }
    Value::Object(view)
}

/// Keeps only identifying fields, marking the result `partial` when anything
/// was removed; `true` when nothing identifying remains.
pub fn redact_fields(fields: &Map<String, Value>) -> Value {
    let mut kept: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| LOGGABLE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if kept.is_empty() {
        return Value::Bool(true);
    }
    if kept.len() < fields.len() {
        kept.insert("partial".to_string(), Value::Bool(true));
    }
    Value::Object(kept)
}
