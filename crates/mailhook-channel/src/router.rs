//! Serving inbound commands from the coordinator.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::CommandError;

/// Response for commands this worker does not handle.
///
/// Returned as a normal response so an unknown command never tears down the
/// link.
pub const UNHANDLED: u64 = 999;

/// Inbound command kinds, keyed by the message's `cmd` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `resource-usage`: report a snapshot of this worker's resources.
    ResourceUsage,
    /// `googlePubSub`: reconfigure the push subscription.
    PushSubscriptionUpdate {
        /// Application config from the message's `app` field.
        app: Value,
    },
    /// Anything else.
    Unknown(String),
}

impl Command {
    /// Classifies an inbound call message.
    pub fn parse(message: &Value) -> Self {
        match message.get("cmd").and_then(Value::as_str) {
            Some("resource-usage") => Self::ResourceUsage,
            Some("googlePubSub") => Self::PushSubscriptionUpdate {
                app: message.get("app").cloned().unwrap_or(Value::Null),
            },
            Some(other) => Self::Unknown(other.to_string()),
            None => Self::Unknown(String::new()),
        }
    }
}

/// External push-notification subscription managed by this worker.
#[async_trait]
pub trait PushSubscription: Send + Sync + 'static {
    /// Starts the subscription at link startup.
    async fn start(&self) -> Result<(), CommandError>;

    /// Applies a new application config.
    async fn update(&self, app: Value) -> Result<(), CommandError>;
}

/// Push subscription for deployments without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPushSubscription;

#[async_trait]
impl PushSubscription for NoPushSubscription {
    async fn start(&self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn update(&self, _app: Value) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Dispatches inbound commands to local handlers.
pub struct CommandRouter {
    push: Arc<dyn PushSubscription>,
    started: Instant,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter").field("started", &self.started).finish_non_exhaustive()
    }
}

impl CommandRouter {
    /// Creates a router around the push subscription collaborator.
    pub fn new(push: Arc<dyn PushSubscription>) -> Self {
        Self { push, started: Instant::now() }
    }

    /// Starts the push subscription.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's error; callers log it and carry on.
    pub async fn start(&self) -> Result<(), CommandError> {
        self.push.start().await
    }

    /// Handles one inbound call message.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, to be rendered onto the `resp` frame.
    pub async fn on_command(&self, message: &Value) -> Result<Value, CommandError> {
        match Command::parse(message) {
            Command::ResourceUsage => Ok(self.resource_usage()),
            Command::PushSubscriptionUpdate { app } => {
                self.push.update(app).await?;
                info!("push subscription updated");
                Ok(Value::Bool(true))
            },
            Command::Unknown(cmd) => {
                debug!(cmd = %cmd, "unhandled command");
                Ok(json!(UNHANDLED))
            },
        }
    }

    fn resource_usage(&self) -> Value {
        let workers = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_workers())
            .ok();

        json!({
            "pid": std::process::id(),
            "uptimeMs": u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "runtimeWorkers": workers,
            "time": Utc::now().timestamp_millis(),
        })
    }
}
