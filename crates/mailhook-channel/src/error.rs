//! Error types for the coordinator link.

use serde_json::Value;
use thiserror::Error;

use crate::wire::RemoteError;

/// Result alias for link operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Why a call over the link did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No response arrived within the call's ttl.
    #[error("call timed out after {ttl_ms}ms")]
    Timeout {
        /// Effective ttl in milliseconds.
        ttl_ms: u64,
    },

    /// The other side answered with an error.
    #[error("{message}")]
    Remote {
        /// Error message from the remote side.
        message: String,
        /// Machine-readable code, if any.
        code: Option<String>,
        /// HTTP-like status, if any.
        status_code: Option<u16>,
        /// Structured detail, if any.
        info: Option<Value>,
    },

    /// The link went away before a response arrived.
    #[error("link closed")]
    Closed,

    /// A frame could not be serialized.
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Wire-level error code.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } => Some("Timeout"),
            Self::Remote { code, .. } => code.as_deref(),
            Self::Closed => Some("LinkClosed"),
            Self::Encode(_) => None,
        }
    }

    /// HTTP-like status for the error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(504),
            Self::Remote { status_code, .. } => *status_code,
            Self::Closed => Some(503),
            Self::Encode(_) => Some(500),
        }
    }
}

impl From<RemoteError> for ChannelError {
    fn from(error: RemoteError) -> Self {
        Self::Remote {
            message: error.message,
            code: error.code,
            status_code: error.status_code,
            info: error.info,
        }
    }
}

/// Failure while serving a command from the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Push subscription could not be reconfigured.
    #[error("push subscription update failed: {0}")]
    PushSubscription(String),

    /// Call frame could not be decoded.
    #[error("malformed call frame: {0}")]
    MalformedCall(String),

    /// Handler failed with explicit wire details.
    #[error("{message}")]
    Handler {
        /// Error message.
        message: String,
        /// Machine-readable code.
        code: Option<String>,
        /// HTTP-like status.
        status_code: Option<u16>,
    },
}

impl CommandError {
    /// Wire-level error code.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::PushSubscription(_) => Some("PushSubscriptionError"),
            Self::MalformedCall(_) => Some("MalformedCall"),
            Self::Handler { code, .. } => code.as_deref(),
        }
    }

    /// HTTP-like status for the error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::PushSubscription(_) => Some(500),
            Self::MalformedCall(_) => Some(400),
            Self::Handler { status_code, .. } => *status_code,
        }
    }
}

impl From<CommandError> for RemoteError {
    fn from(error: CommandError) -> Self {
        Self {
            message: error.to_string(),
            code: error.code().map(str::to_string),
            status_code: error.status_code(),
            info: None,
        }
    }
}
