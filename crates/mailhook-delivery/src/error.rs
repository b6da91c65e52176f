//! Errors raised while delivering one notification.
//!
//! Every variant that reaches the queue signals "fail, let the queue's own
//! retry policy decide". Drop conditions are not errors and never appear
//! here.

use std::{fmt, time::Duration};

use mailhook_core::CoreError;
use thiserror::Error;

/// Result alias for the delivery pipeline.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised while delivering a notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Endpoint could not be reached.
    #[error("webhook endpoint unreachable: {message}")]
    NetworkError {
        /// Transport error text
        message: String,
    },

    /// Endpoint did not answer within the client timeout.
    #[error("webhook request timed out after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout
        timeout_seconds: u64,
    },

    /// Endpoint answered 4xx.
    #[error("webhook rejected with HTTP {status_code}")]
    ClientError {
        /// 4xx status
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Any other non-2xx response.
    #[error("webhook failed with HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination or client configuration is unusable.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Account, settings or route store failed.
    #[error("{message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// Payload could not be serialized or signed.
    #[error("signing error: {message}")]
    SigningError {
        /// Signing error message
        message: String,
    },

    /// Worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index within the pool
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Transport failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Client timeout elapsed.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates the error matching a non-2xx response status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        match status_code {
            400..=499 => Self::ClientError { status_code, body: body.into() },
            _ => Self::ServerError { status_code, body: body.into() },
        }
    }

    /// Unusable destination or client settings.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a signing error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::SigningError { message: message.into() }
    }

    /// HTTP status of the response, when the endpoint answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }

    /// Whether a later attempt may succeed without operator intervention.
    ///
    /// The queue retries every failure regardless; this only feeds logging.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::StoreError { .. } => true,

            Self::ClientError { status_code, .. } => *status_code == 408 || *status_code == 429,

            Self::ConfigurationError { .. }
            | Self::SigningError { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::StoreError { message: err.to_string() }
    }
}

/// Category of delivery error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unreachable or slow endpoint.
    Network,
    /// 4xx answers.
    Client,
    /// Other non-2xx responses.
    Server,
    /// Collaborator stores.
    Store,
    /// Configuration and signing problems.
    Configuration,
    /// Worker pool lifecycle.
    Worker,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::ConfigurationError { .. } | DeliveryError::SigningError { .. } => {
                Self::Configuration
            },
            DeliveryError::WorkerPanic { .. } | DeliveryError::ShutdownTimeout { .. } => {
                Self::Worker
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
            Self::Worker => write!(f, "worker"),
        }
    }
}
