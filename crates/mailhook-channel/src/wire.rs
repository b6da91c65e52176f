//! Frames exchanged with the coordinator over the duplex link.
//!
//! ```text
//! {"cmd":"call","mid":"1700000000000:1","message":{...},"timeout":10000}
//! {"cmd":"resp","mid":"1700000000000:1","response":...}
//! {"cmd":"resp","mid":"1700000000000:1","error":"...","code":"...","statusCode":504,"info":...}
//! {"cmd":"heartbeat"}
//! {"cmd":"ready"}
//! {"cmd":"metrics","key":"webhooks","method":"inc","args":[...]}
//! ```
//!
//! The coordinator parses these byte for byte, so field names and optional
//! fields must not drift.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Failure reported in a `resp` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: Option<String>,
    /// HTTP-like status.
    pub status_code: Option<u16>,
    /// Extra structured detail.
    pub info: Option<Value>,
}

/// Body of a `resp` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Call succeeded.
    Success(Value),
    /// Call failed.
    Failure(RemoteError),
}

/// One message on the duplex link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFrame", into = "RawFrame")]
pub enum Frame {
    /// Request expecting exactly one `resp` with the same `mid`.
    Call {
        /// Correlation id.
        mid: String,
        /// Command payload, dispatched on its own `cmd` field.
        message: Value,
        /// Caller's timeout in milliseconds.
        timeout: Option<u64>,
    },
    /// Answer to a call.
    Resp {
        /// Correlation id of the call.
        mid: String,
        /// Outcome.
        reply: Reply,
    },
    /// Liveness signal, never answered.
    Heartbeat,
    /// Sent once when the worker is up.
    Ready,
    /// Metric observation, never answered.
    Metrics {
        /// Metric name.
        key: String,
        /// Aggregation method.
        method: String,
        /// Method arguments.
        args: Vec<Value>,
    },
}

impl Frame {
    /// Decodes a frame from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns the decoding error for unknown commands or missing fields.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Encodes the frame as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Encode` when the frame cannot be serialized.
    pub fn to_value(&self) -> Result<Value, ChannelError> {
        serde_json::to_value(self).map_err(|e| ChannelError::Encode(e.to_string()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Value>,
    #[serde(default, deserialize_with = "lenient_millis", skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
}

/// Reads a millisecond count sent as any JSON number.
///
/// Fractional values are rounded; negative or non-numeric values read as
/// absent.
pub(crate) fn millis(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64)
    })
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(millis))
}

/// Correlation id of a `call` frame that failed to decode.
///
/// Lets the receiver answer a broken call instead of leaving the caller
/// waiting for its ttl.
pub fn undecodable_call_mid(value: &Value) -> Option<&str> {
    match value.get("cmd").and_then(Value::as_str) {
        Some("call") => value.get("mid").and_then(Value::as_str),
        _ => None,
    }
}

fn required<T>(field: Option<T>, cmd: &str, name: &str) -> Result<T, String> {
    field.ok_or_else(|| format!("{cmd} frame without {name}"))
}

impl TryFrom<RawFrame> for Frame {
    type Error = String;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        match raw.cmd.as_str() {
            "call" => Ok(Self::Call {
                mid: required(raw.mid, "call", "mid")?,
                message: raw.message.unwrap_or(Value::Null),
                timeout: raw.timeout,
            }),
            "resp" => {
                let mid = required(raw.mid, "resp", "mid")?;
                let reply = match raw.error {
                    Some(error) => Reply::Failure(RemoteError {
                        message: match error {
                            Value::String(message) => message,
                            other => other.to_string(),
                        },
                        code: raw.code,
                        status_code: raw.status_code,
                        info: raw.info,
                    }),
                    None => Reply::Success(raw.response.unwrap_or(Value::Null)),
                };
                Ok(Self::Resp { mid, reply })
            },
            "heartbeat" => Ok(Self::Heartbeat),
            "ready" => Ok(Self::Ready),
            "metrics" => Ok(Self::Metrics {
                key: required(raw.key, "metrics", "key")?,
                method: required(raw.method, "metrics", "method")?,
                args: raw.args.unwrap_or_default(),
            }),
            other => Err(format!("unknown frame command {other:?}")),
        }
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Call { mid, message, timeout } => Self {
                cmd: "call".into(),
                mid: Some(mid),
                message: Some(message),
                timeout,
                ..Self::default()
            },
            Frame::Resp { mid, reply: Reply::Success(response) } => Self {
                cmd: "resp".into(),
                mid: Some(mid),
                response: Some(response),
                ..Self::default()
            },
            Frame::Resp { mid, reply: Reply::Failure(error) } => Self {
                cmd: "resp".into(),
                mid: Some(mid),
                error: Some(Value::String(error.message)),
                code: error.code,
                status_code: error.status_code,
                info: error.info,
                ..Self::default()
            },
            Frame::Heartbeat => Self { cmd: "heartbeat".into(), ..Self::default() },
            Frame::Ready => Self { cmd: "ready".into(), ..Self::default() },
            Frame::Metrics { key, method, args } => Self {
                cmd: "metrics".into(),
                key: Some(key),
                method: Some(method),
                args: Some(args),
                ..Self::default()
            },
        }
    }
}

/// Outbound half of the link.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl FrameSink {
    /// Wraps the sending half of the transport.
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    /// Encodes and sends a frame.
    ///
    /// # Errors
    ///
    /// Returns `Encode` when the frame does not serialize and `Closed` when
    /// the other side is gone.
    pub fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        let value = frame.to_value()?;
        self.tx.send(value).map_err(|_| ChannelError::Closed)
    }
}
