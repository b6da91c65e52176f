//! Domain models for notification delivery.
//!
//! Jobs are owned by the external queue and handed to the worker once per
//! delivery attempt. Everything else here is either fetched fresh per job
//! (routes, stored headers) or computed (destinations, header sets).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event emitted when an account is removed. Delivered even though the
/// account no longer exists in the store.
pub const ACCOUNT_DELETED: &str = "accountDeleted";

/// Event emitted for newly arrived messages. Subject to inbox-only filtering.
pub const MESSAGE_NEW: &str = "messageNew";

/// Queue-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reference to a custom route attached to a job by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRef {
    /// Route identifier used to fetch fresh route metadata.
    pub id: String,

    /// Pre-rendered payload that replaces the job data when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
}

impl RouteRef {
    /// Creates a route reference without a payload mapping.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), mapping: None }
    }

    /// Attaches a payload mapping.
    pub fn with_mapping(mut self, mapping: Value) -> Self {
        self.mapping = Some(mapping);
        self
    }
}

/// One queued notification awaiting a delivery decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Queue-assigned identifier.
    pub id: JobId,

    /// Event name, e.g. `messageNew`.
    pub name: String,

    /// Event payload as produced upstream.
    #[serde(default)]
    pub data: Map<String, Value>,

    /// When the job was enqueued.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Delivery attempts already made by the queue before this one.
    #[serde(default)]
    pub attempts_made: u32,

    /// Custom route reference, never forwarded as payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteRef>,
}

impl Job {
    /// Creates a job enqueued now.
    ///
    /// Non-object data is replaced with an empty map; producers always emit
    /// objects.
    pub fn new(id: impl Into<JobId>, name: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            id: id.into(),
            name: name.into(),
            data,
            timestamp: Utc::now(),
            attempts_made: 0,
            route: None,
        }
    }

    /// Attaches a custom route reference.
    pub fn with_route(mut self, route: RouteRef) -> Self {
        self.route = Some(route);
        self
    }

    /// Sets the number of attempts already made.
    pub fn with_attempts_made(mut self, attempts_made: u32) -> Self {
        self.attempts_made = attempts_made;
        self
    }

    /// Overrides the enqueue timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Account the notification belongs to.
    pub fn account(&self) -> Option<&str> {
        self.data.get("account").and_then(Value::as_str)
    }

    /// Whether this job reports the removal of its account.
    pub fn is_account_deletion(&self) -> bool {
        self.name == ACCOUNT_DELETED
    }
}

/// A single custom header as stored by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    /// Header name.
    pub key: String,
    /// Header value.
    #[serde(default)]
    pub value: String,
}

impl HeaderEntry {
    /// Creates a header entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Parses a stored JSON list of `{key, value}` objects.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the text is not a list of header objects.
    pub fn parse_list(raw: &str) -> serde_json::Result<Vec<Self>> {
        serde_json::from_str(raw)
    }
}

/// Operator-defined alternate webhook destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRoute {
    /// Route identifier.
    pub id: String,

    /// Disabled routes behave as if absent.
    #[serde(default)]
    pub enabled: bool,

    /// Destination URL.
    #[serde(default)]
    pub target_url: Option<String>,

    /// Headers that replace the global custom headers for routed jobs.
    #[serde(default)]
    pub custom_headers: Vec<HeaderEntry>,
}

impl CustomRoute {
    /// Target URL when the route is usable, `None` when it must be treated as
    /// absent.
    pub fn deliverable_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.target_url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }
}

/// Ordered, case-insensitive header mapping.
///
/// Layers are applied left to right; a later value for an existing name
/// replaces the earlier value in place, so the final order reflects the
/// first layer that introduced each name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    /// Creates an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a header.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(existing, _)| existing.eq_ignore_ascii_case(&key)) {
            Some(entry) => *entry = (key, value),
            None => self.entries.push((key, value)),
        }
    }

    /// Applies one layer on top of the current headers.
    pub fn apply_layer<I, K, V>(&mut self, layer: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in layer {
            self.insert(key, value);
        }
    }

    /// Applies stored header entries, skipping entries with blank names.
    pub fn apply_entries(&mut self, entries: &[HeaderEntry]) {
        self.apply_layer(
            entries
                .iter()
                .filter(|entry| !entry.key.trim().is_empty())
                .map(|entry| (entry.key.trim(), entry.value.as_str())),
        );
    }

    /// Looks up a header value by case-insensitive name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Whether a header with this name is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates headers in layering order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Header names in layering order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(key, _)| key.as_str()).collect()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        headers.apply_layer(iter);
        headers
    }
}

/// Granularity at which the most recent delivery failure is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorScope {
    /// Failures of a custom route.
    Route(String),
    /// Failures of an account-level webhook URL.
    Account(String),
    /// Failures of the global default webhook URL.
    Global,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(id) => write!(f, "route:{id}"),
            Self::Account(id) => write!(f, "account:{id}"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Most recent delivery failure at a scope.
///
/// Cleared by writing an empty JSON object, which is what status surfaces
/// read as "healthy".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlag {
    /// Event name of the failed job.
    pub event: String,
    /// Failure description.
    pub message: String,
    /// When the failure happened.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    /// Destination URL without credentials.
    pub url: String,
}

impl ErrorFlag {
    /// Serialized form of a cleared flag.
    pub const CLEARED: &'static str = "{}";

    /// Creates a flag for a failure.
    pub fn new(
        event: impl Into<String>,
        message: impl Into<String>,
        time: DateTime<Utc>,
        url: impl Into<String>,
    ) -> Self {
        Self { event: event.into(), message: message.into(), time, url: url.into() }
    }

    /// JSON value stored for this flag.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// JSON value stored for a cleared flag.
    pub fn cleared_value() -> Value {
        Value::Object(Map::new())
    }

    /// Reads a stored flag, returning `None` for a cleared or unreadable one.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Where and how a job is delivered, as decided by route resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveDestination {
    /// Destination URL, possibly still carrying user-info credentials.
    pub url: String,

    /// Custom headers: global or route layer, then the account layer.
    pub headers: HeaderSet,

    /// Scope for error-flag bookkeeping.
    pub scope: ErrorScope,
}

impl EffectiveDestination {
    /// Whether a custom route decided this destination.
    pub fn is_routed(&self) -> bool {
        matches!(self.scope, ErrorScope::Route(_))
    }
}
