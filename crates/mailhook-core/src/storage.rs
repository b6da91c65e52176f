//! Collaborator interfaces for the stores the worker reads and writes.
//!
//! The account store is a Redis-like hash store, settings are JSON values by
//! key, and route metadata comes from its own collaborator. Production
//! adapters live with the hosting process; `mock` provides deterministic
//! in-memory doubles with error injection and read tracking.

use async_trait::async_trait;
use serde_json::Value;

use crate::{error::Result, models::CustomRoute};

/// Account hash field holding the account-level webhook URL.
pub const FIELD_WEBHOOKS: &str = "webhooks";

/// Account hash field holding account-level custom headers as JSON.
pub const FIELD_WEBHOOKS_CUSTOM_HEADERS: &str = "webhooksCustomHeaders";

/// Account hash field holding the account-scope error flag.
pub const FIELD_WEBHOOK_ERROR_FLAG: &str = "webhookErrorFlag";

/// Global setting keys consulted by the delivery pipeline.
pub mod settings {
    /// Master switch for webhook delivery.
    pub const WEBHOOKS_ENABLED: &str = "webhooksEnabled";
    /// Global default webhook URL.
    pub const WEBHOOKS: &str = "webhooks";
    /// Event allow-list; `*` allows everything.
    pub const WEBHOOK_EVENTS: &str = "webhookEvents";
    /// Global custom headers, replaced by route headers for routed jobs.
    pub const WEBHOOKS_CUSTOM_HEADERS: &str = "webhooksCustomHeaders";
    /// Only notify about new messages in the primary mailbox.
    pub const INBOX_NEW_ONLY: &str = "inboxNewOnly";
    /// Global-scope error flag.
    pub const WEBHOOK_ERROR_FLAG: &str = "webhookErrorFlag";
}

/// Hash key under which an account's data lives.
pub fn account_key(account: &str) -> String {
    format!("iad:{account}")
}

/// Field under the route content hash that holds a route's error flag.
pub fn route_error_flag_field(route_id: &str) -> String {
    format!("{route_id}:{FIELD_WEBHOOK_ERROR_FLAG}")
}

/// Redis-like key/hash store holding account data and route error flags.
#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    /// Whether the key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reads a hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Writes a hash field, creating the hash if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
}

/// Global settings store holding JSON values.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Reads a setting.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes a setting.
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Custom route metadata collaborator.
#[async_trait]
pub trait RouteStore: Send + Sync + 'static {
    /// Fetches route metadata, `None` when the route does not exist.
    async fn get_meta(&self, route_id: &str) -> Result<Option<CustomRoute>>;

    /// Hash key under which per-route error flags live.
    fn webhooks_content_key(&self) -> String;
}

/// Source of the process-wide signing secret.
///
/// The secret must be stable across restarts, otherwise receivers cannot
/// verify payloads signed before the restart.
#[async_trait]
pub trait SecretProvider: Send + Sync + 'static {
    /// Returns the service secret.
    async fn service_secret(&self) -> Result<Vec<u8>>;
}

/// Secret provider backed by a fixed value, typically loaded from
/// configuration.
#[derive(Clone)]
pub struct StaticSecret(Vec<u8>);

impl StaticSecret {
    /// Wraps a secret value.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(***)")
    }
}

#[async_trait]
impl SecretProvider for StaticSecret {
    async fn service_secret(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

pub mod mock {
    //! In-memory collaborator doubles for testing.
    //!
    //! Every double supports injecting a failure for its next operation and
    //! exposes its contents for verification.

    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::RwLock;

    use super::{
        account_key, AccountStore, RouteStore, SettingsStore, FIELD_WEBHOOKS,
        FIELD_WEBHOOKS_CUSTOM_HEADERS,
    };
    use crate::{
        error::{CoreError, Result},
        models::{CustomRoute, HeaderEntry},
    };

    fn take_error(slot: &Mutex<Option<String>>) -> Result<()> {
        let injected = slot.lock().ok().and_then(|mut guard| guard.take());
        match injected {
            Some(message) => Err(CoreError::Store(message)),
            None => Ok(()),
        }
    }

    /// In-memory hash store.
    #[derive(Debug, Default, Clone)]
    pub struct MockAccountStore {
        hashes: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
        next_error: Arc<Mutex<Option<String>>>,
    }

    impl MockAccountStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an account with no fields.
        pub async fn add_account(&self, account: &str) {
            self.hashes.write().await.entry(account_key(account)).or_default();
        }

        /// Registers an account with its own webhook URL.
        pub async fn add_account_with_webhook(&self, account: &str, url: &str) {
            self.set_field(&account_key(account), FIELD_WEBHOOKS, url).await;
        }

        /// Stores account-level custom headers.
        pub async fn set_account_headers(&self, account: &str, headers: &[HeaderEntry]) {
            let raw = serde_json::to_string(headers).unwrap_or_else(|_| "[]".to_string());
            self.set_field(&account_key(account), FIELD_WEBHOOKS_CUSTOM_HEADERS, &raw).await;
        }

        /// Writes a raw hash field.
        pub async fn set_field(&self, key: &str, field: &str, value: &str) {
            self.hashes
                .write()
                .await
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        }

        /// Reads a raw hash field.
        pub async fn field(&self, key: &str, field: &str) -> Option<String> {
            self.hashes.read().await.get(key).and_then(|hash| hash.get(field).cloned())
        }

        /// Makes the next operation fail with a store error.
        pub fn inject_error(&self, message: impl Into<String>) {
            if let Ok(mut guard) = self.next_error.lock() {
                *guard = Some(message.into());
            }
        }
    }

    #[async_trait]
    impl AccountStore for MockAccountStore {
        async fn exists(&self, key: &str) -> Result<bool> {
            take_error(&self.next_error)?;
            Ok(self.hashes.read().await.contains_key(key))
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            take_error(&self.next_error)?;
            Ok(self.field(key, field).await)
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
            take_error(&self.next_error)?;
            self.set_field(key, field, value).await;
            Ok(())
        }
    }

    /// In-memory settings store that records which keys were read.
    #[derive(Debug, Default, Clone)]
    pub struct MockSettingsStore {
        values: Arc<RwLock<HashMap<String, Value>>>,
        reads: Arc<Mutex<Vec<String>>>,
        next_error: Arc<Mutex<Option<String>>>,
    }

    impl MockSettingsStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Stores a setting.
        pub async fn put(&self, key: &str, value: Value) {
            self.values.write().await.insert(key.to_string(), value);
        }

        /// Reads a setting without recording the read.
        pub async fn value(&self, key: &str) -> Option<Value> {
            self.values.read().await.get(key).cloned()
        }

        /// Keys read through the `SettingsStore` interface, in order.
        pub fn reads(&self) -> Vec<String> {
            self.reads.lock().map(|guard| guard.clone()).unwrap_or_default()
        }

        /// Whether a key was read through the `SettingsStore` interface.
        pub fn was_read(&self, key: &str) -> bool {
            self.reads().iter().any(|read| read == key)
        }

        /// Makes the next operation fail with a store error.
        pub fn inject_error(&self, message: impl Into<String>) {
            if let Ok(mut guard) = self.next_error.lock() {
                *guard = Some(message.into());
            }
        }
    }

    #[async_trait]
    impl SettingsStore for MockSettingsStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            take_error(&self.next_error)?;
            if let Ok(mut reads) = self.reads.lock() {
                reads.push(key.to_string());
            }
            Ok(self.value(key).await)
        }

        async fn set(&self, key: &str, value: Value) -> Result<()> {
            take_error(&self.next_error)?;
            self.put(key, value).await;
            Ok(())
        }
    }

    /// In-memory route metadata.
    #[derive(Debug, Clone)]
    pub struct MockRouteStore {
        routes: Arc<RwLock<HashMap<String, CustomRoute>>>,
        content_key: String,
    }

    impl MockRouteStore {
        /// Default hash key for route error flags.
        pub const CONTENT_KEY: &'static str = "wh:content";

        /// Creates an empty route store.
        pub fn new() -> Self {
            Self {
                routes: Arc::new(RwLock::new(HashMap::new())),
                content_key: Self::CONTENT_KEY.to_string(),
            }
        }

        /// Adds or replaces a route.
        pub async fn add_route(&self, route: CustomRoute) {
            self.routes.write().await.insert(route.id.clone(), route);
        }
    }

    impl Default for MockRouteStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RouteStore for MockRouteStore {
        async fn get_meta(&self, route_id: &str) -> Result<Option<CustomRoute>> {
            Ok(self.routes.read().await.get(route_id).cloned())
        }

        fn webhooks_content_key(&self) -> String {
            self.content_key.clone()
        }
    }
}
