//! Destination resolution and event filtering.
//!
//! Decides for each job whether it is delivered at all and, if so, where
//! and with which custom headers. URL precedence is route target, then the
//! account's own URL, then the global default. Route headers replace the
//! global custom headers; account headers are always layered last.

use std::{fmt, sync::Arc};

use mailhook_core::{
    models::MESSAGE_NEW,
    storage::{account_key, settings, FIELD_WEBHOOKS, FIELD_WEBHOOKS_CUSTOM_HEADERS},
    AccountStore, EffectiveDestination, ErrorScope, HeaderEntry, HeaderSet, Job, RouteStore,
    SettingsStore,
};
use serde_json::{Map, Value};

use crate::error::Result;

const PRIMARY_MAILBOX_PATH: &str = "INBOX";
const INBOX_FLAG: &str = "\\Inbox";

/// Why a job was skipped without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The job's account is gone and the event is not the deletion event.
    AccountNotFound,
    /// Webhooks are switched off globally.
    WebhooksDisabled,
    /// The attached route is missing, disabled or has no target URL.
    RouteUnavailable,
    /// Neither the account nor the global settings define a URL.
    NoWebhookUrl,
    /// The event is not on the allow-list.
    EventNotAllowed,
    /// New message outside the primary mailbox with inbox-only enabled.
    NotInbox,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::AccountNotFound => "account not found",
            Self::WebhooksDisabled => "webhooks disabled",
            Self::RouteUnavailable => "route unavailable",
            Self::NoWebhookUrl => "no webhook url",
            Self::EventNotAllowed => "event not allowed",
            Self::NotInbox => "not an inbox message",
        };
        f.write_str(reason)
    }
}

/// Result of resolving a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Deliver to this destination.
    Deliver(EffectiveDestination),
    /// Skip the job.
    Dropped(DropReason),
}

/// Resolves destinations from fresh store reads; nothing is cached.
#[derive(Clone)]
pub struct RouteResolver {
    accounts: Arc<dyn AccountStore>,
    settings: Arc<dyn SettingsStore>,
    routes: Arc<dyn RouteStore>,
}

impl fmt::Debug for RouteResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteResolver").finish_non_exhaustive()
    }
}

impl RouteResolver {
    /// Creates a resolver over the given stores.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        settings: Arc<dyn SettingsStore>,
        routes: Arc<dyn RouteStore>,
    ) -> Self {
        Self { accounts, settings, routes }
    }

    /// Decides whether and where a job is delivered.
    ///
    /// # Errors
    ///
    /// Store failures propagate as `StoreError` so the queue retries the job
    /// later; they are never turned into drops.
    pub async fn resolve(&self, job: &Job) -> Result<Resolution> {
        let account = job.account();

        if !job.is_account_deletion() {
            let exists = match account {
                Some(account) => self.accounts.exists(&account_key(account)).await?,
                None => false,
            };
            if !exists {
                return Ok(Resolution::Dropped(DropReason::AccountNotFound));
            }
        }

        let enabled = self.settings.get(settings::WEBHOOKS_ENABLED).await?;
        if !enabled.as_ref().is_some_and(is_truthy) {
            return Ok(Resolution::Dropped(DropReason::WebhooksDisabled));
        }

        let mut headers = HeaderSet::new();

        let (url, scope) = if let Some(route_ref) = &job.route {
            let route = self.routes.get_meta(&route_ref.id).await?;
            let Some((route, url)) = route.as_ref().and_then(|route| {
                route.deliverable_url().map(|url| (route, url.to_string()))
            }) else {
                return Ok(Resolution::Dropped(DropReason::RouteUnavailable));
            };

            headers.apply_entries(&route.custom_headers);
            (url, ErrorScope::Route(route.id.clone()))
        } else {
            let account_url = match account {
                Some(account) => {
                    self.accounts.hget(&account_key(account), FIELD_WEBHOOKS).await?
                },
                None => None,
            };
            let account_url =
                account_url.map(|url| url.trim().to_string()).filter(|url| !url.is_empty());

            let global_headers = self.settings.get(settings::WEBHOOKS_CUSTOM_HEADERS).await?;
            headers.apply_entries(&header_entries_from_setting(global_headers));

            match (account_url, account) {
                (Some(url), Some(account)) => (url, ErrorScope::Account(account.to_string())),
                _ => {
                    let global_url = self.settings.get(settings::WEBHOOKS).await?;
                    let Some(url) = global_url
                        .as_ref()
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                    else {
                        return Ok(Resolution::Dropped(DropReason::NoWebhookUrl));
                    };
                    (url.to_string(), ErrorScope::Global)
                },
            }
        };

        if let Some(account) = account {
            let raw =
                self.accounts.hget(&account_key(account), FIELD_WEBHOOKS_CUSTOM_HEADERS).await?;
            headers.apply_entries(&header_entries_from_field(raw.as_deref()));
        }

        if job.route.is_none() {
            if let Some(reason) = self.event_filter(job).await? {
                return Ok(Resolution::Dropped(reason));
            }
        }

        Ok(Resolution::Deliver(EffectiveDestination { url, headers, scope }))
    }

    async fn event_filter(&self, job: &Job) -> Result<Option<DropReason>> {
        let allowed = self.settings.get(settings::WEBHOOK_EVENTS).await?;
        if !event_allowed(allowed.as_ref(), &job.name) {
            return Ok(Some(DropReason::EventNotAllowed));
        }

        if job.name == MESSAGE_NEW && !is_primary_mailbox(&job.data) {
            let inbox_only = self.settings.get(settings::INBOX_NEW_ONLY).await?;
            if inbox_only.as_ref().is_some_and(is_truthy) {
                return Ok(Some(DropReason::NotInbox));
            }
        }

        Ok(None)
    }
}

/// Loose truthiness for settings written by different producers.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !matches!(text.trim(), "" | "0" | "false"),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn event_allowed(allowed: Option<&Value>, event: &str) -> bool {
    let Some(Value::Array(events)) = allowed else {
        return false;
    };
    events.iter().filter_map(Value::as_str).any(|allowed| allowed == "*" || allowed == event)
}

/// Whether a message event refers to the primary mailbox, checked on the
/// event itself and on its nested `data` object.
fn is_primary_mailbox(data: &Map<String, Value>) -> bool {
    let nested = data.get("data").and_then(Value::as_object);

    std::iter::once(data).chain(nested).any(|layer| {
        let path_is_inbox = layer.get("path").and_then(Value::as_str) == Some(PRIMARY_MAILBOX_PATH);
        let special_use = layer.get("specialUse").and_then(Value::as_str) == Some(INBOX_FLAG);
        let labelled = layer
            .get("labels")
            .and_then(Value::as_array)
            .is_some_and(|labels| labels.iter().any(|label| label.as_str() == Some(INBOX_FLAG)));

        path_is_inbox || special_use || labelled
    })
}

fn header_entries_from_field(raw: Option<&str>) -> Vec<HeaderEntry> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Vec::new();
    };
    HeaderEntry::parse_list(raw).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "ignoring malformed account custom headers");
        Vec::new()
    })
}

fn header_entries_from_setting(value: Option<Value>) -> Vec<HeaderEntry> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(raw)) => header_entries_from_field(Some(&raw)),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "ignoring malformed global custom headers");
            Vec::new()
        }),
    }
}
