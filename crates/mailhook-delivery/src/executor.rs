//! Single-attempt delivery with error-flag bookkeeping.
//!
//! One call is one POST. The executor never retries; a returned error is
//! the queue's signal to schedule the job again under its own policy.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use mailhook_core::{
    storage::{account_key, route_error_flag_field, settings, FIELD_WEBHOOK_ERROR_FLAG},
    AccountStore, Clock, DeliveryStatus, EffectiveDestination, ErrorFlag, ErrorScope, HeaderSet,
    Job, Metric, Observer, RouteStore, SettingsStore,
};
use serde_json::Value;

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result},
    signing::{split_credentials, SignedPayload, EVENT_ID_HEADER, SIGNATURE_HEADER},
};

/// Header carrying the queue job id.
pub const JOB_ID_HEADER: &str = "X-EE-Wh-Id";

/// Header carrying the number of attempts the queue already made.
pub const ATTEMPTS_MADE_HEADER: &str = "X-EE-Wh-Attempts-Made";

/// Header carrying how long the job waited in the queue.
pub const QUEUED_TIME_HEADER: &str = "X-EE-Wh-Queued-Time";

/// Result of a successful POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// HTTP status returned by the endpoint.
    pub status_code: u16,
    /// Time spent in the request.
    pub duration: Duration,
    /// Destination URL without credentials.
    pub url: String,
}

/// Performs deliveries and tracks the latest failure per scope.
#[derive(Clone)]
pub struct DeliveryExecutor {
    client: DeliveryClient,
    accounts: Arc<dyn AccountStore>,
    settings: Arc<dyn SettingsStore>,
    routes: Arc<dyn RouteStore>,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DeliveryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryExecutor").field("client", &self.client).finish_non_exhaustive()
    }
}

impl DeliveryExecutor {
    /// Creates an executor.
    pub fn new(
        client: DeliveryClient,
        accounts: Arc<dyn AccountStore>,
        settings: Arc<dyn SettingsStore>,
        routes: Arc<dyn RouteStore>,
        observer: Arc<dyn Observer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, accounts, settings, routes, observer, clock }
    }

    /// Posts a signed payload to the destination.
    ///
    /// On success the scope's error flag is cleared; on failure it is
    /// overwritten with this failure. Flag writes that fail are logged and
    /// never change the result.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or the status error for a non-2xx
    /// response.
    pub async fn deliver(
        &self,
        job: &Job,
        destination: &EffectiveDestination,
        signed: SignedPayload,
    ) -> Result<Outcome> {
        let scope = &destination.scope;

        let target = match split_credentials(&destination.url) {
            Ok(target) => target,
            Err(error) => {
                self.fail(job, scope, strip_user_info(&destination.url), &error).await;
                return Err(error);
            },
        };

        let base = base_headers(
            job,
            self.client.user_agent(),
            target.authorization.as_deref(),
            self.clock.now_utc(),
        );
        let headers = layered_headers(base, &destination.headers, &signed);
        let request = DeliveryRequest::new(target.url.clone(), headers, signed.body);

        let started = self.clock.now();
        let result = self.client.deliver(request).await;
        let duration = self.clock.now().saturating_duration_since(started);
        // Headers that fail to encode are rejected before anything is sent.
        if !matches!(result, Err(DeliveryError::ConfigurationError { .. })) {
            self.observer.observe(&Metric::WebhookRequest { duration });
        }

        match result.and_then(DeliveryResponse::into_result) {
            Ok(response) => {
                self.clear_flag(scope).await;
                self.observer.observe(&Metric::Webhooks {
                    event: job.name.clone(),
                    status: DeliveryStatus::Success,
                });
                Ok(Outcome { status_code: response.status_code, duration, url: target.url })
            },
            Err(error) => {
                self.fail(job, scope, &target.url, &error).await;
                Err(error)
            },
        }
    }

    /// Reads the current error flag of a scope; `None` when cleared.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store cannot be read.
    pub async fn error_flag(&self, scope: &ErrorScope) -> Result<Option<ErrorFlag>> {
        let value = match scope {
            ErrorScope::Route(id) => {
                let key = self.routes.webhooks_content_key();
                let raw = self.accounts.hget(&key, &route_error_flag_field(id)).await?;
                raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            },
            ErrorScope::Account(account) => {
                let raw =
                    self.accounts.hget(&account_key(account), FIELD_WEBHOOK_ERROR_FLAG).await?;
                raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            },
            ErrorScope::Global => self.settings.get(settings::WEBHOOK_ERROR_FLAG).await?,
        };

        Ok(value.as_ref().and_then(ErrorFlag::from_value))
    }

    async fn fail(&self, job: &Job, scope: &ErrorScope, url: &str, error: &DeliveryError) {
        let flag = ErrorFlag::new(job.name.clone(), error.to_string(), self.clock.now_utc(), url);
        if let Err(e) = self.write_flag(scope, flag.to_value()).await {
            tracing::warn!(%scope, error = %e, "failed to record webhook error flag");
        }

        self.observer
            .observe(&Metric::Webhooks { event: job.name.clone(), status: DeliveryStatus::Fail });
    }

    async fn clear_flag(&self, scope: &ErrorScope) {
        if let Err(e) = self.write_flag(scope, ErrorFlag::cleared_value()).await {
            tracing::warn!(%scope, error = %e, "failed to clear webhook error flag");
        }
    }

    async fn write_flag(&self, scope: &ErrorScope, value: Value) -> mailhook_core::Result<()> {
        match scope {
            ErrorScope::Route(id) => {
                let key = self.routes.webhooks_content_key();
                self.accounts.hset(&key, &route_error_flag_field(id), &value.to_string()).await
            },
            ErrorScope::Account(account) => {
                self.accounts
                    .hset(&account_key(account), FIELD_WEBHOOK_ERROR_FLAG, &value.to_string())
                    .await
            },
            ErrorScope::Global => self.settings.set(settings::WEBHOOK_ERROR_FLAG, value).await,
        }
    }
}

/// Headers generated for every delivery, before custom layers.
pub fn base_headers(
    job: &Job,
    user_agent: &str,
    authorization: Option<&str>,
    now: DateTime<Utc>,
) -> HeaderSet {
    let queued = (now - job.timestamp).to_std().unwrap_or_default();

    let mut headers = HeaderSet::new();
    headers.insert("Content-Type", "application/json");
    headers.insert("User-Agent", user_agent);
    headers.insert(JOB_ID_HEADER, job.id.to_string());
    headers.insert(ATTEMPTS_MADE_HEADER, job.attempts_made.to_string());
    headers.insert(QUEUED_TIME_HEADER, format!("{:.3}s", queued.as_secs_f64()));
    if let Some(authorization) = authorization {
        headers.insert("Authorization", authorization);
    }
    headers
}

/// Applies custom headers over the base and attaches the signature and event
/// id last, so custom headers can replace generated ones but never these.
pub fn layered_headers(base: HeaderSet, custom: &HeaderSet, signed: &SignedPayload) -> HeaderSet {
    let mut headers = base;
    headers.apply_layer(custom.iter());
    headers.insert(SIGNATURE_HEADER, signed.signature.as_str());
    if let Some(event_id) = &signed.event_id {
        headers.insert(EVENT_ID_HEADER, event_id.as_str());
    }
    headers
}

fn strip_user_info(raw: &str) -> &str {
    raw.rsplit_once('@').map_or(raw, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mailhook_core::{
        storage::mock::{MockAccountStore, MockRouteStore, MockSettingsStore},
        RecordingObserver, TestClock,
    };
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    struct Fixture {
        accounts: MockAccountStore,
        settings: MockSettingsStore,
        observer: RecordingObserver,
        clock: TestClock,
        executor: DeliveryExecutor,
    }

    fn fixture() -> Fixture {
        let accounts = MockAccountStore::new();
        let settings = MockSettingsStore::new();
        let observer = RecordingObserver::new();
        let clock = TestClock::new();
        let executor = DeliveryExecutor::new(
            DeliveryClient::with_defaults().unwrap(),
            Arc::new(accounts.clone()),
            Arc::new(settings.clone()),
            Arc::new(MockRouteStore::new()),
            Arc::new(observer.clone()),
            Arc::new(clock.clone()),
        );
        Fixture { accounts, settings, observer, clock, executor }
    }

    fn signed() -> SignedPayload {
        SignedPayload {
            body: Bytes::from_static(br#"{"event":"messageNew"}"#),
            signature: "sig".into(),
            event_id: Some("ev-1".into()),
        }
    }

    fn destination(url: String, scope: ErrorScope) -> EffectiveDestination {
        EffectiveDestination { url, headers: HeaderSet::new(), scope }
    }

    #[tokio::test]
    async fn failure_then_success_clears_account_flag() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fixture();
        let job = Job::new("1", "messageNew", json!({"account": "42"}));
        let scope = ErrorScope::Account("42".into());
        let target = destination(format!("{}/hook", server.uri()), scope.clone());

        let error = f.executor.deliver(&job, &target, signed()).await.unwrap_err();
        assert_eq!(error.status_code(), Some(500));
        let flag = f.executor.error_flag(&scope).await.unwrap().unwrap();
        assert_eq!(flag.event, "messageNew");
        assert_eq!(flag.url, format!("{}/hook", server.uri()));

        let outcome = f.executor.deliver(&job, &target, signed()).await.unwrap();
        assert_eq!(outcome.status_code, 200);
        assert_eq!(f.executor.error_flag(&scope).await.unwrap(), None);
        assert_eq!(
            f.accounts.field(&account_key("42"), FIELD_WEBHOOK_ERROR_FLAG).await.as_deref(),
            Some(ErrorFlag::CLEARED)
        );

        let statuses: Vec<_> = f
            .observer
            .recorded_with_key("webhooks")
            .into_iter()
            .map(|metric| metric.args())
            .collect();
        assert_eq!(
            statuses,
            vec![
                vec![json!({"event": "messageNew", "status": "fail"})],
                vec![json!({"event": "messageNew", "status": "success"})],
            ]
        );
        assert_eq!(f.observer.recorded_with_key("webhookReq").len(), 2);
    }

    #[tokio::test]
    async fn queued_time_and_flag_time_come_from_clock() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let f = fixture();
        let job = Job::new("1", "messageNew", json!({})).with_timestamp(f.clock.now_utc());
        f.clock.advance(Duration::from_millis(2_250));

        let target = destination(server.uri(), ErrorScope::Global);
        f.executor.deliver(&job, &target, signed()).await.unwrap_err();

        let requests = server.received_requests().await.unwrap();
        let queued = requests[0].headers.get(QUEUED_TIME_HEADER).unwrap();
        assert_eq!(queued.to_str().unwrap(), "2.250s");

        let flag = f.executor.error_flag(&ErrorScope::Global).await.unwrap().unwrap();
        assert_eq!(flag.time.timestamp_millis(), f.clock.now_utc().timestamp_millis());
    }

    #[tokio::test]
    async fn second_failure_overwrites_global_flag() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = fixture();
        let target = destination(format!("{}/hook", server.uri()), ErrorScope::Global);

        let first = Job::new("1", "messageNew", json!({}));
        let second = Job::new("2", "messageDeleted", json!({}));
        assert!(f.executor.deliver(&first, &target, signed()).await.is_err());
        assert!(f.executor.deliver(&second, &target, signed()).await.is_err());

        let stored = f.settings.value(settings::WEBHOOK_ERROR_FLAG).await.unwrap();
        let flag = ErrorFlag::from_value(&stored).unwrap();
        assert_eq!(flag.event, "messageDeleted");
        assert_eq!(flag.message, "webhook rejected with HTTP 404");
    }

    #[tokio::test]
    async fn route_flags_live_under_route_content_key() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let f = fixture();
        let scope = ErrorScope::Route("r1".into());
        let target = destination(format!("{}/hook", server.uri()), scope.clone());

        let job = Job::new("1", "messageNew", json!({"account": "acc1"}));
        assert!(f.executor.deliver(&job, &target, signed()).await.is_err());

        let raw = f
            .accounts
            .field(MockRouteStore::CONTENT_KEY, "r1:webhookErrorFlag")
            .await
            .unwrap();
        assert!(raw.contains("webhook failed with HTTP 500"));
        assert!(f.executor.error_flag(&scope).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flag_write_failure_does_not_mask_success() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fixture();
        f.accounts.inject_error("read only replica");
        let target =
            destination(format!("{}/hook", server.uri()), ErrorScope::Account("42".into()));

        let job = Job::new("1", "messageNew", json!({"account": "42"}));
        assert!(f.executor.deliver(&job, &target, signed()).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_url_fails_without_request() {
        let f = fixture();
        let target = destination("not a url".into(), ErrorScope::Global);

        let job = Job::new("1", "messageNew", json!({}));
        let error = f.executor.deliver(&job, &target, signed()).await.unwrap_err();

        assert!(matches!(error, DeliveryError::ConfigurationError { .. }));
        assert!(f.observer.recorded_with_key("webhookReq").is_empty());
        assert!(f.executor.error_flag(&ErrorScope::Global).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unencodable_custom_header_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let f = fixture();
        let mut target = destination(format!("{}/hook", server.uri()), ErrorScope::Global);
        target.headers.insert("Bad Header", "x");

        let job = Job::new("1", "messageNew", json!({}));
        let error = f.executor.deliver(&job, &target, signed()).await.unwrap_err();

        assert!(matches!(error, DeliveryError::ConfigurationError { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(f.observer.recorded_with_key("webhookReq").is_empty());
        assert_eq!(f.observer.recorded_with_key("webhooks").len(), 1);
        assert!(f.executor.error_flag(&ErrorScope::Global).await.unwrap().is_some());
    }

    #[test]
    fn custom_headers_override_base_but_not_signature() {
        let job = Job::new("7", "messageNew", json!({})).with_attempts_made(2);
        let base = base_headers(&job, "agent/1", Some("Basic abc"), job.timestamp);
        assert_eq!(base.get(JOB_ID_HEADER), Some("7"));
        assert_eq!(base.get(ATTEMPTS_MADE_HEADER), Some("2"));
        assert_eq!(base.get(QUEUED_TIME_HEADER), Some("0.000s"));

        let custom: HeaderSet = [
            ("authorization", "Bearer override"),
            ("x-ee-wh-signature", "forged"),
            ("X-Extra", "1"),
        ]
        .into_iter()
        .collect();

        let headers = layered_headers(base, &custom, &signed());
        assert_eq!(headers.get("Authorization"), Some("Bearer override"));
        assert_eq!(headers.get(SIGNATURE_HEADER), Some("sig"));
        assert_eq!(headers.get(EVENT_ID_HEADER), Some("ev-1"));
        assert_eq!(headers.get("x-extra"), Some("1"));
    }

    #[test]
    fn user_info_stripped_from_unparseable_urls() {
        assert_eq!(strip_user_info("bob:secret@host/hook"), "host/hook");
        assert_eq!(strip_user_info("host/hook"), "host/hook");
    }
}
