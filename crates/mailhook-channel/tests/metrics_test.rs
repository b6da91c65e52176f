//! Delivery metrics forwarded to the coordinator over the link.

use std::sync::Arc;

use mailhook_channel::{duplex, CommandRouter, Frame, LinkConfig, LinkRuntime, NoPushSubscription};
use mailhook_core::{
    storage::{
        mock::{MockAccountStore, MockRouteStore, MockSettingsStore},
        settings,
    },
    Job, StaticSecret, TestClock,
};
use mailhook_delivery::{Collaborators, Config, DeliveryClient, NotificationJobHandler};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn delivery_metrics_arrive_as_metrics_frames() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let config = Config::default();
    let (worker, mut coordinator) = duplex();
    let runtime = LinkRuntime::new(
        worker.tx,
        Arc::new(CommandRouter::new(Arc::new(NoPushSubscription))),
        LinkConfig {
            default_timeout: config.rpc_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        },
    );

    let accounts = MockAccountStore::new();
    accounts.add_account_with_webhook("acc1", &format!("{}/hook", server.uri())).await;
    let settings_store = MockSettingsStore::new();
    settings_store.put(settings::WEBHOOKS_ENABLED, json!(true)).await;
    settings_store.put(settings::WEBHOOK_EVENTS, json!(["*"])).await;

    let handler = NotificationJobHandler::new(
        DeliveryClient::new(config.to_client_config()).unwrap(),
        Collaborators {
            accounts: Arc::new(accounts),
            settings: Arc::new(settings_store),
            routes: Arc::new(MockRouteStore::new()),
            secrets: Arc::new(StaticSecret::new(b"secret")),
            observer: Arc::new(runtime.metrics_observer()),
            clock: Arc::new(TestClock::new()),
        },
    );

    let job = Job::new("7", "messageNew", json!({"account": "acc1", "path": "INBOX"}));
    handler.handle(&job).await.unwrap();
    handler.on_completed(&job);

    let mut frames = Vec::new();
    while let Ok(value) = coordinator.rx.try_recv() {
        frames.push(Frame::from_value(value).unwrap());
    }

    let keys: Vec<_> = frames
        .iter()
        .map(|frame| match frame {
            Frame::Metrics { key, method, .. } => (key.as_str(), method.as_str()),
            other => panic!("unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(
        keys,
        vec![("webhookReq", "observe"), ("webhooks", "inc"), ("queuesProcessed", "inc")]
    );

    assert!(frames.contains(&Frame::Metrics {
        key: "webhooks".into(),
        method: "inc".into(),
        args: vec![json!({"event": "messageNew", "status": "success"})],
    }));
    assert!(frames.contains(&Frame::Metrics {
        key: "queuesProcessed".into(),
        method: "inc".into(),
        args: vec![json!({"queue": "notify", "status": "completed"})],
    }));
}
