//! Tests driving a link runtime from the coordinator's side of the duplex.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mailhook_channel::{
    duplex, ChannelError, CommandError, CommandRouter, Frame, LinkConfig, LinkEnd, LinkRuntime,
    NoPushSubscription, PushSubscription, Reply,
};
use serde_json::{json, Value};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

struct Coordinator {
    end: LinkEnd,
}

impl Coordinator {
    async fn next(&mut self) -> Frame {
        let value = timeout(WAIT, self.end.rx.recv())
            .await
            .expect("frame within deadline")
            .expect("link open");
        Frame::from_value(value).expect("well-formed frame")
    }

    /// Next frame that is not a heartbeat.
    async fn next_significant(&mut self) -> Frame {
        loop {
            match self.next().await {
                Frame::Heartbeat => continue,
                frame => return frame,
            }
        }
    }

    fn send(&self, frame: &Frame) {
        self.end.tx.send(frame.to_value().unwrap()).unwrap();
    }

    fn send_raw(&self, value: Value) {
        self.end.tx.send(value).unwrap();
    }
}

fn start(
    push: Arc<dyn PushSubscription>,
    config: LinkConfig,
) -> (Coordinator, LinkRuntime, UnboundedReceiver<Value>) {
    let (worker, coordinator) = duplex();
    let runtime = LinkRuntime::new(worker.tx, Arc::new(CommandRouter::new(push)), config);
    (Coordinator { end: coordinator }, runtime, worker.rx)
}

fn quiet_config() -> LinkConfig {
    LinkConfig {
        default_timeout: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(60),
    }
}

struct FailingStart;

#[async_trait]
impl PushSubscription for FailingStart {
    async fn start(&self) -> Result<(), CommandError> {
        Err(CommandError::PushSubscription("no credentials".into()))
    }

    async fn update(&self, _app: Value) -> Result<(), CommandError> {
        Ok(())
    }
}

struct HangingStart;

#[async_trait]
impl PushSubscription for HangingStart {
    async fn start(&self) -> Result<(), CommandError> {
        std::future::pending().await
    }

    async fn update(&self, _app: Value) -> Result<(), CommandError> {
        Ok(())
    }
}

#[tokio::test]
async fn announces_ready_then_heartbeats() {
    let config = LinkConfig {
        default_timeout: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
    };
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), config);
    let token = runtime.cancellation_token();
    let handle = runtime.spawn(inbound);

    assert_eq!(coordinator.next().await, Frame::Ready);
    assert_eq!(coordinator.next().await, Frame::Heartbeat);
    assert_eq!(coordinator.next().await, Frame::Heartbeat);

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn every_inbound_call_gets_exactly_one_response() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    coordinator.send(&Frame::Call {
        mid: "c:1".into(),
        message: json!({"cmd": "somethingNew"}),
        timeout: None,
    });
    coordinator.send(&Frame::Call {
        mid: "c:2".into(),
        message: json!({"cmd": "resource-usage"}),
        timeout: Some(1000),
    });

    let mut replies = Vec::new();
    for _ in 0..2 {
        match coordinator.next_significant().await {
            Frame::Resp { mid, reply } => replies.push((mid, reply)),
            other => panic!("expected resp frame, got {other:?}"),
        }
    }
    replies.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(replies[0], ("c:1".to_string(), Reply::Success(json!(999))));
    assert_eq!(replies[1].0, "c:2");
    assert!(matches!(&replies[1].1, Reply::Success(snapshot) if snapshot["pid"].is_u64()));

    assert!(timeout(Duration::from_millis(100), coordinator.end.rx.recv()).await.is_err());

    drop(coordinator);
    handle.await.unwrap();
}

#[tokio::test]
async fn outbound_call_resolves_through_dispatch_loop() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let channel = runtime.channel();
    let _handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    let caller = tokio::spawn({
        let channel = channel.clone();
        async move { channel.call(json!({"cmd": "lookup", "id": 7}), Some(WAIT)).await }
    });

    let Frame::Call { mid, message, .. } = coordinator.next_significant().await else {
        panic!("expected call frame");
    };
    assert_eq!(message, json!({"cmd": "lookup", "id": 7}));

    coordinator.send_raw(json!({"cmd": "resp", "mid": "0:unknown", "response": 1}));
    coordinator.send(&Frame::Resp { mid, reply: Reply::Success(json!({"found": true})) });

    assert_eq!(caller.await.unwrap(), Ok(json!({"found": true})));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let _handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    coordinator.send_raw(json!("garbage"));
    coordinator.send_raw(json!({"cmd": "explode"}));
    coordinator.send_raw(json!({"cmd": "call"}));
    coordinator.send(&Frame::Call {
        mid: "after".into(),
        message: json!({"cmd": "unknown"}),
        timeout: None,
    });

    assert_eq!(
        coordinator.next_significant().await,
        Frame::Resp { mid: "after".into(), reply: Reply::Success(json!(999)) }
    );
}

#[tokio::test]
async fn closing_the_link_rejects_pending_calls() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let channel = runtime.channel();
    let handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    let caller = tokio::spawn({
        let channel = channel.clone();
        async move { channel.call(json!({"cmd": "slow"}), Some(Duration::from_secs(30))).await }
    });
    assert!(matches!(coordinator.next_significant().await, Frame::Call { .. }));

    drop(coordinator);
    handle.await.unwrap();

    assert_eq!(caller.await.unwrap(), Err(ChannelError::Closed));
    assert_eq!(channel.call(json!({}), None).await, Err(ChannelError::Closed));
}

#[tokio::test]
async fn push_start_failure_is_not_fatal() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(FailingStart), quiet_config());
    let _handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    coordinator.send(&Frame::Call {
        mid: "p:1".into(),
        message: json!({"cmd": "googlePubSub", "app": {"project": "p"}}),
        timeout: None,
    });

    assert_eq!(
        coordinator.next_significant().await,
        Frame::Resp { mid: "p:1".into(), reply: Reply::Success(json!(true)) }
    );
}

#[tokio::test]
async fn hanging_push_start_does_not_block_the_link() {
    let config = LinkConfig {
        default_timeout: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
    };
    let (mut coordinator, runtime, inbound) = start(Arc::new(HangingStart), config);
    let _handle = runtime.spawn(inbound);

    assert_eq!(coordinator.next().await, Frame::Ready);
    assert_eq!(coordinator.next().await, Frame::Heartbeat);

    coordinator.send(&Frame::Call {
        mid: "h:1".into(),
        message: json!({"cmd": "ping"}),
        timeout: None,
    });
    assert_eq!(
        coordinator.next_significant().await,
        Frame::Resp { mid: "h:1".into(), reply: Reply::Success(json!(999)) }
    );
}

#[tokio::test]
async fn fractional_timeout_is_still_answered() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let _handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    coordinator.send_raw(json!({
        "cmd": "call",
        "mid": "m1",
        "message": {"cmd": "resource-usage"},
        "timeout": 1500.5
    }));

    match coordinator.next_significant().await {
        Frame::Resp { mid, reply: Reply::Success(snapshot) } => {
            assert_eq!(mid, "m1");
            assert!(snapshot["pid"].is_u64());
        },
        other => panic!("expected success resp, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_call_gets_error_response() {
    let (mut coordinator, runtime, inbound) = start(Arc::new(NoPushSubscription), quiet_config());
    let _handle = runtime.spawn(inbound);
    assert_eq!(coordinator.next().await, Frame::Ready);

    coordinator.send_raw(json!({"cmd": "call", "mid": "bad:1", "statusCode": "teapot"}));

    match coordinator.next_significant().await {
        Frame::Resp { mid, reply: Reply::Failure(error) } => {
            assert_eq!(mid, "bad:1");
            assert_eq!(error.code.as_deref(), Some("MalformedCall"));
            assert_eq!(error.status_code, Some(400));
            assert!(error.message.starts_with("malformed call frame"));
        },
        other => panic!("expected error resp, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(100), coordinator.end.rx.recv()).await.is_err());
}
