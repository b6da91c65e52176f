//! Link runtime: readiness, heartbeats and inbound frame dispatch.
//!
//! One dispatch loop owns the inbound half of the link. Responses are handed
//! to the [`CallChannel`]; calls are served on their own task so a slow
//! command never holds up response dispatch.

use std::{sync::Arc, time::Duration};

use mailhook_core::{Metric, Observer};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    call::CallChannel,
    error::CommandError,
    router::CommandRouter,
    wire::{undecodable_call_mid, Frame, FrameSink, Reply},
};

/// Timing for the link runtime.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Minimum ttl for outbound calls.
    pub default_timeout: Duration,
    /// Interval between heartbeat frames.
    pub heartbeat_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// One end of an in-process duplex link.
#[derive(Debug)]
pub struct LinkEnd {
    /// Frames to the other end.
    pub tx: mpsc::UnboundedSender<Value>,
    /// Frames from the other end.
    pub rx: mpsc::UnboundedReceiver<Value>,
}

/// Creates both ends of an in-process duplex link.
pub fn duplex() -> (LinkEnd, LinkEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (LinkEnd { tx: a_tx, rx: b_rx }, LinkEnd { tx: b_tx, rx: a_rx })
}

/// Drives one end of the coordinator link.
#[derive(Debug)]
pub struct LinkRuntime {
    channel: Arc<CallChannel>,
    router: Arc<CommandRouter>,
    sink: FrameSink,
    config: LinkConfig,
    cancellation_token: CancellationToken,
}

impl LinkRuntime {
    /// Creates a runtime sending frames through `outbound`.
    pub fn new(
        outbound: mpsc::UnboundedSender<Value>,
        router: Arc<CommandRouter>,
        config: LinkConfig,
    ) -> Self {
        let sink = FrameSink::new(outbound);
        let channel = Arc::new(CallChannel::new(sink.clone(), config.default_timeout));
        Self { channel, router, sink, config, cancellation_token: CancellationToken::new() }
    }

    /// Channel for outbound calls over this link.
    pub fn channel(&self) -> Arc<CallChannel> {
        self.channel.clone()
    }

    /// Observer forwarding metrics over this link.
    pub fn metrics_observer(&self) -> LinkMetricsObserver {
        LinkMetricsObserver::new(self.sink.clone())
    }

    /// Token that stops the dispatch loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Runs the dispatch loop on a new task.
    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    /// Runs until cancelled or until either side of the link goes away.
    ///
    /// Pending calls are rejected with `Closed` on exit.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Value>) {
        if let Err(error) = self.sink.send(&Frame::Ready) {
            warn!(error = %error, "failed to announce readiness");
        }

        let router = self.router.clone();
        tokio::spawn(async move {
            if let Err(error) = router.start().await {
                warn!(error = %error, "push subscription failed to start");
            }
        });

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(heartbeat = ?period, "link runtime started");

        loop {
            tokio::select! {
                biased;

                () = self.cancellation_token.cancelled() => {
                    debug!("link runtime cancelled");
                    break;
                }

                frame = inbound.recv() => match frame {
                    Some(value) => self.dispatch(value),
                    None => {
                        info!("inbound link closed");
                        break;
                    },
                },

                _ = heartbeat.tick() => {
                    if self.sink.send(&Frame::Heartbeat).is_err() {
                        info!("outbound link closed");
                        break;
                    }
                    trace!("heartbeat sent");
                }
            }
        }

        self.channel.close();
    }

    fn dispatch(&self, value: Value) {
        let frame = match Frame::from_value(value.clone()) {
            Ok(frame) => frame,
            Err(error) => {
                match undecodable_call_mid(&value) {
                    Some(mid) => {
                        warn!(mid = %mid, error = %error, "rejecting malformed call");
                        let reply = Reply::Failure(
                            CommandError::MalformedCall(error.to_string()).into(),
                        );
                        self.respond(mid.to_string(), reply);
                    },
                    None => warn!(error = %error, "skipping malformed frame"),
                }
                return;
            },
        };

        match frame {
            Frame::Resp { mid, reply } => {
                self.channel.handle_response(&mid, reply);
            },
            Frame::Call { mid, message, .. } => {
                let router = self.router.clone();
                let sink = self.sink.clone();
                tokio::spawn(serve_call(router, sink, mid, message));
            },
            Frame::Heartbeat | Frame::Ready | Frame::Metrics { .. } => {
                trace!("ignoring inbound notification frame");
            },
        }
    }

    fn respond(&self, mid: String, reply: Reply) {
        if let Err(error) = self.sink.send(&Frame::Resp { mid: mid.clone(), reply }) {
            warn!(mid = %mid, error = %error, "failed to send response");
        }
    }
}

async fn serve_call(router: Arc<CommandRouter>, sink: FrameSink, mid: String, message: Value) {
    let reply = match router.on_command(&message).await {
        Ok(response) => Reply::Success(response),
        Err(error) => {
            warn!(mid = %mid, error = %error, "command failed");
            Reply::Failure(error.into())
        },
    };

    if let Err(error) = sink.send(&Frame::Resp { mid: mid.clone(), reply }) {
        warn!(mid = %mid, error = %error, "failed to send response");
    }
}

/// Observer forwarding metrics to the coordinator as `metrics` frames.
#[derive(Debug, Clone)]
pub struct LinkMetricsObserver {
    sink: FrameSink,
}

impl LinkMetricsObserver {
    /// Creates an observer sending through `sink`.
    pub fn new(sink: FrameSink) -> Self {
        Self { sink }
    }
}

impl Observer for LinkMetricsObserver {
    fn observe(&self, metric: &Metric) {
        let frame = Frame::Metrics {
            key: metric.key().to_string(),
            method: metric.method().to_string(),
            args: metric.args(),
        };
        if let Err(error) = self.sink.send(&frame) {
            trace!(key = metric.key(), error = %error, "dropping metric");
        }
    }
}
