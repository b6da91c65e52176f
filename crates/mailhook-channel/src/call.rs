//! Request/response correlation over the link.
//!
//! Every outbound call gets a unique `mid` and a pending slot. The slot is
//! resolved by the matching `resp` frame, by the ttl expiring, or by the
//! link closing, whichever happens first. Anything arriving afterwards for
//! the same `mid` is dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::{ChannelError, Result},
    wire::{millis, Frame, FrameSink, Reply},
};

type Waiter = oneshot::Sender<Result<Value>>;

/// Correlates outbound calls with inbound responses.
#[derive(Debug)]
pub struct CallChannel {
    sink: FrameSink,
    default_timeout: Duration,
    sequence: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<String, Waiter>>,
}

impl CallChannel {
    /// Creates a channel sending calls through `sink`.
    pub fn new(sink: FrameSink, default_timeout: Duration) -> Self {
        Self {
            sink,
            default_timeout,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `message` and waits for the matching response.
    ///
    /// The effective ttl is the larger of the explicit `timeout` (or the
    /// message's own `timeout` field in milliseconds) and the channel
    /// default.
    ///
    /// # Errors
    ///
    /// `Timeout` when no response arrives within the ttl, `Remote` when the
    /// other side answers with an error and `Closed` when the link is gone.
    pub async fn call(&self, message: Value, timeout: Option<Duration>) -> Result<Value> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let requested =
            timeout.or_else(|| message.get("timeout").and_then(millis).map(Duration::from_millis));
        let ttl = requested.map_or(self.default_timeout, |t| t.max(self.default_timeout));
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let mid = self.next_mid();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(mid.clone(), tx);
        let _slot = PendingSlot { channel: self, mid: &mid };

        let frame = Frame::Call { mid: mid.clone(), message, timeout: Some(ttl_ms) };
        self.sink.send(&frame)?;

        // close() may have drained the table between the check above and the
        // insert; the waiter would then sit until the ttl.
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(ttl, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                debug!(mid = %mid, ttl_ms, "call timed out");
                Err(ChannelError::Timeout { ttl_ms })
            },
        }
    }

    /// Resolves the pending call for `mid`.
    ///
    /// Returns `false` when no call is waiting, either because the id is
    /// unknown or because the call already timed out.
    pub fn handle_response(&self, mid: &str, reply: Reply) -> bool {
        let Some(waiter) = self.lock_pending().remove(mid) else {
            debug!(mid = %mid, "dropping response without pending call");
            return false;
        };

        let result = match reply {
            Reply::Success(value) => Ok(value),
            Reply::Failure(error) => Err(ChannelError::from(error)),
        };
        // The caller may have given up between the remove and the send.
        waiter.send(result).is_ok()
    }

    /// Fails every pending call with `Closed` and rejects new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            warn!(pending = drained.len(), "link closed with calls in flight");
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(ChannelError::Closed));
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn next_mid(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{seq}", Utc::now().timestamp_millis())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Removes the pending entry when the call returns or its future is dropped.
struct PendingSlot<'a> {
    channel: &'a CallChannel,
    mid: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.channel.lock_pending().remove(self.mid);
    }
}
