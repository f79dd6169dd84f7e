// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-process broadcast bus (named channels over redis pub/sub).
//!
//! At most one handler per channel per process. Delivery is best-effort
//! fan-out to every process that registered the channel; per-channel order
//! is preserved within a single subscriber. Handler errors are logged and
//! never tear down the subscription.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedError;

/// Channel names used by the core.
pub mod channels {
    use uuid::Uuid;

    pub const MATERIAL_MODIFY: &str = "material-modify";
    pub const WORKFLOW_RUN: &str = "workflow-run";
    pub const MSG_NOTIFY: &str = "msg-notify";

    /// Per-task status events for stream subscribers.
    pub fn job_status(task: Uuid) -> String {
        format!("job:status:{task}")
    }

    /// Stop signal fan-out; whichever process holds the edge matches on it.
    pub fn job_stop(task: Uuid) -> String {
        format!("job:stop:{task}")
    }

    /// Per-lab raw device-state events.
    pub fn device_status(lab: Uuid) -> String {
        format!("device:status:{lab}")
    }
}

/// Message published on a named channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub channel: String,
    #[serde(default)]
    pub lab_id: Uuid,
    #[serde(default)]
    pub workflow_id: Uuid,
    #[serde(default)]
    pub task_id: Uuid,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub timestamp: i64,
}

impl BroadcastMessage {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            lab_id: Uuid::nil(),
            workflow_id: Uuid::nil(),
            task_id: Uuid::nil(),
            user_id: String::new(),
            data: Value::Null,
            id: Uuid::nil(),
            timestamp: 0,
        }
    }

    /// Stamp the message id (when empty) and timestamp before publishing.
    fn stamp(&mut self) {
        if self.id.is_nil() {
            self.id = Uuid::new_v4();
        }
        self.timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
    }
}

/// Per-channel message handler; receives the raw serialized payload.
pub type BusHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), SchedError>> + Send + Sync>;

/// Process-wide broadcast bus.
pub trait MsgBus: Send + Sync {
    /// Register the channel handler; fails with already-registered when the
    /// channel is taken in this process.
    fn register(
        &self,
        channel: String,
        handler: BusHandler,
    ) -> BoxFuture<'static, Result<(), SchedError>>;

    /// Drop the channel handler and its subscription.
    fn unregister(&self, channel: String) -> BoxFuture<'static, Result<(), SchedError>>;

    /// Stamp, serialize, and publish. Failures surface as send-failed.
    fn broadcast(&self, msg: BroadcastMessage) -> BoxFuture<'static, Result<(), SchedError>>;

    /// Unblock and drain all registered handlers; idempotent.
    fn close(&self) -> BoxFuture<'static, Result<(), SchedError>>;
}

struct ChannelSub {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// -- Redis implementation -----------------------------------------------------

/// Bus over redis pub/sub; one subscriber connection per registered channel.
pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    subs: Arc<Mutex<HashMap<String, ChannelSub>>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn, subs: Arc::new(Mutex::new(HashMap::new())) })
    }
}

impl MsgBus for RedisBus {
    fn register(
        &self,
        channel: String,
        handler: BusHandler,
    ) -> BoxFuture<'static, Result<(), SchedError>> {
        let client = self.client.clone();
        let subs = Arc::clone(&self.subs);
        async move {
            if subs.lock().contains_key(&channel) {
                return Err(SchedError::AlreadyRegistered(channel));
            }

            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| SchedError::Internal(format!("pubsub connect: {e}")))?;
            pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| SchedError::Internal(format!("subscribe {channel}: {e}")))?;

            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let task_channel = channel.clone();
            let handle = tokio::spawn(async move {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        msg = stream.next() => {
                            let Some(msg) = msg else { break };
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::debug!(channel = %task_channel, "bad bus payload: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = handler(payload).await {
                                tracing::error!(channel = %task_channel, "bus handler failed: {e}");
                            }
                        }
                    }
                }
                tracing::debug!(channel = %task_channel, "bus subscriber exited");
            });

            subs.lock().insert(channel, ChannelSub { cancel, handle });
            Ok(())
        }
        .boxed()
    }

    fn unregister(&self, channel: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let subs = Arc::clone(&self.subs);
        async move {
            if let Some(sub) = subs.lock().remove(&channel) {
                sub.cancel.cancel();
                sub.handle.abort();
            }
            Ok(())
        }
        .boxed()
    }

    fn broadcast(&self, mut msg: BroadcastMessage) -> BoxFuture<'static, Result<(), SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            msg.stamp();
            let payload = serde_json::to_string(&msg)
                .map_err(|e| SchedError::BroadcastSendFailed(e.to_string()))?;
            redis::cmd("PUBLISH")
                .arg(&msg.channel)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| SchedError::BroadcastSendFailed(format!("{}: {e}", msg.channel)))
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), SchedError>> {
        let subs = Arc::clone(&self.subs);
        async move {
            let drained: Vec<ChannelSub> = subs.lock().drain().map(|(_, sub)| sub).collect();
            for sub in drained {
                sub.cancel.cancel();
                let _ = sub.handle.await;
            }
            Ok(())
        }
        .boxed()
    }
}

// -- In-memory implementation -------------------------------------------------

#[derive(Default)]
struct MemoryBusInner {
    senders: Mutex<HashMap<String, broadcast::Sender<String>>>,
    subs: Mutex<HashMap<String, ChannelSub>>,
}

/// Single-process bus over tokio broadcast channels.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.inner
            .senders
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Raw subscription for stream consumers (tests, UI feeds).
    pub fn subscribe_raw(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

impl MsgBus for MemoryBus {
    fn register(
        &self,
        channel: String,
        handler: BusHandler,
    ) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            if this.inner.subs.lock().contains_key(&channel) {
                return Err(SchedError::AlreadyRegistered(channel));
            }

            let mut rx = this.sender(&channel).subscribe();
            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let task_channel = channel.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        msg = rx.recv() => match msg {
                            Ok(payload) => {
                                if let Err(e) = handler(payload).await {
                                    tracing::error!(channel = %task_channel, "bus handler failed: {e}");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::debug!(channel = %task_channel, "bus handler lagged {n}");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });

            this.inner.subs.lock().insert(channel, ChannelSub { cancel, handle });
            Ok(())
        }
        .boxed()
    }

    fn unregister(&self, channel: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            let sub = this.inner.subs.lock().remove(&channel);
            if let Some(sub) = sub {
                sub.cancel.cancel();
                let _ = sub.handle.await;
            }
            Ok(())
        }
        .boxed()
    }

    fn broadcast(&self, mut msg: BroadcastMessage) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            msg.stamp();
            let payload = serde_json::to_string(&msg)
                .map_err(|e| SchedError::BroadcastSendFailed(e.to_string()))?;
            // No subscriber is fine; fan-out is best-effort.
            let _ = this.sender(&msg.channel).send(payload);
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            let drained: Vec<ChannelSub> =
                this.inner.subs.lock().drain().map(|(_, sub)| sub).collect();
            for sub in drained {
                sub.cancel.cancel();
                let _ = sub.handle.await;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
