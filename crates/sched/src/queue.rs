// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue and key-value substrate behind the scheduler.
//!
//! The cluster-visible contract is a set of Redis keys; the [`keys`] module
//! is the single source of their names. [`Kv`] and [`JobQueue`] seam the
//! substrate off so the engines never hold a raw client; [`RedisBroker`]
//! is the production implementation and [`MemoryBroker`] backs tests and
//! single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use redis::aio::ConnectionManager;
use tokio::sync::Notify;

use crate::error::SchedError;

/// String key contract shared by every cluster member.
pub mod keys {
    use uuid::Uuid;

    /// Liveness token for a lab's edge session.
    pub fn heart(lab: Uuid) -> String {
        format!("lab:heart:{lab}")
    }

    /// FIFO list of job envelopes (workflows, notebooks).
    pub fn task_queue(lab: Uuid) -> String {
        format!("lab:task:{lab}")
    }

    /// FIFO list of control envelopes (actions, stops, material relays).
    pub fn control_queue(lab: Uuid) -> String {
        format!("lab:control:{lab}")
    }

    /// Pending one-shot action payload.
    pub fn action(task: Uuid) -> String {
        format!("workflow_action:{task}")
    }

    /// One-shot action result, kept for an hour.
    pub fn action_result(task: Uuid) -> String {
        format!("workflow_action:res:{task}")
    }
}

// -- Traits -------------------------------------------------------------------

/// Key-value operations the registry, action engine, and dispatcher use.
///
/// Object-safe; methods take owned keys so implementations can move them
/// into their futures.
pub trait Kv: Send + Sync {
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<String>, SchedError>>;

    fn set_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<(), SchedError>>;

    /// Create-if-absent set; returns whether the key was created.
    fn set_nx_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<bool, SchedError>>;

    fn del(&self, key: String) -> BoxFuture<'static, Result<(), SchedError>>;
}

/// FIFO queue operations: many producers, one blocking consumer.
pub trait JobQueue: Send + Sync {
    fn push(&self, queue: String, payload: String) -> BoxFuture<'static, Result<(), SchedError>>;

    /// Blocking pop with a timeout; `Ok(None)` means nothing to read.
    fn pop(
        &self,
        queue: String,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Option<String>, SchedError>>;
}

// -- Redis implementation -----------------------------------------------------

/// Substrate backed by a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect and return a broker; the manager reconnects on its own.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(url, "redis broker connected");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn redis_err(op: &str, key: &str, err: redis::RedisError) -> SchedError {
    SchedError::Internal(format!("redis {op} {key}: {err}"))
}

impl Kv for RedisBroker {
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<String>, SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            redis::cmd("GET")
                .arg(&key)
                .query_async::<Option<String>>(&mut conn)
                .await
                .map_err(|e| redis_err("get", &key, e))
        }
        .boxed()
    }

    fn set_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<(), SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| redis_err("set", &key, e))
        }
        .boxed()
    }

    fn set_nx_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<bool, SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            let created: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("setnx", &key, e))?;
            Ok(created.is_some())
        }
        .boxed()
    }

    fn del(&self, key: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            redis::cmd("DEL")
                .arg(&key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| redis_err("del", &key, e))
        }
        .boxed()
    }
}

impl JobQueue for RedisBroker {
    fn push(&self, queue: String, payload: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            redis::cmd("LPUSH")
                .arg(&queue)
                .arg(&payload)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| redis_err("lpush", &queue, e))
        }
        .boxed()
    }

    fn pop(
        &self,
        queue: String,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Option<String>, SchedError>> {
        let mut conn = self.conn.clone();
        async move {
            // LPUSH + BRPOP keeps FIFO order across producers.
            let entry: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(&queue)
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("brpop", &queue, e))?;
            Ok(entry.map(|(_, payload)| payload))
        }
        .boxed()
    }
}

// -- In-memory implementation -------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    kv: parking_lot::Mutex<HashMap<String, (String, Option<Instant>)>>,
    queues: parking_lot::Mutex<HashMap<String, VecDeque<String>>>,
    queue_wake: Notify,
}

/// Single-process substrate with the same semantics as [`RedisBroker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut kv = self.inner.kv.lock();
        match kv.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                kv.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

impl Kv for MemoryBroker {
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<String>, SchedError>> {
        let this = self.clone();
        async move { Ok(this.live_value(&key)) }.boxed()
    }

    fn set_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            this.inner.kv.lock().insert(key, (value, Some(Instant::now() + ttl)));
            Ok(())
        }
        .boxed()
    }

    fn set_nx_ex(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<bool, SchedError>> {
        let this = self.clone();
        async move {
            if this.live_value(&key).is_some() {
                return Ok(false);
            }
            this.inner.kv.lock().insert(key, (value, Some(Instant::now() + ttl)));
            Ok(true)
        }
        .boxed()
    }

    fn del(&self, key: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            this.inner.kv.lock().remove(&key);
            Ok(())
        }
        .boxed()
    }
}

impl JobQueue for MemoryBroker {
    fn push(&self, queue: String, payload: String) -> BoxFuture<'static, Result<(), SchedError>> {
        let this = self.clone();
        async move {
            this.inner.queues.lock().entry(queue).or_default().push_back(payload);
            this.inner.queue_wake.notify_waiters();
            Ok(())
        }
        .boxed()
    }

    fn pop(
        &self,
        queue: String,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Option<String>, SchedError>> {
        let this = self.clone();
        async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = this.inner.queue_wake.notified();
                if let Some(payload) = this
                    .inner
                    .queues
                    .lock()
                    .get_mut(&queue)
                    .and_then(|q| q.pop_front())
                {
                    return Ok(Some(payload));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        }
        .boxed()
    }
}
