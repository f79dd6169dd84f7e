// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-lab edge session: the bidirectional conduit and router.
//!
//! One `EdgeSession` exists per connected lab edge. It owns the serialized
//! outbound writer, the heartbeat task, and (once the edge reports ready)
//! the two queue consumers. Inbound frames are demultiplexed in
//! [`demux`]; engines borrow the writer and run under the session scope.

mod consumer;
mod demux;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::LabIdentity;
use crate::bus::MsgBus;
use crate::engine::{ActionEngine, EngineDeps, JobTask};
use crate::error::SchedError;
use crate::proto::{encode_frame, EdgeAction};
use crate::queue::{JobQueue, Kv};
use crate::registry::LabRegistry;
use crate::sandbox::Sandbox;
use crate::store::{MaterialStore, SchedStore};

/// Serialized handle to the session's outbound channel. Cloned into every
/// engine running under the session; sends fail with
/// edge-connection-closed once the session is gone.
#[derive(Clone)]
pub struct EdgeWriter {
    tx: mpsc::Sender<String>,
}

impl EdgeWriter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send<T: Serialize>(
        &self,
        action: EdgeAction,
        data: &T,
    ) -> Result<(), SchedError> {
        let payload =
            encode_frame(action, data).map_err(|e| SchedError::Internal(e.to_string()))?;
        self.send_raw(payload).await
    }

    pub async fn send_raw(&self, payload: String) -> Result<(), SchedError> {
        self.tx.send(payload).await.map_err(|_| SchedError::EdgeConnectionClosed)
    }
}

/// Handles a session borrows from the process services.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn SchedStore>,
    pub material: Arc<dyn MaterialStore>,
    pub kv: Arc<dyn Kv>,
    pub queue: Arc<dyn JobQueue>,
    pub bus: Arc<dyn MsgBus>,
    pub sandbox: Arc<dyn Sandbox>,
    pub registry: LabRegistry,
    pub translate_node_param: bool,
    pub node_pool_size: usize,
    /// Process-wide cap on concurrently running engines.
    pub run_permits: Arc<Semaphore>,
}

pub struct EdgeSession {
    pub lab: LabIdentity,
    /// Session token chosen by the edge; doubles as the heartbeat value.
    pub edge_token: String,
    deps: SessionDeps,
    writer: EdgeWriter,
    cancel: CancellationToken,
    job_slot: Mutex<Option<JobTask>>,
    action_slot: Mutex<Option<Arc<ActionEngine>>>,
    consumers_started: AtomicBool,
    closed: AtomicBool,
    /// Heartbeat plus (after ready) the two consumers.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference handed to spawned tasks.
    self_ref: Weak<EdgeSession>,
}

impl EdgeSession {
    /// Create the session and start its heartbeat. The returned receiver
    /// is the outbound pump the connection owner drains into the socket.
    pub fn new(
        deps: SessionDeps,
        lab: LabIdentity,
        edge_token: String,
        parent_scope: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (writer, writer_rx) = EdgeWriter::channel(64);
        let cancel = parent_scope.child_token();

        let heartbeat = {
            let registry = deps.registry.clone();
            let lab_id = lab.lab_id;
            let token = edge_token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                registry.run_heartbeat(lab_id, token, cancel).await;
            })
        };

        let session = Arc::new_cyclic(|self_ref| Self {
            lab,
            edge_token,
            deps,
            writer,
            cancel,
            job_slot: Mutex::new(None),
            action_slot: Mutex::new(None),
            consumers_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![heartbeat]),
            self_ref: self_ref.clone(),
        });
        (session, writer_rx)
    }

    pub fn writer(&self) -> EdgeWriter {
        self.writer.clone()
    }

    pub fn scope(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn engine_deps(&self) -> EngineDeps {
        EngineDeps {
            store: Arc::clone(&self.deps.store),
            kv: Arc::clone(&self.deps.kv),
            bus: Arc::clone(&self.deps.bus),
            sandbox: Arc::clone(&self.deps.sandbox),
            writer: self.writer.clone(),
            translate_node_param: self.deps.translate_node_param,
            node_pool_size: self.deps.node_pool_size,
        }
    }

    pub(crate) fn session_deps(&self) -> &SessionDeps {
        &self.deps
    }

    /// Start the two queue consumers; the session is dispatch-ready.
    /// Idempotent: a repeated `host_node_ready` is a no-op.
    pub fn start_consumers(&self) {
        if self.consumers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.self_ref.upgrade() else { return };
        let handles = consumer::spawn_consumers(&session);
        self.tasks.lock().extend(handles);
        tracing::info!(lab = %self.lab.lab_id, "edge ready, consumers started");
    }

    // -- Slots ---------------------------------------------------------------

    pub(crate) fn set_job_slot(&self, task: Option<JobTask>) {
        *self.job_slot.lock() = task;
    }

    pub(crate) fn job_slot(&self) -> Option<JobTask> {
        self.job_slot.lock().clone()
    }

    pub(crate) fn set_action_slot(&self, engine: Option<Arc<ActionEngine>>) {
        *self.action_slot.lock() = engine;
    }

    pub(crate) fn action_slot(&self) -> Option<Arc<ActionEngine>> {
        self.action_slot.lock().clone()
    }

    /// Stop the active job task iff its id matches.
    pub async fn stop_job_task(&self, task_id: uuid::Uuid) {
        let Some(task) = self.job_slot() else { return };
        if task.matches(task_id) {
            tracing::info!(lab = %self.lab.lab_id, task = %task_id, "stopping job task");
            task.stop().await;
        }
    }

    /// Cancel the session scope and wait for the heartbeat and consumers
    /// to observe cancellation and drain. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(lab = %self.lab.lab_id, "session task panicked: {e}");
                }
            }
        }
        tracing::info!(lab = %self.lab.lab_id, "edge session closed");
    }
}
