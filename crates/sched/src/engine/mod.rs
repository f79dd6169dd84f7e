// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task execution engines.
//!
//! Three engines drive the edge through the device-action protocol: the
//! workflow engine (one DAG run per task), the notebook engine (one DAG run
//! per parameter group), and the action engine (a single ad-hoc device
//! action). They share the per-node protocol driver in [`node`].

pub mod action;
pub mod node;
pub mod notebook;
pub mod params;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::bus::MsgBus;
use crate::proto::JobStatusData;
use crate::queue::Kv;
use crate::sandbox::Sandbox;
use crate::session::EdgeWriter;
use crate::status::ActionKey;
use crate::store::SchedStore;

pub use action::ActionEngine;
pub use notebook::NotebookEngine;
pub use workflow::WorkflowEngine;

/// Deadline for a single query or callback wait.
pub const ACTION_WAIT: Duration = Duration::from_secs(20);

/// Poll interval against the action-status registry.
pub const POLL_TICK: Duration = Duration::from_millis(500);

/// Handles every engine borrows from its session.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn SchedStore>,
    pub kv: Arc<dyn Kv>,
    pub bus: Arc<dyn MsgBus>,
    pub sandbox: Arc<dyn Sandbox>,
    pub writer: EdgeWriter,
    pub translate_node_param: bool,
    pub node_pool_size: usize,
}

/// The session's job slot: at most one workflow-or-notebook task at a time.
///
/// A tagged variant instead of a nullable handle, so "is there a running
/// task" is a tag inspection.
#[derive(Clone)]
pub enum JobTask {
    Workflow(Arc<WorkflowEngine>),
    Notebook(Arc<NotebookEngine>),
}

impl JobTask {
    /// Id of the currently running task (the active group's task for
    /// notebooks).
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Workflow(engine) => engine.task_id(),
            Self::Notebook(engine) => engine.current_task_id(),
        }
    }

    /// Whether a stop targeting `task_id` addresses this task. Notebooks
    /// answer to both their dispatch id and the current group's task id.
    pub fn matches(&self, task_id: Uuid) -> bool {
        match self {
            Self::Workflow(engine) => engine.task_id() == task_id,
            Self::Notebook(engine) => {
                engine.handle_task_id() == task_id || engine.current_task_id() == task_id
            }
        }
    }

    pub fn on_job_update(&self, data: &JobStatusData) {
        match self {
            Self::Workflow(engine) => engine.on_job_update(data),
            Self::Notebook(engine) => engine.on_job_update(data),
        }
    }

    pub fn set_action_status(&self, key: ActionKey, free: bool, need_more: Duration) {
        match self {
            Self::Workflow(engine) => engine.set_action_status(key, free, need_more),
            Self::Notebook(engine) => engine.set_action_status(key, free, need_more),
        }
    }

    /// Send `cancel_task` to the edge and cancel the engine scope.
    pub async fn stop(&self) {
        match self {
            Self::Workflow(engine) => engine.stop().await,
            Self::Notebook(engine) => engine.stop().await,
        }
    }
}
