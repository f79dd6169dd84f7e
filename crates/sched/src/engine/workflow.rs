// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow engine: one DAG run per task.
//!
//! `pending → running → (success | failed | timeout | canceled)`, with the
//! terminal status always recorded before the engine returns.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{channels, BroadcastMessage};
use crate::error::SchedError;
use crate::graph::load_graph;
use crate::proto::{CancelTaskData, EdgeAction, JobStatusData, StartWorkflowData};
use crate::status::ActionKey;
use crate::store::{RunStatus, Task};

use super::node::NodeRunner;
use super::EngineDeps;

pub struct WorkflowEngine {
    info: StartWorkflowData,
    lab_id: Uuid,
    runner: Arc<NodeRunner>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    /// The engine scope is a child of the session scope, so an edge
    /// disconnect cancels every in-flight wait.
    pub fn new(
        deps: EngineDeps,
        lab_id: Uuid,
        info: StartWorkflowData,
        session_scope: &CancellationToken,
    ) -> Arc<Self> {
        let runner =
            NodeRunner::new(deps, lab_id, info.workflow_id, info.user_id.clone());
        Arc::new(Self { info, lab_id, runner, cancel: session_scope.child_token() })
    }

    pub fn task_id(&self) -> Uuid {
        self.info.task_id
    }

    pub fn on_job_update(&self, data: &JobStatusData) {
        self.runner.on_job_update(data);
    }

    pub fn set_action_status(&self, key: ActionKey, free: bool, need_more: std::time::Duration) {
        self.runner.set_action_status(key, free, need_more);
    }

    /// External stop: tell the edge, then cancel the scope. Workers observe
    /// the cancellation at their next poll tick.
    pub async fn stop(&self) {
        let _ = self
            .runner
            .deps
            .writer
            .send(EdgeAction::CancelTask, &CancelTaskData { task_id: self.info.task_id })
            .await;
        self.cancel.cancel();
    }

    /// Run to a terminal state. Always records the task's terminal status
    /// before returning.
    pub async fn run(&self) -> Result<(), SchedError> {
        let task_id = self.info.task_id;
        let store = &self.runner.deps.store;

        // The dispatcher only minted the task id.
        store.ensure_task(Task {
            id: task_id,
            workflow_id: self.info.workflow_id,
            lab_id: self.lab_id,
            user_id: self.info.user_id.clone(),
            notebook_group_id: None,
            status: RunStatus::Pending,
            started_at_ms: None,
            finished_at_ms: None,
        })?;
        store.begin_task(task_id)?;

        let result = self.load_and_run().await;

        let status = match &result {
            Ok(()) => RunStatus::Success,
            Err(e) => e.terminal_status(),
        };
        if let Err(e) = store.update_task_status(task_id, status) {
            tracing::error!(task = %task_id, "terminal status update failed: {e}");
        }
        self.broadcast_terminal(status, result.as_ref().err()).await;

        // Every wait created under this task must be gone by now.
        debug_assert!(self.runner.status.is_empty());

        result
    }

    async fn load_and_run(&self) -> Result<(), SchedError> {
        let store = &self.runner.deps.store;
        store.workflow(self.info.workflow_id)?;

        let graph = load_graph(
            store.as_ref(),
            self.info.workflow_id,
            self.runner.deps.translate_node_param,
        )?;

        // An empty workflow succeeds immediately with zero jobs.
        Arc::clone(&self.runner)
            .run_dag(
                &self.cancel,
                self.info.task_id,
                &graph,
                None,
                &std::collections::HashMap::new(),
            )
            .await
    }

    /// Task-level terminal event for `workflow-run` subscribers.
    async fn broadcast_terminal(&self, status: RunStatus, error: Option<&SchedError>) {
        let mut msg = BroadcastMessage::new(channels::WORKFLOW_RUN);
        msg.lab_id = self.lab_id;
        msg.workflow_id = self.info.workflow_id;
        msg.task_id = self.info.task_id;
        msg.user_id = self.info.user_id.clone();
        msg.data = serde_json::json!({
            "task_id": self.info.task_id,
            "status": status,
            "error": error.map(|e| e.to_string()),
        });
        if let Err(e) = self.runner.deps.bus.broadcast(msg).await {
            tracing::error!(task = %self.info.task_id, "terminal broadcast failed: {e}");
        }
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
