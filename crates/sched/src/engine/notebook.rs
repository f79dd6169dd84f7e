// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notebook engine: the same workflow run once per parameter group.
//!
//! Groups run sequentially in order; within a group the DAG runs exactly as
//! a workflow task, with per-node parameter overrides supplied by the group.
//! The first failing group stops the notebook.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedError;
use crate::graph::{load_graph, WorkflowGraph};
use crate::proto::{CancelTaskData, EdgeAction, JobStatusData, StartNotebookData};
use crate::status::ActionKey;
use crate::store::{Notebook, NotebookGroup, NotebookStatus, RunStatus, Task};

use super::node::NodeRunner;
use super::EngineDeps;

pub struct NotebookEngine {
    info: StartNotebookData,
    lab_id: Uuid,
    runner: Arc<NodeRunner>,
    cancel: CancellationToken,
    /// Task of the group currently running; `job_status` routing and the
    /// stop path match on it.
    current_task: Mutex<Uuid>,
}

impl NotebookEngine {
    pub fn new(
        deps: EngineDeps,
        lab_id: Uuid,
        info: StartNotebookData,
        session_scope: &CancellationToken,
    ) -> Arc<Self> {
        let runner = NodeRunner::new(deps, lab_id, Uuid::nil(), info.user_id.clone());
        Arc::new(Self {
            info,
            lab_id,
            runner,
            cancel: session_scope.child_token(),
            current_task: Mutex::new(Uuid::nil()),
        })
    }

    pub fn current_task_id(&self) -> Uuid {
        *self.current_task.lock()
    }

    /// The id minted by the dispatcher when the notebook was enqueued.
    pub fn handle_task_id(&self) -> Uuid {
        self.info.task_id
    }

    pub fn on_job_update(&self, data: &JobStatusData) {
        self.runner.on_job_update(data);
    }

    pub fn set_action_status(&self, key: ActionKey, free: bool, need_more: std::time::Duration) {
        self.runner.set_action_status(key, free, need_more);
    }

    /// Cancel the currently running group's task on the edge, then the
    /// whole notebook scope.
    pub async fn stop(&self) {
        let task_id = self.current_task_id();
        if !task_id.is_nil() {
            let _ = self
                .runner
                .deps
                .writer
                .send(EdgeAction::CancelTask, &CancelTaskData { task_id })
                .await;
        }
        self.cancel.cancel();
    }

    /// Run every group to completion or the first failure. The notebook's
    /// terminal status is always recorded.
    pub async fn run(&self) -> Result<(), SchedError> {
        let store = &self.runner.deps.store;

        let notebook = store.notebook(self.info.notebook_id)?;
        if notebook.status != NotebookStatus::Init {
            return Err(SchedError::InvalidArgument(format!(
                "notebook {} is not in init",
                self.info.notebook_id
            )));
        }
        store.update_notebook_status(notebook.id, NotebookStatus::Pending)?;
        self.runner.set_workflow_id(notebook.workflow_id);

        let outcome = self.run_groups(&notebook).await;

        let status = match &outcome {
            Ok(()) => NotebookStatus::Success,
            Err(_) => NotebookStatus::Fail,
        };
        if let Err(e) = store.update_notebook_status(notebook.id, status) {
            tracing::error!(notebook = %notebook.id, "terminal status update failed: {e}");
        }
        outcome
    }

    async fn run_groups(&self, notebook: &Notebook) -> Result<(), SchedError> {
        let store = &self.runner.deps.store;

        let groups: Vec<NotebookGroup> = store
            .notebook_groups(notebook.id)?
            .into_iter()
            .filter(|g| g.status == NotebookStatus::Init)
            .collect();
        if groups.is_empty() {
            return Err(SchedError::EmptyParameters);
        }

        let overrides = self.load_overrides(&groups)?;
        let graph = load_graph(
            store.as_ref(),
            notebook.workflow_id,
            self.runner.deps.translate_node_param,
        )?;
        self.validate_overrides(&graph, &overrides)?;

        store.update_notebook_status(notebook.id, NotebookStatus::Running)?;

        for group in &groups {
            if self.cancel.is_cancelled() {
                return Err(SchedError::Canceled);
            }
            self.run_group(notebook, group, &graph, &overrides).await?;
        }
        Ok(())
    }

    /// Per-group override maps keyed by group, then node.
    fn load_overrides(
        &self,
        groups: &[NotebookGroup],
    ) -> Result<HashMap<Uuid, HashMap<Uuid, Value>>, SchedError> {
        let group_ids: Vec<Uuid> = groups.iter().map(|g| g.id).collect();
        let rows = self.runner.deps.store.group_overrides(&group_ids)?;
        if rows.is_empty() {
            return Err(SchedError::EmptyParameters);
        }

        let mut by_group: HashMap<Uuid, HashMap<Uuid, Value>> = HashMap::new();
        for row in rows {
            by_group.entry(row.group_id).or_default().insert(row.node_id, row.param);
        }

        // Every group carries the same number of overrides.
        let expected = by_group.values().map(HashMap::len).max().unwrap_or(0);
        for group in groups {
            let count = by_group.get(&group.id).map(HashMap::len).unwrap_or(0);
            if count != expected {
                return Err(SchedError::InvalidArgument(format!(
                    "group {} has {count} overrides, expected {expected}",
                    group.id
                )));
            }
        }
        Ok(by_group)
    }

    fn validate_overrides(
        &self,
        graph: &WorkflowGraph,
        overrides: &HashMap<Uuid, HashMap<Uuid, Value>>,
    ) -> Result<(), SchedError> {
        for per_node in overrides.values() {
            for node_id in per_node.keys() {
                if graph.node(*node_id).is_none() {
                    return Err(SchedError::InvalidArgument(format!(
                        "override references unknown node {node_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run_group(
        &self,
        notebook: &Notebook,
        group: &NotebookGroup,
        graph: &WorkflowGraph,
        overrides: &HashMap<Uuid, HashMap<Uuid, Value>>,
    ) -> Result<(), SchedError> {
        let store = &self.runner.deps.store;

        let task_id = Uuid::new_v4();
        store.ensure_task(Task {
            id: task_id,
            workflow_id: notebook.workflow_id,
            lab_id: self.lab_id,
            user_id: self.info.user_id.clone(),
            notebook_group_id: Some(group.id),
            status: RunStatus::Pending,
            started_at_ms: None,
            finished_at_ms: None,
        })?;
        store.begin_task(task_id)?;
        *self.current_task.lock() = task_id;
        store.update_group_status(group.id, NotebookStatus::Running)?;

        let empty = HashMap::new();
        let group_overrides = overrides.get(&group.id).unwrap_or(&empty);
        let result = Arc::clone(&self.runner)
            .run_dag(
                &self.cancel,
                task_id,
                graph,
                Some(group_overrides),
                &group.sample_material,
            )
            .await;

        let task_status = match &result {
            Ok(()) => RunStatus::Success,
            Err(e) => e.terminal_status(),
        };
        if let Err(e) = store.update_task_status(task_id, task_status) {
            tracing::error!(task = %task_id, "task status update failed: {e}");
        }
        let group_status = match &result {
            Ok(()) => NotebookStatus::Success,
            Err(_) => NotebookStatus::Fail,
        };
        if let Err(e) = store.update_group_status(group.id, group_status) {
            tracing::error!(group = %group.id, "group status update failed: {e}");
        }

        result
    }
}

#[cfg(test)]
#[path = "notebook_tests.rs"]
mod tests;
