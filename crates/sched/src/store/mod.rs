// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entity types and the persistence boundary.
//!
//! Relational persistence is an external collaborator; the scheduler only
//! depends on entity identities and the handful of loads and updates the
//! engines perform, expressed as the [`SchedStore`] and [`MaterialStore`]
//! traits. [`MemoryStore`](memory::MemoryStore) backs tests and
//! single-process deployments.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SchedError;

// -- Status enums -------------------------------------------------------------

/// Lifecycle of a task or a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        }
    }
}

/// Lifecycle of a notebook and its groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotebookStatus {
    Init,
    Pending,
    Running,
    Success,
    Fail,
}

// -- Workflow entities --------------------------------------------------------

/// Discriminator for workflow plan elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    DeviceAction,
    Script,
    /// Visual grouping only; never executed.
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub script: Option<String>,
    /// JSON parameter blob; rewritten per run from overrides and upstream
    /// return values.
    #[serde(default)]
    pub param: Value,
    #[serde(default)]
    pub disabled: bool,
}

/// Directed connection between a source handle and a target handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source_node: Uuid,
    pub target_node: Uuid,
    pub source_handle: Uuid,
    pub target_handle: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Source,
    Target,
}

/// Named input or output of a workflow node.
///
/// `data_source` tags whether an edge through this handle carries a data
/// dependency ("executor") or only a ready signal; `data_key` addresses the
/// value inside the param / return-value JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleTemplate {
    pub id: Uuid,
    pub handle_key: String,
    pub io_type: IoType,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub data_key: String,
}

// -- Execution entities -------------------------------------------------------

/// One execution of a workflow. Notebooks produce one task per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub lab_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub notebook_group_id: Option<Uuid>,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
}

/// Result payload a job carries back from the edge or the sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnInfo {
    #[serde(default)]
    pub suc: bool,
    #[serde(default)]
    pub error: String,
    /// Captured sandbox stdout; empty for device actions.
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub return_value: Value,
    #[serde(default)]
    pub samples: Vec<SampleValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleValue {
    pub sample_id: Uuid,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub extra: Value,
}

/// One execution of a node inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: Uuid,
    pub node_id: Uuid,
    pub lab_id: Uuid,
    pub status: RunStatus,
    #[serde(default)]
    pub feedback_data: Value,
    #[serde(default)]
    pub return_info: ReturnInfo,
    #[serde(default)]
    pub updated_at_ms: u64,
}

/// Link between a completed job and a sample it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSample {
    pub job_id: Uuid,
    pub sample_id: Uuid,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub extra: Value,
}

// -- Notebook entities --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub lab_id: Uuid,
    pub user_id: String,
    pub status: NotebookStatus,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
}

/// One parameter group of a notebook; groups run in `seq` order and each
/// produces its own task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookGroup {
    pub id: Uuid,
    pub notebook_id: Uuid,
    /// Execution order within the notebook.
    pub seq: u64,
    pub status: NotebookStatus,
    /// Sample → material binding attached to device-action dispatches.
    #[serde(default)]
    pub sample_material: HashMap<Uuid, Uuid>,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
}

/// Per-node parameter override inside one notebook group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookOverride {
    pub group_id: Uuid,
    pub node_id: Uuid,
    pub param: Value,
}

// -- Material entities --------------------------------------------------------

/// Material node a device-status update writes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialNode {
    pub id: Uuid,
    pub lab_id: Uuid,
    pub device_id: String,
    pub data: Value,
}

// -- Store traits -------------------------------------------------------------

/// Loads and updates the scheduling engines perform against persistence.
pub trait SchedStore: Send + Sync {
    fn workflow(&self, id: Uuid) -> Result<Workflow, SchedError>;
    fn workflow_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkflowNode>, SchedError>;
    fn workflow_edges(&self, node_ids: &[Uuid]) -> Result<Vec<WorkflowEdge>, SchedError>;
    fn handle_templates(&self, ids: &[Uuid]) -> Result<Vec<HandleTemplate>, SchedError>;

    /// Insert the task row if absent (the dispatcher only mints the id).
    fn ensure_task(&self, task: Task) -> Result<(), SchedError>;
    /// Check the row is `pending` and transition it to `running`, stamping
    /// the start time. Fails with invalid-argument otherwise.
    fn begin_task(&self, id: Uuid) -> Result<Task, SchedError>;
    fn task(&self, id: Uuid) -> Result<Task, SchedError>;
    /// Record a status; terminal statuses also stamp the finish time.
    fn update_task_status(&self, id: Uuid, status: RunStatus) -> Result<(), SchedError>;

    fn create_jobs(&self, jobs: &[Job]) -> Result<(), SchedError>;
    fn job(&self, id: Uuid) -> Result<Job, SchedError>;
    fn update_job_status(&self, id: Uuid, status: RunStatus) -> Result<(), SchedError>;
    fn update_job_result(
        &self,
        id: Uuid,
        status: RunStatus,
        feedback_data: Value,
        return_info: ReturnInfo,
    ) -> Result<(), SchedError>;

    fn notebook(&self, id: Uuid) -> Result<Notebook, SchedError>;
    fn update_notebook_status(&self, id: Uuid, status: NotebookStatus) -> Result<(), SchedError>;
    /// Groups of a notebook, ordered by `seq`.
    fn notebook_groups(&self, notebook_id: Uuid) -> Result<Vec<NotebookGroup>, SchedError>;
    fn group_overrides(&self, group_ids: &[Uuid]) -> Result<Vec<NotebookOverride>, SchedError>;
    fn update_group_status(&self, id: Uuid, status: NotebookStatus) -> Result<(), SchedError>;

    fn create_job_samples(&self, samples: &[JobSample]) -> Result<(), SchedError>;
}

/// Device-property persistence consumed by the session's `device_status`
/// demux path.
pub trait MaterialStore: Send + Sync {
    /// Write `value` under `property` for every material node bound to the
    /// device; returns the updated nodes for broadcasting.
    fn update_device_property(
        &self,
        lab_id: Uuid,
        device_id: &str,
        property: &str,
        value: Value,
    ) -> Result<Vec<MaterialNode>, SchedError>;
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
