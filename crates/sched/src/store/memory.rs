// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory store backing tests and single-process deployments.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::SchedError;

use super::{
    epoch_ms, HandleTemplate, Job, JobSample, MaterialNode, MaterialStore, Notebook,
    NotebookGroup, NotebookOverride, NotebookStatus, ReturnInfo, RunStatus, SchedStore, Task,
    Workflow, WorkflowEdge, WorkflowNode,
};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    nodes: Vec<WorkflowNode>,
    edges: Vec<WorkflowEdge>,
    handles: HashMap<Uuid, HandleTemplate>,
    tasks: HashMap<Uuid, Task>,
    jobs: HashMap<Uuid, Job>,
    notebooks: HashMap<Uuid, Notebook>,
    groups: HashMap<Uuid, NotebookGroup>,
    overrides: Vec<NotebookOverride>,
    job_samples: Vec<JobSample>,
    materials: Vec<MaterialNode>,
}

/// Shared in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Seeding ------------------------------------------------------------

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.inner.write().workflows.insert(workflow.id, workflow);
    }

    pub fn insert_node(&self, node: WorkflowNode) {
        self.inner.write().nodes.push(node);
    }

    pub fn insert_edge(&self, edge: WorkflowEdge) {
        self.inner.write().edges.push(edge);
    }

    pub fn insert_handle(&self, handle: HandleTemplate) {
        self.inner.write().handles.insert(handle.id, handle);
    }

    pub fn insert_notebook(&self, notebook: Notebook) {
        self.inner.write().notebooks.insert(notebook.id, notebook);
    }

    pub fn insert_group(&self, group: NotebookGroup) {
        self.inner.write().groups.insert(group.id, group);
    }

    pub fn insert_override(&self, over: NotebookOverride) {
        self.inner.write().overrides.push(over);
    }

    pub fn insert_material(&self, node: MaterialNode) {
        self.inner.write().materials.push(node);
    }

    // -- Inspection (tests) -------------------------------------------------

    pub fn jobs_for_task(&self, task_id: Uuid) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .read()
            .jobs
            .values()
            .filter(|j| j.task_id == task_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.updated_at_ms);
        jobs
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.read().tasks.values().cloned().collect()
    }

    pub fn job_samples(&self) -> Vec<JobSample> {
        self.inner.read().job_samples.clone()
    }
}

impl SchedStore for MemoryStore {
    fn workflow(&self, id: Uuid) -> Result<Workflow, SchedError> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("workflow {id}")))
    }

    fn workflow_nodes(&self, workflow_id: Uuid) -> Result<Vec<WorkflowNode>, SchedError> {
        Ok(self
            .inner
            .read()
            .nodes
            .iter()
            .filter(|n| n.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    fn workflow_edges(&self, node_ids: &[Uuid]) -> Result<Vec<WorkflowEdge>, SchedError> {
        Ok(self
            .inner
            .read()
            .edges
            .iter()
            .filter(|e| node_ids.contains(&e.source_node) || node_ids.contains(&e.target_node))
            .cloned()
            .collect())
    }

    fn handle_templates(&self, ids: &[Uuid]) -> Result<Vec<HandleTemplate>, SchedError> {
        let inner = self.inner.read();
        Ok(ids.iter().filter_map(|id| inner.handles.get(id).cloned()).collect())
    }

    fn ensure_task(&self, task: Task) -> Result<(), SchedError> {
        self.inner.write().tasks.entry(task.id).or_insert(task);
        Ok(())
    }

    fn begin_task(&self, id: Uuid) -> Result<Task, SchedError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        if task.status != RunStatus::Pending {
            return Err(SchedError::InvalidArgument(format!(
                "task {id} is {}, not pending",
                task.status.as_str()
            )));
        }
        task.status = RunStatus::Running;
        task.started_at_ms = Some(epoch_ms());
        Ok(task.clone())
    }

    fn task(&self, id: Uuid) -> Result<Task, SchedError> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))
    }

    fn update_task_status(&self, id: Uuid, status: RunStatus) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        task.status = status;
        if status.is_terminal() {
            task.finished_at_ms = Some(epoch_ms());
        }
        Ok(())
    }

    fn create_jobs(&self, jobs: &[Job]) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        for job in jobs {
            inner.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn job(&self, id: Uuid) -> Result<Job, SchedError> {
        self.inner
            .read()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("job {id}")))
    }

    fn update_job_status(&self, id: Uuid, status: RunStatus) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("job {id}")))?;
        job.status = status;
        job.updated_at_ms = epoch_ms();
        Ok(())
    }

    fn update_job_result(
        &self,
        id: Uuid,
        status: RunStatus,
        feedback_data: Value,
        return_info: ReturnInfo,
    ) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("job {id}")))?;
        job.status = status;
        job.feedback_data = feedback_data;
        job.return_info = return_info;
        job.updated_at_ms = epoch_ms();
        Ok(())
    }

    fn notebook(&self, id: Uuid) -> Result<Notebook, SchedError> {
        self.inner
            .read()
            .notebooks
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("notebook {id}")))
    }

    fn update_notebook_status(&self, id: Uuid, status: NotebookStatus) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        let nb = inner
            .notebooks
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("notebook {id}")))?;
        if nb.started_at_ms.is_none() && status == NotebookStatus::Running {
            nb.started_at_ms = Some(epoch_ms());
        }
        if matches!(status, NotebookStatus::Success | NotebookStatus::Fail) {
            nb.finished_at_ms = Some(epoch_ms());
        }
        nb.status = status;
        Ok(())
    }

    fn notebook_groups(&self, notebook_id: Uuid) -> Result<Vec<NotebookGroup>, SchedError> {
        let mut groups: Vec<NotebookGroup> = self
            .inner
            .read()
            .groups
            .values()
            .filter(|g| g.notebook_id == notebook_id)
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.seq);
        Ok(groups)
    }

    fn group_overrides(&self, group_ids: &[Uuid]) -> Result<Vec<NotebookOverride>, SchedError> {
        Ok(self
            .inner
            .read()
            .overrides
            .iter()
            .filter(|o| group_ids.contains(&o.group_id))
            .cloned()
            .collect())
    }

    fn update_group_status(&self, id: Uuid, status: NotebookStatus) -> Result<(), SchedError> {
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("notebook group {id}")))?;
        if group.started_at_ms.is_none() && status == NotebookStatus::Running {
            group.started_at_ms = Some(epoch_ms());
        }
        if matches!(status, NotebookStatus::Success | NotebookStatus::Fail) {
            group.finished_at_ms = Some(epoch_ms());
        }
        group.status = status;
        Ok(())
    }

    fn create_job_samples(&self, samples: &[JobSample]) -> Result<(), SchedError> {
        self.inner.write().job_samples.extend_from_slice(samples);
        Ok(())
    }
}

impl MaterialStore for MemoryStore {
    fn update_device_property(
        &self,
        lab_id: Uuid,
        device_id: &str,
        property: &str,
        value: Value,
    ) -> Result<Vec<MaterialNode>, SchedError> {
        let mut inner = self.inner.write();
        let mut updated = Vec::new();
        for node in inner
            .materials
            .iter_mut()
            .filter(|n| n.lab_id == lab_id && n.device_id == device_id)
        {
            if let Value::Object(ref mut map) = node.data {
                map.insert(property.to_owned(), value.clone());
            } else {
                node.data = serde_json::json!({ property: value.clone() });
            }
            updated.push(node.clone());
        }
        Ok(updated)
    }
}
