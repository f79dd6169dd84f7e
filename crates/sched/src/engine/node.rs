// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared per-node protocol driver and the wave scheduler.
//!
//! Device-action nodes follow query → dispatch → callback against the edge;
//! script nodes call the sandbox. Both finalize by recording the job's
//! terminal status and broadcasting it on the task's status channel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{channels, BroadcastMessage};
use crate::error::SchedError;
use crate::graph::WorkflowGraph;
use crate::proto::{
    EdgeAction, JobStartData, JobStatusData, QueryActionData, ServerInfo, StatusKind,
};
use crate::status::{ActionKey, StatusRegistry};
use crate::store::{Job, JobSample, NodeType, ReturnInfo, RunStatus, WorkflowNode};

use super::params::rewrite_from_upstream;
use super::{EngineDeps, ACTION_WAIT, POLL_TICK};

/// Poll one action-status entry until it is freed, times out, disappears,
/// or the scope is cancelled. The entry is removed on every exit path.
pub(crate) async fn poll_status(
    registry: &StatusRegistry,
    cancel: &CancellationToken,
    key: &ActionKey,
) -> Result<(), SchedError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                registry.del(key);
                return Err(SchedError::Canceled);
            }
            _ = tokio::time::sleep(POLL_TICK) => {}
        }

        let Some(value) = registry.get(key) else {
            // Another path removed it; distinguishable from a timeout.
            return Err(SchedError::ActionKeyNotFound);
        };
        if value.free {
            registry.del(key);
            return Ok(());
        }
        if value.deadline <= Instant::now() {
            registry.del(key);
            return Err(SchedError::Timeout);
        }
    }
}

/// Per-task protocol driver shared by the workflow and notebook engines.
pub struct NodeRunner {
    pub deps: EngineDeps,
    pub status: StatusRegistry,
    pub lab_id: Uuid,
    /// Filled by the notebook engine once the notebook row is loaded.
    workflow_id: Mutex<Uuid>,
    pub user_id: String,
}

impl NodeRunner {
    pub fn new(deps: EngineDeps, lab_id: Uuid, workflow_id: Uuid, user_id: String) -> Arc<Self> {
        Arc::new(Self {
            deps,
            status: StatusRegistry::new(),
            lab_id,
            workflow_id: Mutex::new(workflow_id),
            user_id,
        })
    }

    pub fn set_workflow_id(&self, id: Uuid) {
        *self.workflow_id.lock() = id;
    }

    /// Route a terminal job-status report from the edge: persist the job's
    /// result and release the matching callback wait.
    pub fn on_job_update(&self, data: &JobStatusData) {
        if !data.status.is_terminal() {
            return;
        }

        if let Err(e) = self.deps.store.update_job_result(
            data.job_id,
            data.status,
            data.feedback_data.clone(),
            data.return_info.clone(),
        ) {
            tracing::warn!(job_id = %data.job_id, "job status update failed: {e}");
        }

        self.status.set(
            &ActionKey {
                kind: StatusKind::Callback,
                task_id: data.task_id,
                job_id: data.job_id,
                device_id: data.device_id.clone(),
                action_name: data.action_name.clone(),
            },
            true,
            std::time::Duration::ZERO,
        );
    }

    pub fn set_action_status(&self, key: ActionKey, free: bool, need_more: std::time::Duration) {
        self.status.set(&key, free, need_more);
    }

    /// Run one node end to end. The effective `param` was already resolved
    /// for this wave.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        node: &WorkflowNode,
        job_id: Uuid,
        param: Value,
        sample_material: &HashMap<Uuid, Uuid>,
    ) -> Result<(), SchedError> {
        match node.node_type {
            NodeType::DeviceAction => {
                self.query_phase(cancel, task_id, node, job_id).await?;
                self.dispatch_device(cancel, task_id, node, job_id, param, sample_material).await
            }
            NodeType::Script => self.exec_script(node, job_id, param).await,
            NodeType::Group => Err(SchedError::Internal("group node scheduled".to_owned())),
        }
    }

    /// Ask the edge whether the device can accept the action, then wait for
    /// the query reply.
    async fn query_phase(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        node: &WorkflowNode,
        job_id: Uuid,
    ) -> Result<(), SchedError> {
        let device_id = node.device_name.clone().unwrap_or_default();
        let key = ActionKey {
            kind: StatusKind::Query,
            task_id,
            job_id,
            device_id: device_id.clone(),
            action_name: node.action_name.clone(),
        };
        self.status.init(key.clone(), Instant::now() + ACTION_WAIT, false);

        let query = QueryActionData {
            task_id,
            job_id,
            device_id,
            action_name: node.action_name.clone(),
        };
        if let Err(e) = self.deps.writer.send(EdgeAction::QueryActionState, &query).await {
            self.status.del(&key);
            return Err(e);
        }

        poll_status(&self.status, cancel, &key).await
    }

    /// Send `job_start` and wait for the callback, then interpret the job
    /// row the edge reported into.
    async fn dispatch_device(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        node: &WorkflowNode,
        job_id: Uuid,
        param: Value,
        sample_material: &HashMap<Uuid, Uuid>,
    ) -> Result<(), SchedError> {
        let device_id = node.device_name.clone().unwrap_or_default();
        let key = ActionKey {
            kind: StatusKind::Callback,
            task_id,
            job_id,
            device_id: device_id.clone(),
            action_name: node.action_name.clone(),
        };
        // Initialized before the send so a fast edge reply cannot race the
        // wait into a lost wakeup.
        self.status.init(key.clone(), Instant::now() + ACTION_WAIT, false);

        let start = JobStartData {
            device_id,
            action: node.action_name.clone(),
            action_type: node.action_type.clone(),
            action_args: param,
            job_id,
            task_id,
            node_id: node.id,
            server_info: ServerInfo::now(),
            sample_material: sample_material.clone(),
        };
        if let Err(e) = self.deps.writer.send(EdgeAction::JobStart, &start).await {
            self.status.del(&key);
            return Err(e);
        }

        poll_status(&self.status, cancel, &key).await?;

        // The callback was released by a job_status report; interpret the
        // recorded row.
        let job = self.deps.store.job(job_id)?;
        match job.status {
            RunStatus::Success => Ok(()),
            _ => Err(SchedError::JobRunFailed),
        }
    }

    /// Run a script node through the sandbox and capture its outcome into
    /// the job's return info.
    async fn exec_script(
        &self,
        node: &WorkflowNode,
        job_id: Uuid,
        param: Value,
    ) -> Result<(), SchedError> {
        let script = node.script.clone().unwrap_or_default();
        let outcome = self.deps.sandbox.exec_code(script, param).await;

        let (return_info, result) = match outcome {
            Ok(out) => {
                let failed = !out.error.is_empty();
                let info = ReturnInfo {
                    suc: !failed,
                    error: out.error.clone(),
                    stdout: out.stdout,
                    return_value: out.return_value,
                    samples: vec![],
                };
                let result = if failed {
                    Err(SchedError::ScriptExecutionFailed(out.error))
                } else {
                    Ok(())
                };
                (info, result)
            }
            Err(e) => (
                ReturnInfo {
                    suc: false,
                    error: e.to_string(),
                    stdout: String::new(),
                    return_value: Value::Null,
                    samples: vec![],
                },
                Err(e),
            ),
        };

        let status = match &result {
            Ok(()) => RunStatus::Success,
            Err(e) => e.terminal_status(),
        };
        if let Err(e) =
            self.deps.store.update_job_result(job_id, status, Value::Null, return_info)
        {
            tracing::warn!(job_id = %job_id, "script job update failed: {e}");
        }

        result
    }

    /// Record the node's terminal status, write sample records, and emit
    /// the per-task status event.
    pub async fn finalize(
        &self,
        task_id: Uuid,
        node: &WorkflowNode,
        job_id: Uuid,
        result: &Result<(), SchedError>,
    ) {
        let status = match result {
            Ok(()) => RunStatus::Success,
            Err(e) => e.terminal_status(),
        };
        if let Err(e) = self.deps.store.update_job_status(job_id, status) {
            tracing::warn!(job_id = %job_id, "finalize status update failed: {e}");
        }

        let job = self.deps.store.job(job_id).ok();

        if status == RunStatus::Success {
            if let Some(job) = &job {
                self.record_samples(job);
            }
        }

        let mut msg = BroadcastMessage::new(channels::job_status(task_id));
        msg.lab_id = self.lab_id;
        msg.workflow_id = *self.workflow_id.lock();
        msg.task_id = task_id;
        msg.user_id = self.user_id.clone();
        msg.data = serde_json::json!({
            "job_id": job_id,
            "node_id": node.id,
            "device_id": node.device_name.clone().unwrap_or_default(),
            "action_name": node.action_name,
            "status": status,
            "error": result.as_ref().err().map(|e| e.to_string()),
            "return_info": job.map(|j| j.return_info),
        });
        if let Err(e) = self.deps.bus.broadcast(msg).await {
            tracing::error!(task_id = %task_id, "job status broadcast failed: {e}");
        }
    }

    /// One job-sample record per sample the job reported.
    fn record_samples(&self, job: &Job) {
        if job.return_info.samples.is_empty() {
            return;
        }
        let samples: Vec<JobSample> = job
            .return_info
            .samples
            .iter()
            .map(|s| JobSample {
                job_id: job.id,
                sample_id: s.sample_id,
                storage_path: s.storage_path.clone(),
                extra: s.extra.clone(),
            })
            .collect();
        if let Err(e) = self.deps.store.create_job_samples(&samples) {
            tracing::error!(job_id = %job.id, "sample records failed: {e}");
        }
    }

    /// Wave-schedule the graph: repeatedly run every node whose dependency
    /// set is empty, collect the first error, and propagate cancellation to
    /// siblings. `cancel` scopes the whole run; each wave gets a child.
    pub async fn run_dag(
        self: Arc<Self>,
        cancel: &CancellationToken,
        task_id: Uuid,
        graph: &WorkflowGraph,
        overrides: Option<&HashMap<Uuid, Value>>,
        sample_material: &HashMap<Uuid, Uuid>,
    ) -> Result<(), SchedError> {
        let mut remaining = graph.dependencies();
        let mut results: HashMap<Uuid, Job> = HashMap::new();
        let pool = Arc::new(Semaphore::new(self.deps.node_pool_size.max(1)));

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                return Err(SchedError::Canceled);
            }

            let runnable: Vec<Uuid> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| *id)
                .collect();
            if runnable.is_empty() {
                // Unreachable after the build-time cycle check.
                return Err(SchedError::Internal("no runnable nodes left".to_owned()));
            }

            let mut wave: Vec<(WorkflowNode, Job)> = Vec::with_capacity(runnable.len());
            for node_id in &runnable {
                let node = graph
                    .node(*node_id)
                    .ok_or_else(|| SchedError::Internal(format!("unknown node {node_id}")))?;
                wave.push((
                    node.clone(),
                    Job {
                        id: Uuid::new_v4(),
                        task_id,
                        node_id: *node_id,
                        lab_id: self.lab_id,
                        status: RunStatus::Pending,
                        feedback_data: Value::Null,
                        return_info: ReturnInfo::default(),
                        updated_at_ms: crate::store::epoch_ms(),
                    },
                ));
            }
            let jobs: Vec<Job> = wave.iter().map(|(_, job)| job.clone()).collect();
            self.deps.store.create_jobs(&jobs)?;

            // Effective parameters are resolved once per wave, before any
            // sibling starts, so upstream reads are stable.
            let first_error: Arc<Mutex<Option<SchedError>>> = Arc::new(Mutex::new(None));
            let wave_cancel = cancel.child_token();
            let mut resolved: Vec<(WorkflowNode, Job, Option<Value>)> =
                Vec::with_capacity(wave.len());
            for (node, job) in wave {
                let param = overrides
                    .and_then(|o| o.get(&node.id).cloned())
                    .unwrap_or_else(|| node.param.clone());
                let outcome = if self.deps.translate_node_param {
                    rewrite_from_upstream(param, graph.parent_pairs(node.id), &results)
                } else {
                    Ok(param)
                };
                match outcome {
                    Ok(param) => resolved.push((node, job, Some(param))),
                    Err(e) => {
                        self.finalize(task_id, &node, job.id, &Err(e.clone())).await;
                        first_error.lock().get_or_insert(e);
                        wave_cancel.cancel();
                        resolved.push((node, job, None));
                    }
                }
            }

            let mut join = JoinSet::new();
            let wave_jobs: Vec<(Uuid, Uuid)> =
                resolved.iter().map(|(node, job, _)| (node.id, job.id)).collect();
            for (node, job, param) in resolved {
                let Some(param) = param else { continue };
                let runner = Arc::clone(&self);
                let pool = Arc::clone(&pool);
                let first_error = Arc::clone(&first_error);
                let wave_cancel = wave_cancel.clone();
                let sample_material = sample_material.clone();
                join.spawn(async move {
                    let Ok(_permit) = pool.acquire_owned().await else { return };

                    // A worker that observes cancellation returns canceled
                    // without further edge I/O.
                    if wave_cancel.is_cancelled() {
                        runner
                            .finalize(task_id, &node, job.id, &Err(SchedError::Canceled))
                            .await;
                        return;
                    }

                    let result = runner
                        .execute(&wave_cancel, task_id, &node, job.id, param, &sample_material)
                        .await;
                    runner.finalize(task_id, &node, job.id, &result).await;

                    if let Err(e) = result {
                        if !matches!(e, SchedError::Canceled) {
                            tracing::warn!(node = %node.id, task = %task_id, "node failed: {e}");
                        }
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                            wave_cancel.cancel();
                        }
                    }
                });
            }

            while let Some(joined) = join.join_next().await {
                if let Err(e) = joined {
                    // A panicking handler must not kill the wave loop.
                    tracing::error!(task = %task_id, "node worker panicked: {e}");
                    first_error
                        .lock()
                        .get_or_insert(SchedError::Internal(format!("node worker: {e}")));
                }
            }

            let failed = first_error.lock().take();
            if let Some(e) = failed {
                return Err(e);
            }

            // Every node of the wave completed: record results and unblock
            // the next wave.
            for (node_id, job_id) in wave_jobs {
                if let Ok(job) = self.deps.store.job(job_id) {
                    results.insert(node_id, job);
                }
                remaining.remove(&node_id);
                for deps in remaining.values_mut() {
                    deps.remove(&node_id);
                }
            }
        }

        Ok(())
    }
}
