// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane dispatcher: translates an external request into an
//! enqueue on the target lab's queues (or a stop broadcast).
//!
//! Validation failures surface as invalid-argument; enqueue failures as
//! internal (callers may retry). Stream outputs are obtained by
//! subscribing to the corresponding broadcast channels.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::bus::{channels, BroadcastMessage, MsgBus};
use crate::error::SchedError;
use crate::proto::{
    ActionResult, ApiAction, ApiEnvelope, RunActionRequest, StartActionData, StartNotebookData,
    StartWorkflowData, StopJobData,
};
use crate::queue::{keys, JobQueue, Kv};
use crate::registry::LabRegistry;

/// How long a parked one-shot action payload stays loadable.
const ACTION_PAYLOAD_TTL: Duration = Duration::from_secs(24 * 3600);

/// Caller-side poll budget for one-shot action results.
const RESULT_POLL_BUDGET: Duration = Duration::from_secs(120);
const RESULT_POLL_TICK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    kv: Arc<dyn Kv>,
    bus: Arc<dyn MsgBus>,
    registry: LabRegistry,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        kv: Arc<dyn Kv>,
        bus: Arc<dyn MsgBus>,
        registry: LabRegistry,
    ) -> Self {
        Self { queue, kv, bus, registry }
    }

    async fn ensure_online(&self, lab: Uuid) -> Result<(), SchedError> {
        if !self.registry.is_online(lab).await? {
            return Err(SchedError::LabNotOnline);
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queue_key: String,
        action: ApiAction,
        data: Value,
    ) -> Result<(), SchedError> {
        let envelope = ApiEnvelope { action, data };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.queue.push(queue_key, payload).await
    }

    /// Mint a task id and enqueue a workflow start for the lab's session.
    pub async fn start_workflow(
        &self,
        lab: Uuid,
        workflow: Uuid,
        user: &str,
    ) -> Result<Uuid, SchedError> {
        if lab.is_nil() || workflow.is_nil() {
            return Err(SchedError::InvalidArgument("lab and workflow ids required".to_owned()));
        }
        self.ensure_online(lab).await?;

        let task_id = Uuid::new_v4();
        let data = serde_json::to_value(StartWorkflowData {
            workflow_id: workflow,
            user_id: user.to_owned(),
            task_id,
        })
        .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.enqueue(keys::task_queue(lab), ApiAction::StartWorkflow, data).await?;
        Ok(task_id)
    }

    /// Mint a task id and enqueue a notebook start for the lab's session.
    pub async fn start_notebook(
        &self,
        lab: Uuid,
        notebook: Uuid,
        user: &str,
    ) -> Result<Uuid, SchedError> {
        if lab.is_nil() || notebook.is_nil() {
            return Err(SchedError::InvalidArgument("lab and notebook ids required".to_owned()));
        }
        self.ensure_online(lab).await?;

        let task_id = Uuid::new_v4();
        let data = serde_json::to_value(StartNotebookData {
            notebook_id: notebook,
            user_id: user.to_owned(),
            task_id,
        })
        .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.enqueue(keys::task_queue(lab), ApiAction::StartNotebook, data).await?;
        Ok(task_id)
    }

    /// Park the full request payload and enqueue a one-shot action.
    pub async fn start_action(
        &self,
        lab: Uuid,
        device: &str,
        action: &str,
        action_type: &str,
        param: Value,
    ) -> Result<Uuid, SchedError> {
        if lab.is_nil() || device.is_empty() || action.is_empty() || action_type.is_empty() {
            return Err(SchedError::InvalidArgument(
                "lab, device, action, and action type required".to_owned(),
            ));
        }
        self.ensure_online(lab).await?;

        let task_id = Uuid::new_v4();
        let request = RunActionRequest {
            lab_id: lab,
            device_id: device.to_owned(),
            action: action.to_owned(),
            action_type: action_type.to_owned(),
            param,
            task_id,
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.kv.set_ex(keys::action(task_id), payload, ACTION_PAYLOAD_TTL).await?;

        let data = serde_json::to_value(StartActionData { task_id })
            .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.enqueue(keys::control_queue(lab), ApiAction::StartAction, data).await?;
        Ok(task_id)
    }

    /// Publish a stop so whichever process holds the edge sees it; the
    /// owning session stops only if its current job task matches.
    pub async fn stop_job(&self, task_id: Uuid, user: &str) -> Result<(), SchedError> {
        if task_id.is_nil() {
            return Err(SchedError::InvalidArgument("task id required".to_owned()));
        }
        let mut msg = BroadcastMessage::new(channels::job_stop(task_id));
        msg.task_id = task_id;
        msg.user_id = user.to_owned();
        msg.data = serde_json::to_value(StopJobData {
            task_id,
            user_id: user.to_owned(),
        })
        .map_err(|e| SchedError::Internal(e.to_string()))?;
        self.bus.broadcast(msg).await
    }

    /// Poll the one-shot action result key until a terminal value appears
    /// or the 120-second caller budget runs out.
    pub async fn poll_action_result(&self, task_id: Uuid) -> Result<ActionResult, SchedError> {
        let deadline = tokio::time::Instant::now() + RESULT_POLL_BUDGET;
        loop {
            if let Some(payload) = self.kv.get(keys::action_result(task_id)).await? {
                let result: ActionResult = serde_json::from_str(&payload)
                    .map_err(|e| SchedError::Internal(format!("action result: {e}")))?;
                if result.status.is_terminal() {
                    return Ok(result);
                }
            }
            if tokio::time::Instant::now() + RESULT_POLL_TICK > deadline {
                return Err(SchedError::Timeout);
            }
            tokio::time::sleep(RESULT_POLL_TICK).await;
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
