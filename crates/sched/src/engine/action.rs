// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Action engine: a single ad-hoc device action on behalf of a one-shot
//! API call.
//!
//! The request payload is parked under `workflow_action:{uuid}` by the
//! dispatcher; the result (success or synthetic failure) is always written
//! under `workflow_action:res:` so the polling caller terminates inside
//! its budget.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedError;
use crate::proto::{
    ActionResult, EdgeAction, JobStartData, JobStatusData, QueryActionData, RunActionRequest,
    ServerInfo, StatusKind,
};
use crate::queue::keys;
use crate::status::{ActionKey, StatusRegistry};
use crate::store::{ReturnInfo, RunStatus};

use super::node::poll_status;
use super::{EngineDeps, ACTION_WAIT};

/// How long a one-shot action result stays readable.
const RESULT_TTL: Duration = Duration::from_secs(3600);

pub struct ActionEngine {
    deps: EngineDeps,
    lab_id: Uuid,
    task_id: Uuid,
    status: StatusRegistry,
    cancel: CancellationToken,
    /// Final job report captured by `on_job_update`.
    result: Mutex<Option<ActionResult>>,
}

impl ActionEngine {
    pub fn new(
        deps: EngineDeps,
        lab_id: Uuid,
        task_id: Uuid,
        session_scope: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            lab_id,
            task_id,
            status: StatusRegistry::new(),
            cancel: session_scope.child_token(),
            result: Mutex::new(None),
        })
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn set_action_status(&self, key: ActionKey, free: bool, need_more: Duration) {
        self.status.set(&key, free, need_more);
    }

    /// Capture the edge's final report and release the callback wait.
    pub fn on_job_update(&self, data: &JobStatusData) {
        if !data.status.is_terminal() {
            return;
        }

        *self.result.lock() = Some(ActionResult {
            status: data.status,
            job_id: data.job_id,
            task_id: data.task_id,
            return_info: data.return_info.clone(),
        });

        self.status.set(
            &ActionKey {
                kind: StatusKind::Callback,
                task_id: data.task_id,
                job_id: data.job_id,
                device_id: data.device_id.clone(),
                action_name: data.action_name.clone(),
            },
            true,
            Duration::ZERO,
        );
    }

    /// Run the action to completion. The result key is written on every
    /// path, including failures before dispatch.
    pub async fn run(&self) -> Result<(), SchedError> {
        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            if !matches!(e, SchedError::JobRunFailed) {
                tracing::warn!(task = %self.task_id, lab = %self.lab_id, "action failed: {e}");
            }
        }
        self.publish_result().await;
        debug_assert!(self.status.is_empty());
        outcome
    }

    async fn drive(&self) -> Result<(), SchedError> {
        let request = self.load_request().await?;

        // Query phase: the action's own uuid doubles as the job id.
        let query_key = ActionKey {
            kind: StatusKind::Query,
            task_id: self.task_id,
            job_id: self.task_id,
            device_id: request.device_id.clone(),
            action_name: request.action.clone(),
        };
        self.status.init(query_key.clone(), Instant::now() + ACTION_WAIT, false);
        let query = QueryActionData {
            task_id: self.task_id,
            job_id: self.task_id,
            device_id: request.device_id.clone(),
            action_name: request.action.clone(),
        };
        if let Err(e) = self.deps.writer.send(EdgeAction::QueryActionState, &query).await {
            self.status.del(&query_key);
            return Err(e);
        }
        poll_status(&self.status, &self.cancel, &query_key).await?;

        // Dispatch and callback.
        let callback_key = ActionKey {
            kind: StatusKind::Callback,
            task_id: self.task_id,
            job_id: self.task_id,
            device_id: request.device_id.clone(),
            action_name: request.action.clone(),
        };
        self.status.init(callback_key.clone(), Instant::now() + ACTION_WAIT, false);
        let start = JobStartData {
            device_id: request.device_id.clone(),
            action: request.action.clone(),
            action_type: request.action_type.clone(),
            action_args: request.param.clone(),
            job_id: self.task_id,
            task_id: self.task_id,
            node_id: self.task_id,
            server_info: ServerInfo::now(),
            sample_material: Default::default(),
        };
        if let Err(e) = self.deps.writer.send(EdgeAction::JobStart, &start).await {
            self.status.del(&callback_key);
            return Err(e);
        }
        poll_status(&self.status, &self.cancel, &callback_key).await?;

        // The callback was released by a job_status report; interpret it.
        match self.result.lock().as_ref().map(|r| r.status) {
            Some(RunStatus::Success) => Ok(()),
            Some(_) => Err(SchedError::JobRunFailed),
            None => Err(SchedError::Timeout),
        }
    }

    async fn load_request(&self) -> Result<RunActionRequest, SchedError> {
        let payload = self
            .deps
            .kv
            .get(keys::action(self.task_id))
            .await?
            .ok_or_else(|| SchedError::NotFound(format!("action payload {}", self.task_id)))?;
        let request: RunActionRequest = serde_json::from_str(&payload)
            .map_err(|e| SchedError::InvalidArgument(format!("action payload: {e}")))?;

        if request.lab_id.is_nil()
            || request.device_id.is_empty()
            || request.action.is_empty()
            || request.action_type.is_empty()
        {
            return Err(SchedError::InvalidArgument("incomplete action request".to_owned()));
        }
        Ok(request)
    }

    /// Write the terminal result with a one-hour TTL; a synthetic failure
    /// when no report ever arrived.
    async fn publish_result(&self) {
        let result = self.result.lock().clone().unwrap_or(ActionResult {
            status: RunStatus::Failed,
            job_id: self.task_id,
            task_id: self.task_id,
            return_info: ReturnInfo::default(),
        });

        let payload = match serde_json::to_string(&result) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(task = %self.task_id, "action result encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self
            .deps
            .kv
            .set_ex(keys::action_result(self.task_id), payload, RESULT_TTL)
            .await
        {
            tracing::error!(task = %self.task_id, "action result write failed: {e}");
        }
    }
}

#[cfg(test)]
#[path = "action_tests.rs"]
mod tests;
