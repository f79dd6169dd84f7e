// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session queue consumers.
//!
//! Two blocking-pop loops run once the edge is ready: the jobs consumer
//! (`lab:task:{lab}`) starts workflow/notebook engines, the control
//! consumer (`lab:control:{lab}`) starts one-shot actions, stops jobs, and
//! relays material commands. Exactly one job and one action may be in
//! flight per session; both consumers process envelopes sequentially, so
//! the slots never race.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{channels, BroadcastMessage, BusHandler};
use crate::engine::{ActionEngine, JobTask, NotebookEngine, WorkflowEngine};
use crate::error::SchedError;
use crate::proto::{
    ApiAction, ApiEnvelope, StartActionData, StartNotebookData, StartWorkflowData, StopJobData,
};
use crate::queue::keys;

use super::EdgeSession;

const POP_TIMEOUT: Duration = Duration::from_secs(10);
const POP_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq)]
enum QueueKind {
    Jobs,
    Control,
}

pub(super) fn spawn_consumers(session: &Arc<EdgeSession>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(consume(Arc::clone(session), QueueKind::Jobs)),
        tokio::spawn(consume(Arc::clone(session), QueueKind::Control)),
    ]
}

async fn consume(session: Arc<EdgeSession>, kind: QueueKind) {
    let queue_key = match kind {
        QueueKind::Jobs => keys::task_queue(session.lab.lab_id),
        QueueKind::Control => keys::control_queue(session.lab.lab_id),
    };
    let cancel = session.scope();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            popped = session.session_deps().queue.pop(queue_key.clone(), POP_TIMEOUT) => {
                match popped {
                    // Nothing to read within the pop timeout.
                    Ok(None) => continue,
                    Ok(Some(payload)) => match kind {
                        QueueKind::Jobs => handle_job_envelope(&session, payload).await,
                        QueueKind::Control => handle_control_envelope(&session, payload).await,
                    },
                    Err(e) => {
                        tracing::warn!(queue = %queue_key, "queue pop failed: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(POP_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }
    tracing::debug!(queue = %queue_key, "consumer exited");
}

// -- Jobs queue ---------------------------------------------------------------

async fn handle_job_envelope(session: &Arc<EdgeSession>, payload: String) {
    let envelope: ApiEnvelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(lab = %session.lab.lab_id, "bad job envelope: {e}");
            return;
        }
    };

    match envelope.action {
        ApiAction::StartWorkflow => match serde_json::from_value(envelope.data) {
            Ok(data) => run_workflow(session, data).await,
            Err(e) => tracing::error!(lab = %session.lab.lab_id, "bad start_workflow data: {e}"),
        },
        ApiAction::StartNotebook => match serde_json::from_value(envelope.data) {
            Ok(data) => run_notebook(session, data).await,
            Err(e) => tracing::error!(lab = %session.lab.lab_id, "bad start_notebook data: {e}"),
        },
        other => {
            tracing::error!(lab = %session.lab.lab_id, ?other, "unknown job envelope action");
        }
    }
}

async fn run_workflow(session: &Arc<EdgeSession>, data: StartWorkflowData) {
    let Ok(permit) =
        Arc::clone(&session.session_deps().run_permits).acquire_owned().await
    else {
        return;
    };

    let task_id = data.task_id;
    let engine = WorkflowEngine::new(
        session.engine_deps(),
        session.lab.lab_id,
        data,
        &session.scope(),
    );
    session.set_job_slot(Some(JobTask::Workflow(Arc::clone(&engine))));
    let stop_channel = register_stop_channel(session, task_id).await;

    // The engine runs in its own task so a panic cannot take the consumer
    // down or leave the slot occupied.
    let run = tokio::spawn(async move { engine.run().await });
    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if !matches!(e, SchedError::Canceled) {
                tracing::error!(task = %task_id, "workflow task failed: {e}");
            }
        }
        Err(e) => tracing::error!(task = %task_id, "workflow engine panicked: {e}"),
    }

    if let Some(channel) = stop_channel {
        let _ = session.session_deps().bus.unregister(channel).await;
    }
    session.set_job_slot(None);
    drop(permit);
}

async fn run_notebook(session: &Arc<EdgeSession>, data: StartNotebookData) {
    let Ok(permit) =
        Arc::clone(&session.session_deps().run_permits).acquire_owned().await
    else {
        return;
    };

    let task_id = data.task_id;
    let notebook_id = data.notebook_id;
    let engine = NotebookEngine::new(
        session.engine_deps(),
        session.lab.lab_id,
        data,
        &session.scope(),
    );
    session.set_job_slot(Some(JobTask::Notebook(Arc::clone(&engine))));
    let stop_channel = register_stop_channel(session, task_id).await;

    let run = tokio::spawn(async move { engine.run().await });
    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if !matches!(e, SchedError::Canceled) {
                tracing::error!(notebook = %notebook_id, "notebook task failed: {e}");
            }
        }
        Err(e) => tracing::error!(notebook = %notebook_id, "notebook engine panicked: {e}"),
    }

    if let Some(channel) = stop_channel {
        let _ = session.session_deps().bus.unregister(channel).await;
    }
    session.set_job_slot(None);
    drop(permit);
}

/// Subscribe to the task's stop fan-out channel for the duration of the
/// run; whichever process holds the edge sees the stop.
async fn register_stop_channel(session: &Arc<EdgeSession>, task_id: Uuid) -> Option<String> {
    let channel = channels::job_stop(task_id);
    let weak = Arc::downgrade(session);
    let handler: BusHandler = Arc::new(move |payload: String| {
        let weak = weak.clone();
        async move {
            let Some(session) = weak.upgrade() else { return Ok(()) };
            let msg: BroadcastMessage = serde_json::from_str(&payload)
                .map_err(|e| SchedError::Internal(format!("stop payload: {e}")))?;
            let data: StopJobData = serde_json::from_value(msg.data)
                .map_err(|e| SchedError::Internal(format!("stop data: {e}")))?;
            session.stop_job_task(data.task_id).await;
            Ok(())
        }
        .boxed()
    });

    match session.session_deps().bus.register(channel.clone(), handler).await {
        Ok(()) => Some(channel),
        Err(e) => {
            tracing::warn!(task = %task_id, "stop channel registration failed: {e}");
            None
        }
    }
}

// -- Control queue ------------------------------------------------------------

async fn handle_control_envelope(session: &Arc<EdgeSession>, payload: String) {
    let envelope: ApiEnvelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(lab = %session.lab.lab_id, "bad control envelope: {e}");
            return;
        }
    };

    match envelope.action {
        ApiAction::StartAction => match serde_json::from_value(envelope.data) {
            Ok(data) => run_action(session, data).await,
            Err(e) => tracing::error!(lab = %session.lab.lab_id, "bad start_action data: {e}"),
        },
        ApiAction::StopJob => match serde_json::from_value::<StopJobData>(envelope.data) {
            Ok(data) => session.stop_job_task(data.task_id).await,
            Err(e) => tracing::error!(lab = %session.lab.lab_id, "bad stop_job data: {e}"),
        },
        ApiAction::AddMaterial | ApiAction::UpdateMaterial | ApiAction::RemoveMaterial => {
            relay_material(session, envelope).await;
        }
        other => {
            tracing::error!(lab = %session.lab.lab_id, ?other, "unknown control envelope action");
        }
    }
}

async fn run_action(session: &Arc<EdgeSession>, data: StartActionData) {
    let Ok(permit) =
        Arc::clone(&session.session_deps().run_permits).acquire_owned().await
    else {
        return;
    };

    let task_id = data.task_id;
    let engine = ActionEngine::new(
        session.engine_deps(),
        session.lab.lab_id,
        task_id,
        &session.scope(),
    );
    session.set_action_slot(Some(Arc::clone(&engine)));

    let run = tokio::spawn(async move { engine.run().await });
    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if !matches!(e, SchedError::Canceled | SchedError::JobRunFailed) {
                tracing::error!(task = %task_id, "action task failed: {e}");
            }
        }
        Err(e) => tracing::error!(task = %task_id, "action engine panicked: {e}"),
    }

    session.set_action_slot(None);
    drop(permit);
}

/// Wrap the command with the session token and forward it verbatim.
async fn relay_material(session: &Arc<EdgeSession>, envelope: ApiEnvelope) {
    let frame = serde_json::json!({
        "action": envelope.action,
        "data": envelope.data,
        "edge_session": session.edge_token,
    });
    let payload = match serde_json::to_string(&frame) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(lab = %session.lab.lab_id, "material frame encode failed: {e}");
            return;
        }
    };
    if let Err(e) = session.writer().send_raw(payload).await {
        tracing::error!(lab = %session.lab.lab_id, "material relay failed: {e}");
    }
}
