// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the edge session and the per-lab API queues.
//!
//! Every edge frame, in both directions, is a JSON object of at least
//! `{"action": <string>, "data": <object>}`. Queue envelopes use the same
//! shape with their own action set. Unknown actions are logged and dropped
//! by the demux, never fatal to the session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{ReturnInfo, RunStatus};

// -- Edge actions -------------------------------------------------------------

/// Action discriminator shared by both directions of the edge channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeAction {
    // server → edge
    JobStart,
    QueryActionState,
    Pong,
    CancelTask,
    AddMaterial,
    UpdateMaterial,
    RemoveMaterial,
    // edge → server
    JobStatus,
    DeviceStatus,
    Ping,
    ReportActionState,
    HostNodeReady,
    NormalExit,
    #[serde(other)]
    Unknown,
}

/// Typed edge frame for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeFrame<T> {
    pub action: EdgeAction,
    pub data: T,
}

/// First-pass decode of an inbound frame; `data` is re-parsed per action.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEdgeFrame {
    pub action: EdgeAction,
    #[serde(default)]
    pub data: Value,
}

// -- Server → edge payloads ---------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server wall clock at send time, seconds as a float.
    pub send_timestamp: f64,
}

impl ServerInfo {
    pub fn now() -> Self {
        let dur = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self { send_timestamp: dur.as_secs_f64() }
    }
}

/// Dispatch of one device action to the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartData {
    pub device_id: String,
    pub action: String,
    pub action_type: String,
    #[serde(default)]
    pub action_args: Value,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub node_id: Uuid,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub sample_material: HashMap<Uuid, Uuid>,
}

/// Asks the edge whether a device can accept an action right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryActionData {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub device_id: String,
    pub action_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskData {
    pub task_id: Uuid,
}

// -- Edge → server payloads ---------------------------------------------------

/// Job state change reported by the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusData {
    pub job_id: Uuid,
    pub task_id: Uuid,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub action_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub feedback_data: Value,
    #[serde(default)]
    pub return_info: ReturnInfo,
}

/// Which pending wait a `report_action_state` frame resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    #[serde(rename = "query_action_status")]
    Query,
    #[serde(rename = "job_call_back_status")]
    Callback,
}

/// Query/callback reply for a pending action wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportActionData {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub device_id: String,
    pub action_name: String,
    pub free: bool,
    #[serde(default)]
    pub need_more_seconds: f64,
}

/// Device property update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusData {
    pub device_id: String,
    pub data: DevicePropertyUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePropertyUpdate {
    pub property_name: String,
    #[serde(default)]
    pub status: Value,
}

/// Edge finished initializing; the session may start its queue consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeReadyData {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: f64,
}

// -- API queue envelopes ------------------------------------------------------

/// Action set of the per-lab job and control queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiAction {
    // job queue
    StartWorkflow,
    StartNotebook,
    // control queue
    StartAction,
    StopJob,
    AddMaterial,
    UpdateMaterial,
    RemoveMaterial,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub action: ApiAction,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowData {
    pub workflow_id: Uuid,
    pub user_id: String,
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartNotebookData {
    pub notebook_id: Uuid,
    pub user_id: String,
    pub task_id: Uuid,
}

/// The queue entry only names the task; the dispatcher parks the full
/// request under `workflow_action:{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartActionData {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopJobData {
    pub task_id: Uuid,
    #[serde(default)]
    pub user_id: String,
}

/// Full one-shot action request parked in the kv store by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunActionRequest {
    pub lab_id: Uuid,
    pub device_id: String,
    pub action: String,
    pub action_type: String,
    #[serde(default)]
    pub param: Value,
    pub task_id: Uuid,
}

/// Result payload published under `workflow_action:res:{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: RunStatus,
    pub job_id: Uuid,
    pub task_id: Uuid,
    #[serde(default)]
    pub return_info: ReturnInfo,
}

/// Encode a typed edge frame to its wire bytes.
pub fn encode_frame<T: Serialize>(action: EdgeAction, data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EdgeFrame { action, data })
}
