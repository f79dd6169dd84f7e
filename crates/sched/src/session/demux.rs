// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound frame demultiplexing.
//!
//! Each frame carries an `action` discriminator; unknown actions are logged
//! and dropped, never fatal to the session. Replies and task routing happen
//! here; the connection owner only feeds raw text in.

use std::time::Duration;

use serde_json::Value;

use crate::bus::{channels, BroadcastMessage};
use crate::proto::{
    DeviceStatusData, EdgeAction, EdgeReadyData, JobStatusData, RawEdgeFrame, ReportActionData,
};
use crate::status::ActionKey;

use super::EdgeSession;

impl EdgeSession {
    /// Route one inbound frame.
    pub async fn handle_frame(&self, text: &str) {
        let frame: RawEdgeFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(lab = %self.lab.lab_id, "undecodable edge frame: {e}");
                return;
            }
        };

        match frame.action {
            EdgeAction::JobStatus => self.on_job_status(frame.data),
            EdgeAction::DeviceStatus => self.on_device_status(frame.data).await,
            EdgeAction::Ping => self.on_ping(frame.data).await,
            EdgeAction::ReportActionState => self.on_report_action_state(frame.data),
            EdgeAction::HostNodeReady => self.on_edge_ready(frame.data),
            EdgeAction::NormalExit => {
                tracing::info!(lab = %self.lab.lab_id, "edge requested normal exit");
                self.scope().cancel();
            }
            other => {
                tracing::error!(lab = %self.lab.lab_id, ?other, "unknown edge action dropped");
            }
        }
    }

    /// Forward a job state change to whichever active task it belongs to.
    fn on_job_status(&self, data: Value) {
        let data: JobStatusData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(lab = %self.lab.lab_id, "bad job_status frame: {e}");
                return;
            }
        };

        if let Some(action) = self.action_slot() {
            if action.task_id() == data.task_id {
                action.on_job_update(&data);
            }
        }
        if let Some(job) = self.job_slot() {
            if job.task_id() == data.task_id {
                job.on_job_update(&data);
            }
        }
    }

    /// Persist the device property and fan the change out to UI
    /// subscribers.
    async fn on_device_status(&self, data: Value) {
        let data: DeviceStatusData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(lab = %self.lab.lab_id, "bad device_status frame: {e}");
                return;
            }
        };
        if data.device_id.is_empty() {
            tracing::error!(lab = %self.lab.lab_id, "device_status without device id");
            return;
        }

        let nodes = match self.session_deps().material.update_device_property(
            self.lab.lab_id,
            &data.device_id,
            &data.data.property_name,
            data.data.status.clone(),
        ) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(lab = %self.lab.lab_id, device = %data.device_id, "material update failed: {e}");
                return;
            }
        };

        let mut msg = BroadcastMessage::new(channels::MATERIAL_MODIFY);
        msg.lab_id = self.lab.lab_id;
        msg.user_id = self.lab.user_id.clone();
        msg.data = serde_json::json!({
            "action": "update_node_data",
            "data": nodes
                .iter()
                .map(|n| serde_json::json!({"id": n.id, "data": n.data}))
                .collect::<Vec<_>>(),
        });
        if let Err(e) = self.session_deps().bus.broadcast(msg).await {
            tracing::error!(lab = %self.lab.lab_id, "material broadcast failed: {e}");
        }

        let mut raw = BroadcastMessage::new(channels::device_status(self.lab.lab_id));
        raw.lab_id = self.lab.lab_id;
        raw.data = serde_json::json!({
            "device_id": data.device_id,
            "property_name": data.data.property_name,
            "status": data.data.status,
        });
        if let Err(e) = self.session_deps().bus.broadcast(raw).await {
            tracing::error!(lab = %self.lab.lab_id, "device status broadcast failed: {e}");
        }
    }

    /// Echo the ping payload back with the server clock stamped in.
    async fn on_ping(&self, data: Value) {
        let mut data = data;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        if let Value::Object(ref mut map) = data {
            map.insert("server_timestamp".to_owned(), serde_json::json!(now));
        } else {
            data = serde_json::json!({ "server_timestamp": now });
        }
        if let Err(e) = self.writer().send(EdgeAction::Pong, &data).await {
            tracing::error!(lab = %self.lab.lab_id, "pong send failed: {e}");
        }
    }

    /// Resolve a pending query/callback wait on the matching task.
    fn on_report_action_state(&self, data: Value) {
        let data: ReportActionData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(lab = %self.lab.lab_id, "bad report_action_state frame: {e}");
                return;
            }
        };
        if data.task_id.is_nil()
            || data.job_id.is_nil()
            || data.device_id.is_empty()
            || data.action_name.is_empty()
        {
            tracing::warn!(lab = %self.lab.lab_id, "incomplete report_action_state dropped");
            return;
        }

        let key = ActionKey {
            kind: data.kind,
            task_id: data.task_id,
            job_id: data.job_id,
            device_id: data.device_id.clone(),
            action_name: data.action_name.clone(),
        };
        let need_more = Duration::from_secs_f64(data.need_more_seconds.max(0.0));

        if let Some(action) = self.action_slot() {
            if action.task_id() == data.task_id {
                action.set_action_status(key.clone(), data.free, need_more);
            }
        }
        if let Some(job) = self.job_slot() {
            if job.task_id() == data.task_id {
                job.set_action_status(key, data.free, need_more);
            }
        }
    }

    fn on_edge_ready(&self, data: Value) {
        let ready: EdgeReadyData = serde_json::from_value(data).unwrap_or(EdgeReadyData {
            status: String::new(),
            timestamp: 0.0,
        });
        tracing::info!(
            lab = %self.lab.lab_id,
            status = %ready.status,
            timestamp = ready.timestamp,
            "edge reported ready"
        );
        self.start_consumers();
    }
}
