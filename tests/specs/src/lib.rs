// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scheduling scenarios.
//!
//! Runs the real server router in-process on the in-memory substrate and
//! connects fake lab edges over WebSocket, so the full path (handshake,
//! heartbeat, queue consumers, engines, broadcast bus) is exercised
//! without redis or a device park.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use labsched::auth::{LabIdentity, StaticLabAuth};
use labsched::bus::MemoryBus;
use labsched::config::SchedConfig;
use labsched::queue::MemoryBroker;
use labsched::sandbox::{ScriptOutcome, Sandbox, ScriptedSandbox};
use labsched::services::Services;
use labsched::store::MemoryStore;

/// A scheduling server running in-process on an ephemeral port.
pub struct SpecServer {
    pub services: Arc<Services>,
    pub store: Arc<MemoryStore>,
    pub bus: MemoryBus,
    pub broker: MemoryBroker,
    pub auth: Arc<StaticLabAuth>,
    pub addr: SocketAddr,
}

fn spec_config() -> SchedConfig {
    SchedConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        redis_url: None,
        sandbox_url: None,
        auth_file: None,
        service_name: "lab-sched-specs".to_owned(),
        platform: String::new(),
        env_name: "test".to_owned(),
        heartbeat_secs: 1,
        node_pool_size: 5,
        session_pool_size: 16,
        translate_node_param: true,
    }
}

impl SpecServer {
    /// Start with a sandbox that echoes its inputs as the return value.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with_sandbox(Arc::new(ScriptedSandbox::new(|_, inputs| {
            Ok(ScriptOutcome {
                stdout: String::new(),
                error: String::new(),
                return_value: inputs.clone(),
            })
        })))
        .await
    }

    pub async fn start_with_sandbox(sandbox: Arc<dyn Sandbox>) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let broker = MemoryBroker::new();
        let auth = Arc::new(StaticLabAuth::new());

        let services = Services::compose(
            spec_config(),
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            Arc::new(bus.clone()),
            sandbox,
            Arc::clone(&auth) as _,
        );

        let router = labsched::http::build_router(Arc::clone(&services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self { services, store, bus, broker, auth, addr })
    }

    /// Register lab credentials and return the lab id.
    pub fn add_lab(&self, access_key: &str, access_secret: &str) -> Uuid {
        let lab_id = Uuid::new_v4();
        self.auth.insert(
            access_key,
            access_secret,
            LabIdentity {
                lab_id,
                user_id: "lab-owner".to_owned(),
                name: "spec-lab".to_owned(),
            },
        );
        lab_id
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws/schedule", self.addr)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// A fake lab edge speaking the real WebSocket protocol.
pub struct FakeEdge {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub action: String,
    pub data: Value,
}

impl FakeEdge {
    pub async fn connect(
        server: &SpecServer,
        access_key: &str,
        access_secret: &str,
        edge_token: &str,
    ) -> anyhow::Result<Self> {
        let mut request = server.ws_url().into_client_request()?;
        request.headers_mut().insert("access-key", HeaderValue::from_str(access_key)?);
        request.headers_mut().insert("access-secret", HeaderValue::from_str(access_secret)?);
        request.headers_mut().insert("edgesession", HeaderValue::from_str(edge_token)?);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, action: &str, data: Value) -> anyhow::Result<()> {
        let frame = json!({ "action": action, "data": data });
        self.ws.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Tell the server this edge finished initializing; the session starts
    /// its queue consumers.
    pub async fn send_ready(&mut self) -> anyhow::Result<()> {
        self.send("host_node_ready", json!({"status": "ok", "timestamp": 0.0})).await
    }

    /// Next text frame, or an error when the timeout lapses or the
    /// connection closes. Close frames surface as the `"close"` action with
    /// the reason in `data`.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Frame> {
        loop {
            let msg = tokio::time::timeout(timeout, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("no frame within {timeout:?}"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            match msg {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str())?;
                    return Ok(Frame {
                        action: value["action"].as_str().unwrap_or_default().to_owned(),
                        data: value["data"].clone(),
                    });
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Ok(Frame { action: "close".to_owned(), data: json!(reason) });
                }
                _ => continue,
            }
        }
    }

    /// Reply to a `query_action_state` with a free report.
    pub async fn report_query_free(&mut self, query: &Value) -> anyhow::Result<()> {
        self.send(
            "report_action_state",
            json!({
                "type": "query_action_status",
                "task_id": query["task_id"],
                "job_id": query["job_id"],
                "device_id": query["device_id"],
                "action_name": query["action_name"],
                "free": true,
                "need_more_seconds": 0.0,
            }),
        )
        .await
    }

    /// Report a terminal job status for a received `job_start`.
    pub async fn report_job_done(
        &mut self,
        start: &Value,
        status: &str,
        return_value: Value,
    ) -> anyhow::Result<()> {
        self.send(
            "job_status",
            json!({
                "job_id": start["job_id"],
                "task_id": start["task_id"],
                "device_id": start["device_id"],
                "action_name": start["action"],
                "status": status,
                "feedback_data": null,
                "return_info": {
                    "suc": status == "success",
                    "error": "",
                    "return_value": return_value,
                    "samples": [],
                },
            }),
        )
        .await
    }
}
