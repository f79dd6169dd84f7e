// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-process session owner.
//!
//! Accepts edge WebSocket connections, enforces per-lab exclusivity
//! through the registry, replaces an in-process predecessor synchronously,
//! and pumps the socket in both directions for the session's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::LabIdentity;
use crate::session::{EdgeSession, SessionDeps};

pub struct Cluster {
    deps: SessionDeps,
    sessions: tokio::sync::Mutex<HashMap<Uuid, Arc<EdgeSession>>>,
    shutdown: CancellationToken,
}

impl Cluster {
    pub fn new(deps: SessionDeps, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self { deps, sessions: tokio::sync::Mutex::new(HashMap::new()), shutdown })
    }

    /// Serve one edge connection to completion.
    pub async fn handle_edge(
        self: Arc<Self>,
        socket: WebSocket,
        identity: LabIdentity,
        edge_token: String,
    ) {
        // Cluster-wide exclusivity: a live heartbeat with a foreign token
        // refuses the connection before any session state exists.
        if let Err(e) = self.deps.registry.acquire(identity.lab_id, &edge_token).await {
            tracing::warn!(lab = %identity.lab_id, "edge refused: {e}");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: Utf8Bytes::from_static("lab-already-connected"),
                })))
                .await;
            return;
        }

        let lab_id = identity.lab_id;
        let (session, mut writer_rx) =
            EdgeSession::new(self.deps.clone(), identity, edge_token, &self.shutdown);

        // In-process replacement: the old session is closed before the new
        // one serves traffic. The cross-process case never reaches here.
        let predecessor = self.sessions.lock().await.insert(lab_id, Arc::clone(&session));
        if let Some(old) = predecessor {
            tracing::info!(lab = %lab_id, "superseding existing edge session");
            old.close().await;
        }

        tracing::info!(lab = %lab_id, "edge connected");

        let (mut ws_tx, mut ws_rx) = socket.split();

        // Outbound pump: the single writer serializes every engine's sends.
        let write_cancel = session.scope();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    payload = writer_rx.recv() => {
                        let Some(payload) = payload else { break };
                        if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        // Inbound pump: the single demux path per session.
        let cancel = session.scope();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => session.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(lab = %lab_id, "edge read error: {e}");
                        break;
                    }
                }
            }
        }

        // Only remove our own entry; a replacement may already own the slot.
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(&lab_id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                sessions.remove(&lab_id);
            }
        }
        session.close().await;
        let _ = writer_task.await;
        tracing::info!(lab = %lab_id, "edge disconnected");
    }

    /// The live session for a lab, if this process owns one.
    pub async fn session(&self, lab_id: Uuid) -> Option<Arc<EdgeSession>> {
        self.sessions.lock().await.get(&lab_id).cloned()
    }

    /// Reboot teardown: close every session this process owns.
    pub async fn close(&self) {
        let drained: Vec<Arc<EdgeSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
    }
}
