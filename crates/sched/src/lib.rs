// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lab-sched: per-lab scheduling and dispatch core for a self-driving
//! laboratory control plane.
//!
//! Each connected lab edge gets one session that consumes the lab's job
//! and control queues and drives the device-action protocol; the broadcast
//! bus fans state changes out to UI subscribers across processes.

pub mod auth;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod http;
pub mod proto;
pub mod queue;
pub mod registry;
pub mod sandbox;
pub mod services;
pub mod session;
pub mod status;
pub mod store;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::SchedConfig;
use crate::services::Services;

/// Run the scheduling server until shutdown.
pub async fn run(config: SchedConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let services = Services::from_config(config).await?;

    let router = http::build_router(Arc::clone(&services));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        service = %services.config.service_name,
        env = %services.config.env_name,
        "lab-sched listening"
    );

    let shutdown = services.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(services.shutdown.clone().cancelled_owned())
        .await?;

    services.close().await;
    Ok(())
}
