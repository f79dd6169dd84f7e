// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the scheduling server.
#[derive(Debug, Clone, clap::Parser)]
pub struct SchedConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "SCHED_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "SCHED_PORT")]
    pub port: u16,

    /// Redis endpoint for queues, liveness keys, and the broadcast bus.
    /// When unset the process runs on the in-memory substrate
    /// (single-process deployments and tests).
    #[arg(long, env = "SCHED_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Sandbox RPC endpoint for script nodes. Scripts fail when unset.
    #[arg(long, env = "SCHED_SANDBOX_URL")]
    pub sandbox_url: Option<String>,

    /// Path to the lab credential table (JSON array of access-key/secret
    /// entries).
    #[arg(long, env = "SCHED_AUTH_FILE")]
    pub auth_file: Option<std::path::PathBuf>,

    /// Service name stamped into logs.
    #[arg(long, default_value = "lab-sched", env = "SCHED_SERVICE_NAME")]
    pub service_name: String,

    /// Platform name stamped into logs.
    #[arg(long, default_value = "", env = "SCHED_PLATFORM")]
    pub platform: String,

    /// Deployment environment name (dev, staging, prod).
    #[arg(long, default_value = "dev", env = "SCHED_ENV")]
    pub env_name: String,

    /// Heartbeat period in seconds.
    #[arg(long, default_value_t = 5, env = "SCHED_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Bounded worker pool per engine (nodes in flight within a wave).
    #[arg(long, default_value_t = 5, env = "SCHED_NODE_POOL_SIZE")]
    pub node_pool_size: usize,

    /// Process-wide cap on concurrently running engines.
    #[arg(long, default_value_t = 200, env = "SCHED_SESSION_POOL_SIZE")]
    pub session_pool_size: usize,

    /// Rewrite node parameters from upstream return values.
    #[arg(long, default_value_t = true, env = "SCHED_TRANSLATE_NODE_PARAM")]
    pub translate_node_param: bool,
}

impl SchedConfig {
    pub fn heartbeat_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
