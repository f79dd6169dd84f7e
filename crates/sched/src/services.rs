// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide service record.
//!
//! Every shared component is constructed explicitly at startup and passed
//! through constructors; teardown runs in a fixed order
//! (bus → cluster/sessions → queues → store drop with the process).

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::auth::{LabAuth, StaticLabAuth};
use crate::bus::{MemoryBus, MsgBus, RedisBus};
use crate::cluster::Cluster;
use crate::config::SchedConfig;
use crate::dispatch::Dispatcher;
use crate::queue::{JobQueue, Kv, MemoryBroker, RedisBroker};
use crate::registry::LabRegistry;
use crate::sandbox::{HttpSandbox, Sandbox, ScriptOutcome, ScriptedSandbox};
use crate::session::SessionDeps;
use crate::store::{MaterialStore, MemoryStore, SchedStore};

pub struct Services {
    pub config: SchedConfig,
    pub store: Arc<dyn SchedStore>,
    pub material: Arc<dyn MaterialStore>,
    pub kv: Arc<dyn Kv>,
    pub queue: Arc<dyn JobQueue>,
    pub bus: Arc<dyn MsgBus>,
    pub sandbox: Arc<dyn Sandbox>,
    pub auth: Arc<dyn LabAuth>,
    pub registry: LabRegistry,
    pub cluster: Arc<Cluster>,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
}

impl Services {
    /// Compose the process services from configuration. With no redis URL
    /// the in-memory substrate backs everything (single process).
    pub async fn from_config(config: SchedConfig) -> anyhow::Result<Arc<Self>> {
        let (kv, queue, bus): (Arc<dyn Kv>, Arc<dyn JobQueue>, Arc<dyn MsgBus>) =
            match config.redis_url.as_deref() {
                Some(url) => {
                    let broker = RedisBroker::connect(url).await?;
                    let bus = RedisBus::connect(url).await?;
                    (Arc::new(broker.clone()), Arc::new(broker), Arc::new(bus))
                }
                None => {
                    tracing::warn!("no redis url configured, using in-memory substrate");
                    let broker = MemoryBroker::new();
                    (
                        Arc::new(broker.clone()),
                        Arc::new(broker),
                        Arc::new(MemoryBus::new()),
                    )
                }
            };

        let store = Arc::new(MemoryStore::new());
        let sandbox: Arc<dyn Sandbox> = match config.sandbox_url.as_deref() {
            Some(url) => Arc::new(HttpSandbox::new(url)),
            None => Arc::new(ScriptedSandbox::new(|_, _| {
                Ok(ScriptOutcome {
                    stdout: String::new(),
                    error: "no sandbox configured".to_owned(),
                    return_value: serde_json::Value::Null,
                })
            })),
        };
        let auth: Arc<dyn LabAuth> = match config.auth_file.as_deref() {
            Some(path) => Arc::new(StaticLabAuth::from_file(path)?),
            None => Arc::new(StaticLabAuth::new()),
        };

        Ok(Self::compose(config, store.clone(), store, kv, queue, bus, sandbox, auth))
    }

    /// Assemble the record from already-built parts (tests inject their
    /// own substrate here).
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        config: SchedConfig,
        store: Arc<dyn SchedStore>,
        material: Arc<dyn MaterialStore>,
        kv: Arc<dyn Kv>,
        queue: Arc<dyn JobQueue>,
        bus: Arc<dyn MsgBus>,
        sandbox: Arc<dyn Sandbox>,
        auth: Arc<dyn LabAuth>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let registry = LabRegistry::new(Arc::clone(&kv), config.heartbeat_period());

        let session_deps = SessionDeps {
            store: Arc::clone(&store),
            material: Arc::clone(&material),
            kv: Arc::clone(&kv),
            queue: Arc::clone(&queue),
            bus: Arc::clone(&bus),
            sandbox: Arc::clone(&sandbox),
            registry: registry.clone(),
            translate_node_param: config.translate_node_param,
            node_pool_size: config.node_pool_size,
            run_permits: Arc::new(Semaphore::new(config.session_pool_size.max(1))),
        };
        let cluster = Cluster::new(session_deps, shutdown.clone());
        let dispatcher =
            Dispatcher::new(Arc::clone(&queue), Arc::clone(&kv), Arc::clone(&bus), registry.clone());

        Arc::new(Self {
            config,
            store,
            material,
            kv,
            queue,
            bus,
            sandbox,
            auth,
            registry,
            cluster,
            dispatcher,
            shutdown,
        })
    }

    /// Teardown in dependency order; idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.bus.close().await {
            tracing::error!("bus close failed: {e}");
        }
        self.cluster.close().await;
    }
}
