// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lab registry: per-lab exclusivity across server replicas.
//!
//! The liveness key `lab:heart:{lab}` holds the owning edge's session
//! token. Acquisition is create-if-absent with a long grace TTL; the owner
//! then refreshes it every heartbeat period with a tight TTL, so a broken
//! session is evicted by expiry. Peers never force-delete a foreign key.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedError;
use crate::queue::{keys, Kv};

/// Grace multiple applied to the acquisition TTL so ownership survives a
/// rolling restart between acquisition and the first refresh.
const ACQUIRE_GRACE: u32 = 100;

#[derive(Clone)]
pub struct LabRegistry {
    kv: Arc<dyn Kv>,
    period: Duration,
}

impl LabRegistry {
    pub fn new(kv: Arc<dyn Kv>, period: Duration) -> Self {
        Self { kv, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Claim the lab for `token`. A key already holding a different token
    /// means another edge is live.
    pub async fn acquire(&self, lab: Uuid, token: &str) -> Result<(), SchedError> {
        let grace = self.period * ACQUIRE_GRACE - Duration::from_secs(1);
        let created = self
            .kv
            .set_nx_ex(keys::heart(lab), token.to_owned(), grace)
            .await?;
        if created {
            return Ok(());
        }

        match self.kv.get(keys::heart(lab)).await? {
            // Refresh with the same token never changes ownership.
            Some(current) if current == token => Ok(()),
            _ => Err(SchedError::LabAlreadyConnected),
        }
    }

    /// Refresh the liveness key every period until cancelled, then delete
    /// it. Owns the key for the lifetime of one session.
    pub async fn run_heartbeat(&self, lab: Uuid, token: String, cancel: CancellationToken) {
        let ttl = self.period + Duration::from_secs(1);
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and replaces the grace TTL with
        // the tight per-tick one.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .kv
                        .set_ex(keys::heart(lab), token.clone(), ttl)
                        .await
                    {
                        tracing::error!(lab = %lab, "heartbeat refresh failed: {e}");
                    }
                }
            }
        }

        if let Err(e) = self.kv.del(keys::heart(lab)).await {
            tracing::error!(lab = %lab, "heartbeat release failed: {e}");
        }
        tracing::debug!(lab = %lab, "heartbeat released");
    }

    /// Whether any edge currently holds the lab.
    pub async fn is_online(&self, lab: Uuid) -> Result<bool, SchedError> {
        Ok(self.kv.get(keys::heart(lab)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBroker;

    fn registry(broker: &MemoryBroker) -> LabRegistry {
        LabRegistry::new(Arc::new(broker.clone()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn second_edge_with_different_token_is_refused() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let registry = registry(&broker);
        let lab = Uuid::new_v4();

        registry.acquire(lab, "edge-1").await?;
        let err = registry.acquire(lab, "edge-2").await;
        assert_eq!(err, Err(SchedError::LabAlreadyConnected));

        // The holder itself may re-acquire.
        registry.acquire(lab, "edge-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_releases() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let registry = LabRegistry::new(Arc::new(broker.clone()), Duration::from_millis(20));
        let lab = Uuid::new_v4();
        registry.acquire(lab, "edge-1").await?;

        let cancel = CancellationToken::new();
        let hb = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                registry.run_heartbeat(lab, "edge-1".to_owned(), cancel).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.is_online(lab).await?);

        cancel.cancel();
        hb.await.map_err(|e| anyhow::anyhow!(e))?;
        assert!(!registry.is_online(lab).await?, "release deletes the key");
        Ok(())
    }

    #[tokio::test]
    async fn expired_key_can_be_reacquired() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        let lab = Uuid::new_v4();
        // Simulate a dead session whose tight TTL lapsed.
        broker
            .set_ex(keys::heart(lab), "edge-dead".to_owned(), Duration::from_millis(10))
            .await?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let registry = registry(&broker);
        registry.acquire(lab, "edge-2").await?;
        Ok(())
    }
}
