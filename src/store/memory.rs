use crate::error::CheckpointError;
use crate::store::{CheckpointStore, ExtendedSequenceNumber, Lease};
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use crate::config::DEFAULT_LEASE_FAILOVER;

type LeaseTables = HashMap<String, HashMap<String, Lease>>;

/// In-memory lease table, shared between clones
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointStore {
    tables: Arc<RwLock<LeaseTables>>,
    failover: Duration,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_failover(DEFAULT_LEASE_FAILOVER)
    }

    pub fn with_failover(failover: Duration) -> Self {
        debug!(failover_ms = failover.as_millis() as u64, "Initializing in-memory checkpoint store");
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            failover,
        }
    }

    /// Inserts or replaces a lease row as-is
    pub async fn put_lease(&self, lease_table: &str, lease: Lease) {
        self.tables
            .write()
            .await
            .entry(lease_table.to_string())
            .or_default()
            .insert(lease.shard_id.clone(), lease);
    }

    /// Checkpoint of a shard, if any
    pub async fn checkpoint(&self, lease_table: &str, shard_id: &str) -> Option<ExtendedSequenceNumber> {
        self.tables
            .read()
            .await
            .get(lease_table)
            .and_then(|t| t.get(shard_id))
            .and_then(|l| l.checkpoint.clone())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self))]
    async fn list_leases(&self, lease_table: &str) -> anyhow::Result<Vec<Lease>> {
        let tables = self.tables.read().await;
        let mut leases: Vec<Lease> = tables
            .get(lease_table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        leases.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        trace!(count = leases.len(), "Listed leases from memory");
        Ok(leases)
    }

    async fn get_lease(&self, lease_table: &str, shard_id: &str) -> anyhow::Result<Option<Lease>> {
        Ok(self
            .tables
            .read()
            .await
            .get(lease_table)
            .and_then(|t| t.get(shard_id))
            .cloned())
    }

    #[instrument(skip(self))]
    async fn take_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut tables = self.tables.write().await;
        let lease = tables
            .entry(lease_table.to_string())
            .or_default()
            .entry(shard_id.to_string())
            .or_insert_with(|| Lease::new(shard_id));

        if !lease.is_available_to(owner, now, self.failover.as_millis() as i64) {
            trace!(current_owner = ?lease.owner, "Lease held by another worker");
            return Ok(false);
        }

        lease.owner = Some(owner.to_string());
        lease.counter += 1;
        lease.last_renewal_millis = now;
        debug!(counter = lease.counter, "Took lease");
        Ok(true)
    }

    async fn renew_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.get_mut(lease_table).and_then(|t| t.get_mut(shard_id)) {
            Some(lease) if lease.owner.as_deref() == Some(owner) => {
                lease.counter += 1;
                lease.last_renewal_millis = Utc::now().timestamp_millis();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(lease) = tables.get_mut(lease_table).and_then(|t| t.get_mut(shard_id)) {
            if lease.owner.as_deref() == Some(owner) {
                lease.owner = None;
                debug!("Released lease");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(checkpoint = %checkpoint))]
    async fn update_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        owner: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> Result<(), CheckpointError> {
        let mut tables = self.tables.write().await;
        match tables.get_mut(lease_table).and_then(|t| t.get_mut(shard_id)) {
            Some(lease) if lease.owner.as_deref() == Some(owner) => {
                lease.checkpoint = Some(checkpoint.clone());
                debug!("Checkpoint saved to memory");
                Ok(())
            }
            Some(lease) => Err(CheckpointError::InvalidState(format!(
                "lease for {} is held by {:?}, not {}",
                shard_id, lease.owner, owner
            ))),
            None => Err(CheckpointError::InvalidState(format!(
                "no lease for {} in {}",
                shard_id, lease_table
            ))),
        }
    }

    #[instrument(skip(self), fields(checkpoint = %checkpoint))]
    async fn reset_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        let lease = tables
            .get_mut(lease_table)
            .and_then(|t| t.get_mut(shard_id))
            .ok_or_else(|| anyhow::anyhow!("no lease for {} in {}", shard_id, lease_table))?;
        lease.checkpoint = Some(checkpoint.clone());
        debug!("Checkpoint overwritten in memory");
        Ok(())
    }
}
