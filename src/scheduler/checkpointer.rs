use crate::error::CheckpointError;
use crate::lifecycle::Checkpointer;
use crate::store::{CheckpointStore, ExtendedSequenceNumber};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Checkpoints the last delivered position of one leased shard
///
/// The shard worker advances the position before handing each batch to the
/// processor, so a checkpoint always covers every record delivered so far.
pub struct LeaseCheckpointer {
    store: Arc<dyn CheckpointStore>,
    lease_table: String,
    shard_id: String,
    owner: String,
    position: Mutex<Option<ExtendedSequenceNumber>>,
    closed: AtomicBool,
}

impl LeaseCheckpointer {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        lease_table: impl Into<String>,
        shard_id: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lease_table: lease_table.into(),
            shard_id: shard_id.into(),
            owner: owner.into(),
            position: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn advance_to(&self, position: ExtendedSequenceNumber) {
        *self.position.lock() = Some(position);
    }

    pub fn mark_shard_end(&self) {
        self.advance_to(ExtendedSequenceNumber::ShardEnd);
    }

    pub fn position(&self) -> Option<ExtendedSequenceNumber> {
        self.position.lock().clone()
    }

    /// Rejects every later checkpoint; called once the worker lets go of the shard
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Checkpointer for LeaseCheckpointer {
    async fn checkpoint(&self) -> Result<(), CheckpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CheckpointError::ShutdownInProgress(format!(
                "worker for {} has stopped",
                self.shard_id
            )));
        }

        let Some(position) = self.position() else {
            trace!(shard_id = %self.shard_id, "Nothing delivered yet, no checkpoint to write");
            return Ok(());
        };

        self.store
            .update_checkpoint(&self.lease_table, &self.shard_id, &self.owner, &position)
            .await
    }
}
