use crate::config::consumer_lease_name;
use crate::error::{BrokerError, Result};
use crate::store::{CheckpointStore, ExtendedSequenceNumber};
use std::sync::Arc;
use tracing::{info, instrument};

/// Rewinds every shard checkpoint of a consumer group to the oldest retained record
///
/// A reset only affects schedulers started afterwards; a running scheduler
/// keeps its in-memory positions until it is stopped.
#[derive(Clone)]
pub struct CheckpointResetter {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointResetter {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Returns how many shard checkpoints were rewound
    #[instrument(skip(self))]
    pub async fn reset_all_shards_to_beginning(
        &self,
        application_name: &str,
        stream_name: &str,
    ) -> Result<usize> {
        let lease_table = consumer_lease_name(application_name, stream_name);

        let leases = self
            .store
            .list_leases(&lease_table)
            .await
            .map_err(BrokerError::CheckpointStore)?;

        for lease in &leases {
            self.store
                .reset_checkpoint(&lease_table, &lease.shard_id, &ExtendedSequenceNumber::TrimHorizon)
                .await
                .map_err(BrokerError::CheckpointStore)?;
        }

        info!(
            lease_table = %lease_table,
            shards = leases.len(),
            "Reset all shard checkpoints to the beginning of the stream"
        );
        Ok(leases.len())
    }
}
