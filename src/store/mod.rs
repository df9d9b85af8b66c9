//! Lease and checkpoint storage
//!
//! Each application keeps one lease table per stream (see
//! [`consumer_lease_name`](crate::config::consumer_lease_name)). A lease row
//! records which worker owns a shard and how far that shard has been
//! durably processed.

use crate::error::CheckpointError;
use async_trait::async_trait;
use std::fmt;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;
mod resetter;

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use resetter::CheckpointResetter;

const TRIM_HORIZON: &str = "TRIM_HORIZON";
const LATEST: &str = "LATEST";
const SHARD_END: &str = "SHARD_END";

/// Position within a shard, including the sentinel positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedSequenceNumber {
    /// Before the oldest retained record
    TrimHorizon,
    /// After the newest record at the time the shard is opened
    Latest,
    /// The shard is closed and fully processed
    ShardEnd,
    At {
        sequence_number: String,
        sub_sequence_number: u64,
    },
}

impl ExtendedSequenceNumber {
    pub fn at(sequence_number: impl Into<String>) -> Self {
        ExtendedSequenceNumber::At {
            sequence_number: sequence_number.into(),
            sub_sequence_number: 0,
        }
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, ExtendedSequenceNumber::ShardEnd)
    }

    /// Splits into the `(checkpoint, subSequenceNumber)` pair stored in lease rows
    pub fn to_parts(&self) -> (String, u64) {
        match self {
            ExtendedSequenceNumber::TrimHorizon => (TRIM_HORIZON.to_string(), 0),
            ExtendedSequenceNumber::Latest => (LATEST.to_string(), 0),
            ExtendedSequenceNumber::ShardEnd => (SHARD_END.to_string(), 0),
            ExtendedSequenceNumber::At {
                sequence_number,
                sub_sequence_number,
            } => (sequence_number.clone(), *sub_sequence_number),
        }
    }

    pub fn from_parts(checkpoint: &str, sub_sequence_number: u64) -> Self {
        match checkpoint {
            TRIM_HORIZON => ExtendedSequenceNumber::TrimHorizon,
            LATEST => ExtendedSequenceNumber::Latest,
            SHARD_END => ExtendedSequenceNumber::ShardEnd,
            sequence => ExtendedSequenceNumber::At {
                sequence_number: sequence.to_string(),
                sub_sequence_number,
            },
        }
    }
}

impl fmt::Display for ExtendedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (checkpoint, sub) = self.to_parts();
        if sub == 0 {
            write!(f, "{}", checkpoint)
        } else {
            write!(f, "{}/{}", checkpoint, sub)
        }
    }
}

/// One row of a lease table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub shard_id: String,
    pub owner: Option<String>,
    /// Bumped on every take and renewal
    pub counter: u64,
    /// `None` until the first checkpoint; the initial position applies
    pub checkpoint: Option<ExtendedSequenceNumber>,
    pub last_renewal_millis: i64,
}

impl Lease {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            owner: None,
            counter: 0,
            checkpoint: None,
            last_renewal_millis: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.checkpoint
            .as_ref()
            .map(ExtendedSequenceNumber::is_shard_end)
            .unwrap_or(false)
    }

    /// Whether `worker` may take this lease at `now_millis`
    pub fn is_available_to(&self, worker: &str, now_millis: i64, failover_millis: i64) -> bool {
        match self.owner.as_deref() {
            None => true,
            Some(owner) if owner == worker => true,
            Some(_) => now_millis - self.last_renewal_millis > failover_millis,
        }
    }
}

/// Storage for leases and their checkpoints
///
/// Ownership-conditional writes are the only coordination between workers;
/// the core performs no locking of its own.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Creates the lease table if the backend needs one
    async fn prepare(&self, _lease_table: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Every lease in the table; a missing table has no leases
    async fn list_leases(&self, lease_table: &str) -> anyhow::Result<Vec<Lease>>;

    async fn get_lease(&self, lease_table: &str, shard_id: &str) -> anyhow::Result<Option<Lease>>;

    /// Takes (creating if needed) the lease for `owner`; `false` if held by a live worker
    async fn take_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool>;

    /// Extends the lease; `false` if `owner` no longer holds it
    async fn renew_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool>;

    /// Gives the lease up so another worker can take it immediately
    async fn release_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<()>;

    /// Persists a checkpoint, only while `owner` holds the lease
    async fn update_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        owner: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> Result<(), CheckpointError>;

    /// Overwrites a checkpoint regardless of the current owner
    async fn reset_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> anyhow::Result<()>;
}
