//! Shard lifecycle seam between the scheduling runtime and record processors
//!
//! The runtime owns one [`ShardRecordProcessor`] per leased shard and calls
//! it in this order: `initialize`, any number of `process_records`, then
//! exactly one of `lease_lost`, `shard_ended` or `shutdown_requested`.

use crate::client::StreamRecord;
use crate::error::{CheckpointError, Result};
use crate::store::ExtendedSequenceNumber;
use async_trait::async_trait;
use std::sync::Arc;

/// Persists the current shard position on behalf of a processor
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self) -> std::result::Result<(), CheckpointError>;
}

#[derive(Debug, Clone)]
pub struct InitializationInput {
    pub shard_id: String,
    /// Position the shard is being read from
    pub extended_sequence_number: ExtendedSequenceNumber,
}

pub struct ProcessRecordsInput {
    pub records: Vec<StreamRecord>,
    pub millis_behind_latest: Option<i64>,
    pub checkpointer: Arc<dyn Checkpointer>,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseLostInput;

pub struct ShardEndedInput {
    pub checkpointer: Arc<dyn Checkpointer>,
}

pub struct ShutdownRequestedInput {
    pub checkpointer: Arc<dyn Checkpointer>,
}

/// Per-shard listener driven by the scheduling runtime
#[async_trait]
pub trait ShardRecordProcessor: Send {
    async fn initialize(&mut self, input: InitializationInput);

    async fn process_records(&mut self, input: ProcessRecordsInput);

    async fn lease_lost(&mut self, input: LeaseLostInput);

    /// The shard is closed and fully read; the returned error is surfaced to
    /// the runtime, which then does not mark the shard complete
    async fn shard_ended(&mut self, input: ShardEndedInput) -> Result<()>;

    async fn shutdown_requested(&mut self, input: ShutdownRequestedInput);
}

/// Creates one processor per shard lease tenancy
pub trait ShardRecordProcessorFactory: Send + Sync {
    fn create(&self) -> Box<dyn ShardRecordProcessor>;
}
