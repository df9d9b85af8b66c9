//! Per-shard record processing
//!
//! [`EventRecordProcessor`] turns each delivered record into an [`Event`],
//! hands it to the subscriber callback and checkpoints on a fixed cadence.
//!
//! - A failing record (bad payload, callback error or panic) is logged and
//!   skipped; the rest of the batch is still dispatched
//! - Checkpoints are taken after a batch once the checkpoint interval has
//!   elapsed, never inline per record
//! - Checkpoint failures are logged and left to the next opportunity, except
//!   at shard end where they are returned to the runtime

use crate::client::StreamRecord;
use crate::error::{BrokerError, CheckpointError, RecordError, Result};
use crate::event::{Event, EventCallback, EventDecoder};
use crate::lifecycle::{
    Checkpointer, InitializationInput, LeaseLostInput, ProcessRecordsInput, ShardEndedInput,
    ShardRecordProcessor, ShardRecordProcessorFactory, ShutdownRequestedInput,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Why a shard processor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    LeaseLost,
    ShardEnded,
    ShutdownRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Initializing,
    Active,
    Terminated(TerminationReason),
}

/// Result of dispatching one record
#[derive(Debug)]
pub struct RecordOutcome {
    pub sequence_number: String,
    pub result: std::result::Result<(), RecordError>,
}

impl RecordOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct EventRecordProcessor {
    callback: EventCallback,
    decoder: Arc<dyn EventDecoder>,
    checkpoint_interval: Duration,
    shard_id: String,
    next_checkpoint: Instant,
    state: ShardState,
}

impl EventRecordProcessor {
    pub fn new(
        callback: EventCallback,
        decoder: Arc<dyn EventDecoder>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            callback,
            decoder,
            checkpoint_interval,
            shard_id: String::new(),
            next_checkpoint: Instant::now() + checkpoint_interval,
            state: ShardState::Initializing,
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Decodes and delivers every record in order, collecting one outcome per record
    ///
    /// The callback runs on the blocking pool, so a slow or stuck subscriber
    /// never stalls the runtime driving shutdown and lease renewal.
    pub async fn dispatch_records(&self, records: &[StreamRecord]) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let result = self.dispatch(record).await;
            if let Err(e) = &result {
                error!(
                    shard_id = %self.shard_id,
                    sequence = %record.sequence_number,
                    partition_key = %record.partition_key,
                    payload = %String::from_utf8_lossy(&record.data),
                    error = %e,
                    "Failed to process record"
                );
            }
            outcomes.push(RecordOutcome {
                sequence_number: record.sequence_number.clone(),
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        trace!(
            shard_id = %self.shard_id,
            delivered = outcomes.len() - failed,
            failed = failed,
            "Dispatched batch"
        );
        outcomes
    }

    async fn dispatch(&self, record: &StreamRecord) -> std::result::Result<(), RecordError> {
        let event: Event = self.decoder.decode(&record.data)?;
        trace!(
            shard_id = %self.shard_id,
            sequence = %record.sequence_number,
            event_type = %event.event_type,
            "Delivering event"
        );

        let callback = self.callback.clone();
        match tokio::task::spawn_blocking(move || callback(event)).await {
            Ok(result) => result.map_err(RecordError::Callback),
            Err(e) if e.is_panic() => Err(RecordError::CallbackPanicked(panic_message(
                e.into_panic().as_ref(),
            ))),
            Err(e) => Err(RecordError::CallbackPanicked(e.to_string())),
        }
    }

    /// Checkpoints and logs the outcome; failures are left to the next opportunity
    async fn checkpoint(&self, checkpointer: &dyn Checkpointer, context: &'static str) {
        match checkpointer.checkpoint().await {
            Ok(()) => debug!(shard_id = %self.shard_id, context, "Checkpointed shard"),
            Err(CheckpointError::ShutdownInProgress(reason)) => info!(
                shard_id = %self.shard_id,
                context,
                reason = %reason,
                "Skipping checkpoint, shutdown in progress"
            ),
            Err(e @ CheckpointError::Throttling(_)) => error!(
                shard_id = %self.shard_id,
                context,
                error = %e,
                "Checkpoint throttled, skipping until next interval"
            ),
            Err(e @ CheckpointError::InvalidState(_)) => error!(
                shard_id = %self.shard_id,
                context,
                error = %e,
                "Checkpoint rejected by lease table, skipping"
            ),
            Err(e) => error!(
                shard_id = %self.shard_id,
                context,
                error = ?e,
                "Checkpoint failed, skipping"
            ),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl ShardRecordProcessor for EventRecordProcessor {
    async fn initialize(&mut self, input: InitializationInput) {
        info!(
            shard_id = %input.shard_id,
            position = %input.extended_sequence_number,
            "Initializing shard processor"
        );
        self.shard_id = input.shard_id;
        self.next_checkpoint = Instant::now() + self.checkpoint_interval;
        self.state = ShardState::Active;
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) {
        if self.state != ShardState::Active {
            error!(
                shard_id = %self.shard_id,
                state = ?self.state,
                records = input.records.len(),
                "Batch delivered to inactive processor, abandoning it"
            );
            return;
        }

        trace!(
            shard_id = %self.shard_id,
            records = input.records.len(),
            millis_behind_latest = ?input.millis_behind_latest,
            "Processing batch"
        );
        self.dispatch_records(&input.records).await;

        if Instant::now() >= self.next_checkpoint {
            self.checkpoint(input.checkpointer.as_ref(), "process_records").await;
            self.next_checkpoint = Instant::now() + self.checkpoint_interval;
        }
    }

    async fn lease_lost(&mut self, _input: LeaseLostInput) {
        warn!(shard_id = %self.shard_id, "Lease lost");
        self.state = ShardState::Terminated(TerminationReason::LeaseLost);
    }

    async fn shard_ended(&mut self, input: ShardEndedInput) -> Result<()> {
        info!(shard_id = %self.shard_id, "Reached end of shard, checkpointing");
        self.state = ShardState::Terminated(TerminationReason::ShardEnded);

        input.checkpointer.checkpoint().await.map_err(|e| {
            error!(shard_id = %self.shard_id, error = %e, "Shard end checkpoint failed");
            BrokerError::Checkpoint(e)
        })
    }

    async fn shutdown_requested(&mut self, input: ShutdownRequestedInput) {
        info!(shard_id = %self.shard_id, "Scheduler is shutting down, checkpointing");
        self.checkpoint(input.checkpointer.as_ref(), "shutdown_requested").await;
        self.state = ShardState::Terminated(TerminationReason::ShutdownRequested);
    }
}

/// Creates an [`EventRecordProcessor`] per shard, all sharing one callback
#[derive(Clone)]
pub struct EventRecordProcessorFactory {
    callback: EventCallback,
    decoder: Arc<dyn EventDecoder>,
    checkpoint_interval: Duration,
}

impl EventRecordProcessorFactory {
    pub fn new(
        callback: EventCallback,
        decoder: Arc<dyn EventDecoder>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            callback,
            decoder,
            checkpoint_interval,
        }
    }
}

impl ShardRecordProcessorFactory for EventRecordProcessorFactory {
    fn create(&self) -> Box<dyn ShardRecordProcessor> {
        Box::new(EventRecordProcessor::new(
            self.callback.clone(),
            self.decoder.clone(),
            self.checkpoint_interval,
        ))
    }
}
