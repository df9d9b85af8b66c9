//! Error types for publishing and consuming events

use crate::client::KinesisClientError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

/// Main error type for broker operations
///
/// Only administrative operations (subscribe, reset, shutdown wiring) and the
/// mandatory shard-end checkpoint surface this type. Consumption failures are
/// logged where they happen and never reach the application.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to build scheduler: {0}")]
    SchedulerConstruction(String),

    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[source] anyhow::Error),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("AWS Kinesis error: {0}")]
    Kinesis(String),

    #[error("Previous scheduler for stream {0} is still running")]
    SchedulerStillRunning(String),

    #[error("Invalid processor state: {0}")]
    InvalidState(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<KinesisClientError> for BrokerError {
    fn from(err: KinesisClientError) -> Self {
        BrokerError::Kinesis(err.to_string())
    }
}

impl From<AcquireError> for BrokerError {
    fn from(err: AcquireError) -> Self {
        BrokerError::Other(err.into())
    }
}

impl From<JoinError> for BrokerError {
    fn from(err: JoinError) -> Self {
        BrokerError::Other(err.into())
    }
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Outcome of a failed checkpoint call
///
/// The first three variants are the recognised, self-healing outcomes; the
/// next natural checkpoint opportunity is the retry.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpointer is shutting down: {0}")]
    ShutdownInProgress(String),

    #[error("Checkpoint throttled: {0}")]
    Throttling(String),

    #[error("Invalid lease state: {0}")]
    InvalidState(String),

    #[error("Checkpoint store failure: {0}")]
    Store(#[source] anyhow::Error),
}

impl CheckpointError {
    /// Whether this outcome is one the checkpoint policy skips over
    pub fn is_recognized(&self) -> bool {
        !matches!(self, CheckpointError::Store(_))
    }
}

/// Failure to turn a record payload into an application event
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a JSON event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event has no type")]
    MissingType,

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Event of type {0} has no instance id")]
    MissingInstanceId(String),
}

/// Failure of a single record; never aborts the batch it belongs to
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Could not decode record: {0}")]
    Decode(#[from] DecodeError),

    #[error("Event callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("Event callback panicked: {0}")]
    CallbackPanicked(String),
}

/// Failure of a publish request
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to send record: {0}")]
    SendFailed(String),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PublishError::Timeout(_))
    }
}
