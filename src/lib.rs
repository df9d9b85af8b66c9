//! Kinesis Events - publish and consume application events over AWS Kinesis
//!
//! Events are published as JSON records keyed by their source instance.
//! Subscribers get every event of a stream at least once, in per-shard order,
//! with periodic checkpoints in a lease table and an explicit operation to
//! replay a stream from the beginning.

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod logging;
pub mod processor;
pub mod producer;
pub mod retry;
pub mod scheduler;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(test)]
mod tests;

pub use broker::KinesisBroker;
pub use config::{Configuration, InitialPosition};
pub use consumer::{ResetFlag, StreamConsumer};
pub use error::{BrokerError, CheckpointError, PublishError, Result};
pub use event::{callback, Event, EventCallback, EventDecoder, JsonEventDecoder};
pub use processor::{EventRecordProcessor, EventRecordProcessorFactory};
pub use producer::{KinesisProducer, ProducerGateway, PublishFuture};
pub use retry::{Backoff, ExponentialBackoff};

// Re-export main traits
pub use crate::client::KinesisClientTrait;
pub use crate::scheduler::{Scheduler, SchedulerFactory};
pub use crate::store::CheckpointStore;

// Re-export implementations
pub use crate::scheduler::{KinesisScheduler, KinesisSchedulerFactory};
pub use crate::store::{CheckpointResetter, InMemoryCheckpointStore};

#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbCheckpointStore;
