//! Stream schedulers and the factory that builds them per subscription

mod checkpointer;
mod kinesis;

pub use checkpointer::LeaseCheckpointer;
pub use kinesis::KinesisScheduler;

use crate::client::KinesisClientTrait;
use crate::config::{Configuration, InitialPosition};
use crate::error::{BrokerError, Result};
use crate::event::{EventCallback, EventDecoder};
use crate::processor::EventRecordProcessorFactory;
use crate::store::CheckpointStore;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A running consumer of one stream
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Runs until a graceful shutdown has completed
    async fn run(&self);

    /// Asks the scheduler to stop; the future resolves `true` once every
    /// shard has been checkpointed and released
    fn start_graceful_shutdown(&self) -> BoxFuture<'static, bool>;
}

/// Builds one scheduler per subscription
pub trait SchedulerFactory: Send + Sync {
    /// `from_trim_horizon` overrides the configured initial position
    fn create(
        &self,
        stream_name: &str,
        from_trim_horizon: bool,
        callback: EventCallback,
    ) -> Result<Arc<dyn Scheduler>>;
}

/// Settings of a single scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub stream_name: String,
    pub lease_table: String,
    /// Identity written as lease owner
    pub worker_id: String,
    pub initial_position: InitialPosition,
    /// Read every shard from the beginning the first time it is opened
    pub ignore_checkpoints: bool,
    pub polling_interval: Duration,
    pub max_records: i32,
    pub shard_sync_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(config: &Configuration, stream_name: &str, from_trim_horizon: bool) -> Result<Self> {
        if stream_name.trim().is_empty() {
            return Err(BrokerError::Configuration("stream name must not be empty".to_string()));
        }

        let initial_position = if from_trim_horizon {
            InitialPosition::TrimHorizon
        } else {
            config.initial_position
        };

        Ok(Self {
            stream_name: stream_name.to_string(),
            lease_table: config.lease_table(stream_name),
            worker_id: format!("{}-{:08x}", config.application_name, rand::random::<u32>()),
            initial_position,
            ignore_checkpoints: from_trim_horizon,
            polling_interval: config.polling_interval,
            max_records: config.max_records,
            shard_sync_interval: config.shard_sync_interval,
        })
    }
}

/// Builds [`KinesisScheduler`]s sharing one client, lease store and decoder
pub struct KinesisSchedulerFactory<C>
where
    C: KinesisClientTrait + 'static,
{
    client: Arc<C>,
    store: Arc<dyn CheckpointStore>,
    decoder: Arc<dyn EventDecoder>,
    config: Configuration,
}

impl<C> KinesisSchedulerFactory<C>
where
    C: KinesisClientTrait + 'static,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn CheckpointStore>,
        decoder: Arc<dyn EventDecoder>,
        config: Configuration,
    ) -> Self {
        Self {
            client,
            store,
            decoder,
            config,
        }
    }
}

impl<C> SchedulerFactory for KinesisSchedulerFactory<C>
where
    C: KinesisClientTrait + 'static,
{
    fn create(
        &self,
        stream_name: &str,
        from_trim_horizon: bool,
        callback: EventCallback,
    ) -> Result<Arc<dyn Scheduler>> {
        let scheduler_config = SchedulerConfig::new(&self.config, stream_name, from_trim_horizon)?;
        debug!(
            stream = %stream_name,
            worker_id = %scheduler_config.worker_id,
            initial_position = %scheduler_config.initial_position,
            from_trim_horizon,
            "Building scheduler"
        );

        let processor_factory = EventRecordProcessorFactory::new(
            callback,
            self.decoder.clone(),
            self.config.checkpoint_interval,
        );

        Ok(Arc::new(KinesisScheduler::new(
            self.client.clone(),
            self.store.clone(),
            Arc::new(processor_factory),
            scheduler_config,
        )))
    }
}
