//! Application-facing broker: publish, subscribe, replay and disconnect

use crate::client::KinesisClientTrait;
use crate::config::Configuration;
use crate::consumer::StreamConsumer;
use crate::error::Result;
use crate::event::{Event, EventCallback, EventDecoder};
use crate::producer::{KinesisProducer, ProducerGateway, PublishFuture};
use crate::scheduler::KinesisSchedulerFactory;
use crate::store::{CheckpointResetter, CheckpointStore};
use std::sync::Arc;
use tracing::{debug, info};

pub struct KinesisBroker {
    producer: Arc<dyn ProducerGateway>,
    consumer: StreamConsumer,
    config: Configuration,
}

impl KinesisBroker {
    pub fn new(producer: Arc<dyn ProducerGateway>, consumer: StreamConsumer, config: Configuration) -> Self {
        Self {
            producer,
            consumer,
            config,
        }
    }

    /// Wires a broker around one stream client and one lease store
    pub fn from_client<C>(
        client: Arc<C>,
        store: Arc<dyn CheckpointStore>,
        decoder: Arc<dyn EventDecoder>,
        config: Configuration,
    ) -> Self
    where
        C: KinesisClientTrait + 'static,
    {
        let producer = Arc::new(KinesisProducer::new(client.clone(), &config));
        let scheduler_factory = Arc::new(KinesisSchedulerFactory::new(
            client,
            store.clone(),
            decoder,
            config.clone(),
        ));
        let consumer = StreamConsumer::new(
            scheduler_factory,
            CheckpointResetter::new(store),
            config.clone(),
        );
        Self::new(producer, consumer, config)
    }

    /// Connects to AWS with the default credential chain, using a DynamoDB lease table
    #[cfg(feature = "dynamodb-store")]
    pub async fn connect(config: Configuration) -> Result<Self> {
        use crate::client::load_sdk_config;
        use crate::event::JsonEventDecoder;
        use crate::store::DynamoDbCheckpointStore;

        config.validate()?;
        let sdk_config = load_sdk_config(&config).await;
        let kinesis = Arc::new(aws_sdk_kinesis::Client::new(&sdk_config));
        let store = Arc::new(DynamoDbCheckpointStore::from_configuration(
            aws_sdk_dynamodb::Client::new(&sdk_config),
            &config,
        ));

        info!(
            application = %config.application_name,
            region = ?sdk_config.region(),
            lease_failover_ms = config.lease_failover.as_millis() as u64,
            "Connected to Kinesis"
        );
        Ok(Self::from_client(kinesis, store, Arc::new(JsonEventDecoder::new()), config))
    }

    pub async fn send(&self, stream_name: &str, event: &Event) -> PublishFuture {
        debug!(stream = %stream_name, event_type = %event.event_type, "Sending event");
        self.producer.publish(stream_name, event).await
    }

    /// Forwards one of the host's own stream events, if enabled
    pub async fn send_stream_event(&self, event: &Event) -> Option<PublishFuture> {
        if !self.config.send_stream_events {
            return None;
        }
        Some(self.send(&self.config.stream_events_topic, event).await)
    }

    pub async fn receive_async(&self, stream_name: &str, callback: EventCallback) -> Result<()> {
        self.consumer.subscribe(stream_name, callback).await
    }

    /// Stops every subscription
    pub async fn disconnect(&self) {
        info!("Disconnecting from all streams");
        self.consumer.shutdown().await;
    }

    /// Rewinds the consumer group so the next subscription replays the whole stream
    pub async fn replay_all_events(&self, stream_name: &str) -> Result<()> {
        self.consumer.reset_offset(stream_name).await
    }

    pub async fn subscribed_streams(&self) -> Vec<String> {
        self.consumer.subscribed_streams().await
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.consumer
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }
}
