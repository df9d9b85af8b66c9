//! Publishing events to streams

use crate::client::KinesisClientTrait;
use crate::config::Configuration;
use crate::error::PublishError;
use crate::event::Event;
use crate::retry::{RetryConfig, RetryHandle};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Resolves `true` once the record is stored by the stream
pub type PublishFuture = BoxFuture<'static, Result<bool, PublishError>>;

const PUBLISH_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const PUBLISH_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[async_trait]
pub trait ProducerGateway: Send + Sync {
    /// Sends `event` to `stream_name`
    ///
    /// In synchronous mode the returned future is already complete; in
    /// asynchronous mode the send runs in the background.
    async fn publish(&self, stream_name: &str, event: &Event) -> PublishFuture;
}

/// Publishes JSON-encoded events, keyed by their instance id
pub struct KinesisProducer<C>
where
    C: KinesisClientTrait + 'static,
{
    client: Arc<C>,
    single_request_timeout: Duration,
    publish_timeout: Duration,
    send_async: bool,
}

impl<C> KinesisProducer<C>
where
    C: KinesisClientTrait + 'static,
{
    pub fn new(client: Arc<C>, config: &Configuration) -> Self {
        Self {
            client,
            single_request_timeout: config.publish_single_request_timeout,
            publish_timeout: config.publish_timeout,
            send_async: config.send_async,
        }
    }

    pub fn is_async(&self) -> bool {
        self.send_async
    }
}

async fn send_with_retry<C>(
    client: Arc<C>,
    stream_name: String,
    partition_key: String,
    payload: Bytes,
    single_request_timeout: Duration,
    publish_timeout: Duration,
) -> Result<bool, PublishError>
where
    C: KinesisClientTrait + 'static,
{
    let retry_config = RetryConfig::unbounded(PUBLISH_INITIAL_BACKOFF, PUBLISH_MAX_BACKOFF);
    let mut retry = RetryHandle::new(retry_config.clone(), retry_config.backoff());

    let attempts = retry.retry(|| {
        let client = client.clone();
        let stream_name = stream_name.clone();
        let partition_key = partition_key.clone();
        let payload = payload.clone();
        async move {
            match tokio::time::timeout(
                single_request_timeout,
                client.put_record(&stream_name, &partition_key, payload),
            )
            .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("request timed out after {:?}", single_request_timeout)),
            }
        }
    });

    match tokio::time::timeout(publish_timeout, attempts).await {
        Ok(Ok(outcome)) => {
            debug!(
                stream = %stream_name,
                shard_id = %outcome.shard_id,
                sequence_number = %outcome.sequence_number,
                "Event published"
            );
            Ok(true)
        }
        Ok(Err(e)) => {
            error!(stream = %stream_name, error = %e, "Failed to publish event");
            Err(PublishError::SendFailed(e.to_string()))
        }
        Err(_) => {
            error!(
                stream = %stream_name,
                timeout_ms = publish_timeout.as_millis() as u64,
                "Timed out publishing event"
            );
            Err(PublishError::Timeout(publish_timeout))
        }
    }
}

#[async_trait]
impl<C> ProducerGateway for KinesisProducer<C>
where
    C: KinesisClientTrait + 'static,
{
    async fn publish(&self, stream_name: &str, event: &Event) -> PublishFuture {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(stream = %stream_name, error = %e, "Could not serialize event");
                return future::ready(Err(PublishError::Serialization(e))).boxed();
            }
        };

        let send = send_with_retry(
            self.client.clone(),
            stream_name.to_string(),
            event.partition_key().to_string(),
            payload,
            self.single_request_timeout,
            self.publish_timeout,
        );

        if self.send_async {
            let handle = tokio::spawn(send);
            async move {
                handle
                    .await
                    .map_err(|e| PublishError::SendFailed(e.to_string()))?
            }
            .boxed()
        } else {
            future::ready(send.await).boxed()
        }
    }
}
