use crate::broker::KinesisBroker;
use crate::config::{Configuration, InitialPosition};
use crate::event::{Event, JsonEventDecoder};
use crate::store::{CheckpointStore, ExtendedSequenceNumber, InMemoryCheckpointStore};
use crate::test::mocks::{MockKinesisClient, RecordingCallback};
use crate::test::TestUtils;
use std::sync::Arc;
use std::time::Duration;

pub const STREAM: &str = "gerrit";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn create_test_config() -> Configuration {
    let mut config = TestUtils::test_config();
    config.initial_position = InitialPosition::TrimHorizon;
    config.send_async = false;
    config
}

/// One in-memory stream and lease table shared by every broker built from it
pub struct TestContext {
    pub config: Configuration,
    pub client: Arc<MockKinesisClient>,
    pub store: InMemoryCheckpointStore,
}

impl TestContext {
    pub fn new(shards: &[&str]) -> Self {
        TestUtils::init_logging();
        Self {
            config: create_test_config(),
            client: Arc::new(MockKinesisClient::with_shards(shards)),
            store: InMemoryCheckpointStore::new(),
        }
    }

    pub fn broker(&self) -> KinesisBroker {
        KinesisBroker::from_client(
            self.client.clone(),
            Arc::new(self.store.clone()),
            Arc::new(JsonEventDecoder::new()),
            self.config.clone(),
        )
    }

    pub fn lease_table(&self) -> String {
        self.config.lease_table(STREAM)
    }

    /// Publishes events numbered `range` through `broker`, waiting for each
    pub async fn publish(&self, broker: &KinesisBroker, range: std::ops::Range<i64>) -> anyhow::Result<()> {
        for seq in range {
            let event = Event::new("ref-updated", "instance-a").with_field("seq", seq);
            anyhow::ensure!(broker.send(STREAM, &event).await.await?, "event {} not stored", seq);
        }
        Ok(())
    }

    pub async fn checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<ExtendedSequenceNumber>> {
        Ok(self
            .store
            .get_lease(&self.lease_table(), shard_id)
            .await?
            .and_then(|lease| lease.checkpoint))
    }
}

pub fn seqs(recorder: &RecordingCallback) -> Vec<i64> {
    recorder
        .events()
        .iter()
        .filter_map(|e| e.body.get("seq").and_then(|v| v.as_i64()))
        .collect()
}
