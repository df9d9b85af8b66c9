//! Test utilities and mock implementations

pub mod mocks;

use crate::client::StreamRecord;
use crate::config::{Configuration, InitialPosition};
use crate::event::Event;
use bytes::Bytes;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Initialize logging for tests
    pub fn init_logging() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("kinesis_events=debug")),
                )
                .with_test_writer()
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .try_init()
                .ok();
        });
    }

    /// Create a test record with given sequence number and raw payload
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> StreamRecord {
        StreamRecord::new(sequence_number, "test-partition-key", Bytes::copy_from_slice(data))
    }

    /// Create a record carrying a JSON event
    pub fn create_event_record(sequence_number: &str, event_type: &str, instance_id: &str) -> StreamRecord {
        Self::event_to_record(sequence_number, &Event::new(event_type, instance_id))
    }

    pub fn event_to_record(sequence_number: &str, event: &Event) -> StreamRecord {
        let payload = serde_json::to_vec(event).expect("Failed to serialize test event");
        StreamRecord::new(sequence_number, event.partition_key(), Bytes::from(payload))
    }

    /// Events numbered by a `seq` body field, starting at 0
    pub fn create_event_records(event_type: &str, count: usize) -> Vec<StreamRecord> {
        (0..count)
            .map(|i| {
                let event = Event::new(event_type, "instance-a").with_field("seq", i as i64);
                Self::event_to_record(&format!("sequence-{}", i), &event)
            })
            .collect()
    }

    /// Configuration with intervals short enough for tests
    pub fn test_config() -> Configuration {
        let mut config = Configuration::new("test-app");
        config.initial_position = InitialPosition::Latest;
        config.polling_interval = Duration::from_millis(10);
        config.shard_sync_interval = Duration::from_millis(20);
        config.checkpoint_interval = Duration::from_secs(60);
        config.shutdown_timeout = Duration::from_secs(2);
        config.publish_single_request_timeout = Duration::from_millis(200);
        config.publish_timeout = Duration::from_millis(500);
        config
    }

    /// Polls `check` until it holds or `timeout` elapses
    pub async fn wait_until<F>(timeout: Duration, mut check: F) -> anyhow::Result<()>
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("Condition not met within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventDecoder, JsonEventDecoder};

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("seq-1", b"test-data");
        assert_eq!(record.sequence_number, "seq-1");
        assert_eq!(record.data.as_ref(), b"test-data");
        assert_eq!(record.partition_key, "test-partition-key");
    }

    #[test]
    fn test_event_records_decode() -> anyhow::Result<()> {
        let records = TestUtils::create_event_records("ref-updated", 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].sequence_number, "sequence-2");
        assert_eq!(records[0].partition_key, "instance-a");

        let event = JsonEventDecoder::new().decode(&records[1].data)?;
        assert_eq!(event.body.get("seq").and_then(|v| v.as_i64()), Some(1));
        Ok(())
    }
}
