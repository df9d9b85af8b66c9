use crate::client::{
    IteratorPosition, KinesisClientError, KinesisClientTrait, PutRecordOutcome, RecordBatch,
    ShardDescription, StreamRecord,
};
use crate::error::{BrokerError, CheckpointError, Result};
use crate::event::{Event, EventCallback};
use crate::lifecycle::Checkpointer;
use crate::scheduler::{Scheduler, SchedulerFactory};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct MockShard {
    description: ShardDescription,
    records: Vec<StreamRecord>,
    closed: bool,
}

/// In-memory stream standing in for Kinesis
///
/// Iterators are `"{shard_id}:{index}"`. Records put through
/// [`KinesisClientTrait::put_record`] land on an open shard chosen by
/// partition key; closed shards return no next iterator once fully read.
#[derive(Debug, Default, Clone)]
pub struct MockKinesisClient {
    shards: Arc<parking_lot::Mutex<Vec<MockShard>>>,
    get_records_errors: Arc<Mutex<VecDeque<KinesisClientError>>>,
    put_errors: Arc<Mutex<VecDeque<KinesisClientError>>>,
    put_delay: Arc<RwLock<Option<Duration>>>,
    iterator_request_count: Arc<AtomicUsize>,
    get_records_count: Arc<AtomicUsize>,
    put_count: Arc<AtomicUsize>,
    next_sequence: Arc<AtomicU64>,
}

impl MockKinesisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(shard_ids: &[&str]) -> Self {
        let client = Self::new();
        for shard_id in shard_ids {
            client.add_shard(ShardDescription::new(*shard_id));
        }
        client
    }

    pub fn add_shard(&self, description: ShardDescription) {
        self.shards.lock().push(MockShard {
            description,
            records: Vec::new(),
            closed: false,
        });
    }

    /// Closes a shard and opens its children, as a resharding would
    pub fn split_shard(&self, parent: &str, children: &[&str]) {
        self.close_shard(parent);
        for child in children {
            self.add_shard(ShardDescription::new(*child).with_parent(parent));
        }
    }

    pub fn close_shard(&self, shard_id: &str) {
        if let Some(shard) = self
            .shards
            .lock()
            .iter_mut()
            .find(|s| s.description.shard_id == shard_id)
        {
            shard.closed = true;
        }
    }

    /// Appends a record to a specific shard and returns its sequence number
    pub fn push_record(&self, shard_id: &str, partition_key: &str, data: &[u8]) -> String {
        let sequence = self.allocate_sequence();
        let mut shards = self.shards.lock();
        if let Some(shard) = shards.iter_mut().find(|s| s.description.shard_id == shard_id) {
            shard.records.push(StreamRecord::new(
                sequence.clone(),
                partition_key,
                Bytes::copy_from_slice(data),
            ));
        }
        sequence
    }

    pub fn records(&self, shard_id: &str) -> Vec<StreamRecord> {
        self.shards
            .lock()
            .iter()
            .find(|s| s.description.shard_id == shard_id)
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    pub fn total_records(&self) -> usize {
        self.shards.lock().iter().map(|s| s.records.len()).sum()
    }

    pub async fn mock_get_records_error(&self, error: KinesisClientError) {
        self.get_records_errors.lock().await.push_back(error);
    }

    pub async fn mock_expired_iterator(&self) {
        self.mock_get_records_error(KinesisClientError::ExpiredIterator).await;
    }

    pub async fn mock_put_error(&self, error: KinesisClientError) {
        self.put_errors.lock().await.push_back(error);
    }

    /// Every put waits this long before answering
    pub async fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.write().await = Some(delay);
    }

    pub fn iterator_request_count(&self) -> usize {
        self.iterator_request_count.load(Ordering::SeqCst)
    }

    pub fn get_records_count(&self) -> usize {
        self.get_records_count.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    fn allocate_sequence(&self) -> String {
        format!("{:020}", self.next_sequence.fetch_add(1, Ordering::SeqCst))
    }
}

fn parse_iterator(iterator: &str) -> std::result::Result<(String, usize), KinesisClientError> {
    iterator
        .rsplit_once(':')
        .and_then(|(shard, index)| index.parse().ok().map(|i| (shard.to_string(), i)))
        .ok_or_else(|| KinesisClientError::Other(format!("invalid iterator {}", iterator)))
}

#[async_trait]
impl KinesisClientTrait for MockKinesisClient {
    async fn list_shards(&self, _stream_name: &str) -> std::result::Result<Vec<ShardDescription>, KinesisClientError> {
        Ok(self
            .shards
            .lock()
            .iter()
            .map(|s| s.description.clone())
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> std::result::Result<String, KinesisClientError> {
        self.iterator_request_count.fetch_add(1, Ordering::SeqCst);
        let shards = self.shards.lock();
        let shard = shards
            .iter()
            .find(|s| s.description.shard_id == shard_id)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(shard_id.to_string()))?;

        let index = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => shard.records.len(),
            IteratorPosition::AfterSequenceNumber(sequence) => shard
                .records
                .iter()
                .position(|r| &r.sequence_number == sequence)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    KinesisClientError::Other(format!("unknown sequence number {}", sequence))
                })?,
        };
        debug!(shard_id = %shard_id, index, "Mock iterator issued");
        Ok(format!("{}:{}", shard_id, index))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> std::result::Result<RecordBatch, KinesisClientError> {
        self.get_records_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.get_records_errors.lock().await.pop_front() {
            return Err(error);
        }

        let (shard_id, index) = parse_iterator(iterator)?;
        let shards = self.shards.lock();
        let shard = shards
            .iter()
            .find(|s| s.description.shard_id == shard_id)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(shard_id.clone()))?;

        let start = index.min(shard.records.len());
        let end = (start + limit.max(0) as usize).min(shard.records.len());
        let next_iterator = if shard.closed && end >= shard.records.len() {
            None
        } else {
            Some(format!("{}:{}", shard_id, end))
        };

        Ok(RecordBatch {
            records: shard.records[start..end].to_vec(),
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }

    async fn put_record(
        &self,
        _stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> std::result::Result<PutRecordOutcome, KinesisClientError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.put_delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.put_errors.lock().await.pop_front() {
            return Err(error);
        }

        let sequence = self.allocate_sequence();
        let mut shards = self.shards.lock();
        let open: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.closed)
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return Err(KinesisClientError::ResourceNotFound("no open shard".to_string()));
        }

        let hash: usize = partition_key.bytes().map(usize::from).sum();
        let shard = &mut shards[open[hash % open.len()]];
        shard
            .records
            .push(StreamRecord::new(sequence.clone(), partition_key, data));

        Ok(PutRecordOutcome {
            shard_id: shard.description.shard_id.clone(),
            sequence_number: sequence,
        })
    }
}

/// Checkpointer answering with queued results, `Ok` once the queue is empty
#[derive(Debug, Default, Clone)]
pub struct MockCheckpointer {
    results: Arc<parking_lot::Mutex<VecDeque<std::result::Result<(), CheckpointError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mock_checkpoint(&self, result: std::result::Result<(), CheckpointError>) {
        self.results.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checkpointer for MockCheckpointer {
    async fn checkpoint(&self) -> std::result::Result<(), CheckpointError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Collects every event handed to its callbacks
#[derive(Debug, Default, Clone)]
pub struct RecordingCallback {
    events: Arc<parking_lot::Mutex<Vec<Event>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> EventCallback {
        self.callback_with(|_| Ok(()))
    }

    /// Records the event, then answers with `f`
    pub fn callback_with<F>(&self, f: F) -> EventCallback
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let events = self.events.clone();
        Arc::new(move |event: Event| {
            events.lock().push(event.clone());
            f(&event)
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Polls until at least `expected` events arrived
    pub async fn wait_for_count(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < expected {
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Scheduler that only waits for its shutdown signal
pub struct FakeScheduler {
    pub stream_name: String,
    pub from_trim_horizon: bool,
    callback: EventCallback,
    hang_on_shutdown: bool,
    shutdown_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
    started: AtomicBool,
    shutdown_requests: AtomicUsize,
}

impl FakeScheduler {
    pub fn new(stream_name: &str, from_trim_horizon: bool, callback: EventCallback, hang_on_shutdown: bool) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            from_trim_horizon,
            callback,
            hang_on_shutdown,
            shutdown_tx: watch::channel(false).0,
            finished_tx: watch::channel(false).0,
            started: AtomicBool::new(false),
            shutdown_requests: AtomicUsize::new(0),
        }
    }

    /// Delivers an event to the subscriber callback as a shard processor would
    pub fn deliver(&self, event: Event) -> anyhow::Result<()> {
        (self.callback)(event)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished_tx.borrow()
    }

    pub fn shutdown_requests(&self) -> usize {
        self.shutdown_requests.load(Ordering::SeqCst)
    }

    /// Lets `run` return even when shutdown requests are ignored
    pub fn finish(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn run(&self) {
        self.started.store(true, Ordering::SeqCst);
        let mut shutdown = self.shutdown_tx.subscribe();
        let _ = shutdown.wait_for(|stop| *stop).await;
        self.finished_tx.send_replace(true);
    }

    fn start_graceful_shutdown(&self) -> BoxFuture<'static, bool> {
        self.shutdown_requests.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_shutdown {
            return futures::future::pending().boxed();
        }

        self.shutdown_tx.send_replace(true);
        let mut finished = self.finished_tx.subscribe();
        async move { finished.wait_for(|done| *done).await.is_ok() }.boxed()
    }
}

/// Factory recording every scheduler it builds
#[derive(Default)]
pub struct FakeSchedulerFactory {
    created: parking_lot::Mutex<Vec<Arc<FakeScheduler>>>,
    hang_on_shutdown: AtomicBool,
    fail_next: parking_lot::Mutex<Option<String>>,
}

impl FakeSchedulerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedulers built from now on never finish shutting down
    pub fn hang_on_shutdown(&self) {
        self.hang_on_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    pub fn created(&self) -> Vec<Arc<FakeScheduler>> {
        self.created.lock().clone()
    }

    pub fn trim_horizon_flags(&self) -> Vec<bool> {
        self.created.lock().iter().map(|s| s.from_trim_horizon).collect()
    }
}

impl SchedulerFactory for FakeSchedulerFactory {
    fn create(
        &self,
        stream_name: &str,
        from_trim_horizon: bool,
        callback: EventCallback,
    ) -> Result<Arc<dyn Scheduler>> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(BrokerError::SchedulerConstruction(reason));
        }
        let scheduler = Arc::new(FakeScheduler::new(
            stream_name,
            from_trim_horizon,
            callback,
            self.hang_on_shutdown.load(Ordering::SeqCst),
        ));
        self.created.lock().push(scheduler.clone());
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_stream_reads_and_closes() -> anyhow::Result<()> {
        let client = MockKinesisClient::with_shards(&["shard-1"]);
        let first = client.push_record("shard-1", "pk", b"one");
        client.push_record("shard-1", "pk", b"two");

        let iterator = client
            .get_shard_iterator("stream", "shard-1", &IteratorPosition::AfterSequenceNumber(first))
            .await?;
        let batch = client.get_records(&iterator, 10).await?;
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].data.as_ref(), b"two");
        assert!(batch.next_iterator.is_some());

        client.close_shard("shard-1");
        let iterator = client
            .get_shard_iterator("stream", "shard-1", &IteratorPosition::Latest)
            .await?;
        let batch = client.get_records(&iterator, 10).await?;
        assert!(batch.records.is_empty());
        assert!(batch.next_iterator.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_put_routes_to_open_shards() -> anyhow::Result<()> {
        let client = MockKinesisClient::with_shards(&["shard-1"]);
        client.split_shard("shard-1", &["shard-2", "shard-3"]);

        let outcome = client
            .put_record("stream", "instance-a", Bytes::from_static(b"{}"))
            .await?;

        assert_ne!(outcome.shard_id, "shard-1");
        assert_eq!(client.total_records(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_scheduler_shutdown() {
        let factory = FakeSchedulerFactory::new();
        let scheduler = factory
            .create("stream", true, RecordingCallback::new().callback())
            .expect("fake scheduler");

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::task::yield_now().await;

        assert!(scheduler.start_graceful_shutdown().await);
        handle.await.expect("scheduler task");
        assert_eq!(factory.trim_horizon_flags(), vec![true]);
        assert!(factory.created()[0].is_finished());
    }

    #[test]
    fn test_hanging_scheduler_never_completes_shutdown() {
        let factory = FakeSchedulerFactory::new();
        factory.hang_on_shutdown();
        let scheduler = factory
            .create("stream", false, RecordingCallback::new().callback())
            .expect("fake scheduler");

        let mut shutdown = tokio_test::task::spawn(scheduler.start_graceful_shutdown());
        tokio_test::assert_pending!(shutdown.poll());
        tokio_test::assert_pending!(shutdown.poll());
        assert_eq!(factory.created()[0].shutdown_requests(), 1);
    }
}
