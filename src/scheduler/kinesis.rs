//! Polling scheduler over a Kinesis stream
//!
//! One scheduler consumes one stream for one application. Its main loop
//! periodically lists the stream's shards, takes whichever leases are free
//! and runs a worker task per leased shard. Each worker owns a fresh shard
//! processor and drives it through the shard lifecycle.
//!
//! Lease handling is deliberately simple: leases are taken when free or
//! expired, renewed on every poll and released on exit. There is no load
//! balancing or lease stealing between workers.

use super::{LeaseCheckpointer, Scheduler, SchedulerConfig};
use crate::client::{IteratorPosition, KinesisClientError, KinesisClientTrait, ShardDescription};
use crate::config::InitialPosition;
use crate::lifecycle::{
    InitializationInput, LeaseLostInput, ProcessRecordsInput, ShardEndedInput, ShardRecordProcessor,
    ShardRecordProcessorFactory, ShutdownRequestedInput,
};
use crate::store::{CheckpointStore, ExtendedSequenceNumber};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How a shard worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardExit {
    LeaseLost,
    ShardEnded,
    Shutdown,
    Failed,
}

pub struct KinesisScheduler<C>
where
    C: KinesisClientTrait + 'static,
{
    inner: Arc<SchedulerInner<C>>,
}

struct SchedulerInner<C> {
    client: Arc<C>,
    store: Arc<dyn CheckpointStore>,
    processor_factory: Arc<dyn ShardRecordProcessorFactory>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
    /// Shards opened at least once by this scheduler
    opened: parking_lot::Mutex<HashSet<String>>,
}

impl<C> KinesisScheduler<C>
where
    C: KinesisClientTrait + 'static,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn CheckpointStore>,
        processor_factory: Arc<dyn ShardRecordProcessorFactory>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                client,
                store,
                processor_factory,
                config,
                shutdown_tx: watch::channel(false).0,
                finished_tx: watch::channel(false).0,
                opened: parking_lot::Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

#[async_trait]
impl<C> Scheduler for KinesisScheduler<C>
where
    C: KinesisClientTrait + 'static,
{
    async fn run(&self) {
        self.inner.clone().run().await
    }

    fn start_graceful_shutdown(&self) -> BoxFuture<'static, bool> {
        info!(
            stream = %self.inner.config.stream_name,
            worker_id = %self.inner.config.worker_id,
            "Graceful shutdown requested"
        );
        self.inner.shutdown_tx.send_replace(true);

        let mut finished = self.inner.finished_tx.subscribe();
        async move { finished.wait_for(|done| *done).await.is_ok() }.boxed()
    }
}

impl<C> SchedulerInner<C>
where
    C: KinesisClientTrait + 'static,
{
    async fn run(self: Arc<Self>) {
        let config = &self.config;
        info!(
            stream = %config.stream_name,
            lease_table = %config.lease_table,
            worker_id = %config.worker_id,
            initial_position = %config.initial_position,
            "Starting scheduler"
        );

        if let Err(e) = self.store.prepare(&config.lease_table).await {
            error!(error = ?e, lease_table = %config.lease_table, "Failed to prepare lease table");
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                break;
            }

            workers.retain(|_, handle| !handle.is_finished());
            if let Err(e) = self.sync_shards(&mut workers).await {
                warn!(stream = %config.stream_name, error = ?e, "Shard sync failed, retrying later");
            }

            tokio::select! {
                _ = tokio::time::sleep(config.shard_sync_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(
            stream = %config.stream_name,
            workers = workers.len(),
            "Waiting for shard workers to finish"
        );
        for (shard_id, handle) in workers {
            if let Err(e) = handle.await {
                error!(shard_id = %shard_id, error = %e, "Shard worker failed");
            }
        }

        self.finished_tx.send_replace(true);
        info!(stream = %config.stream_name, "Scheduler stopped");
    }

    /// Takes free leases and starts a worker for each newly leased shard
    async fn sync_shards(
        self: &Arc<Self>,
        workers: &mut HashMap<String, JoinHandle<()>>,
    ) -> anyhow::Result<()> {
        let config = &self.config;
        let shards = self.client.list_shards(&config.stream_name).await?;
        let leases = self.store.list_leases(&config.lease_table).await?;

        let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();
        let completed: HashSet<&str> = leases
            .iter()
            .filter(|l| l.is_completed())
            .map(|l| l.shard_id.as_str())
            .collect();

        for shard in &shards {
            let shard_id = shard.shard_id.as_str();
            if workers.contains_key(shard_id) || completed.contains(shard_id) {
                continue;
            }

            // Parents that are no longer listed have aged out of the stream
            if shard
                .parents()
                .any(|parent| listed.contains(parent) && !completed.contains(parent))
            {
                trace!(shard_id = %shard_id, "Waiting for parent shards to complete");
                continue;
            }

            if !self
                .store
                .take_lease(&config.lease_table, shard_id, &config.worker_id)
                .await?
            {
                continue;
            }

            debug!(shard_id = %shard_id, "Starting shard worker");
            let handle = tokio::spawn(self.clone().run_shard(shard.clone()));
            workers.insert(shard_id.to_string(), handle);
        }

        Ok(())
    }

    async fn run_shard(self: Arc<Self>, shard: ShardDescription) {
        let config = &self.config;
        let shard_id = shard.shard_id.clone();
        let checkpointer = Arc::new(LeaseCheckpointer::new(
            self.store.clone(),
            config.lease_table.clone(),
            shard_id.clone(),
            config.worker_id.clone(),
        ));
        let mut processor = self.processor_factory.create();
        let mut shutdown = self.shutdown_tx.subscribe();

        let exit = self
            .drive_shard(&shard, processor.as_mut(), &checkpointer, &mut shutdown)
            .await;
        checkpointer.close();

        if exit != ShardExit::LeaseLost {
            if let Err(e) = self
                .store
                .release_lease(&config.lease_table, &shard_id, &config.worker_id)
                .await
            {
                warn!(shard_id = %shard_id, error = ?e, "Failed to release lease");
            }
        }
        info!(shard_id = %shard_id, exit = ?exit, "Shard worker stopped");
    }

    async fn drive_shard(
        &self,
        shard: &ShardDescription,
        processor: &mut dyn ShardRecordProcessor,
        checkpointer: &Arc<LeaseCheckpointer>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ShardExit {
        let config = &self.config;
        let shard_id = shard.shard_id.as_str();

        let start = match self.start_position(shard).await {
            Ok(start) => start,
            Err(e) => {
                error!(shard_id = %shard_id, error = ?e, "Failed to resolve start position");
                return ShardExit::Failed;
            }
        };
        if start.is_shard_end() {
            debug!(shard_id = %shard_id, "Shard already completed");
            return ShardExit::ShardEnded;
        }

        processor
            .initialize(InitializationInput {
                shard_id: shard_id.to_string(),
                extended_sequence_number: start.clone(),
            })
            .await;

        let mut position = match &start {
            ExtendedSequenceNumber::TrimHorizon => IteratorPosition::TrimHorizon,
            ExtendedSequenceNumber::Latest => IteratorPosition::Latest,
            ExtendedSequenceNumber::At {
                sequence_number, ..
            } => IteratorPosition::AfterSequenceNumber(sequence_number.clone()),
            ExtendedSequenceNumber::ShardEnd => return ShardExit::ShardEnded,
        };

        let mut iterator = match self
            .client
            .get_shard_iterator(&config.stream_name, shard_id, &position)
            .await
        {
            Ok(iterator) => iterator,
            Err(e) => {
                error!(shard_id = %shard_id, error = %e, "Failed to get initial iterator");
                return ShardExit::Failed;
            }
        };

        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                processor
                    .shutdown_requested(ShutdownRequestedInput {
                        checkpointer: checkpointer.clone(),
                    })
                    .await;
                return ShardExit::Shutdown;
            }

            match self
                .store
                .renew_lease(&config.lease_table, shard_id, &config.worker_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    processor.lease_lost(LeaseLostInput).await;
                    return ShardExit::LeaseLost;
                }
                Err(e) => warn!(shard_id = %shard_id, error = ?e, "Failed to renew lease"),
            }

            let result = tokio::select! {
                result = self.client.get_records(&iterator, config.max_records) => result,
                _ = shutdown.changed() => continue,
            };

            match result {
                Ok(batch) => {
                    if let Some(last) = batch.records.last() {
                        checkpointer.advance_to(last.extended_sequence_number());
                        position = IteratorPosition::AfterSequenceNumber(last.sequence_number.clone());
                    }

                    if !batch.records.is_empty() {
                        processor
                            .process_records(ProcessRecordsInput {
                                records: batch.records,
                                millis_behind_latest: batch.millis_behind_latest,
                                checkpointer: checkpointer.clone(),
                            })
                            .await;
                    }

                    match batch.next_iterator {
                        Some(next) => iterator = next,
                        None => {
                            checkpointer.mark_shard_end();
                            return match processor
                                .shard_ended(ShardEndedInput {
                                    checkpointer: checkpointer.clone(),
                                })
                                .await
                            {
                                Ok(()) => {
                                    info!(shard_id = %shard_id, "Shard fully processed");
                                    ShardExit::ShardEnded
                                }
                                Err(e) => {
                                    error!(
                                        shard_id = %shard_id,
                                        error = %e,
                                        "Shard end not recorded, shard will be read again"
                                    );
                                    ShardExit::Failed
                                }
                            };
                        }
                    }
                }
                Err(KinesisClientError::ExpiredIterator) => {
                    warn!(shard_id = %shard_id, "Iterator expired, requesting a new one");
                    match self
                        .client
                        .get_shard_iterator(&config.stream_name, shard_id, &position)
                        .await
                    {
                        Ok(next) => {
                            iterator = next;
                            continue;
                        }
                        Err(e) => {
                            error!(shard_id = %shard_id, error = %e, "Failed to renew iterator");
                            return ShardExit::Failed;
                        }
                    }
                }
                Err(e) => warn!(shard_id = %shard_id, error = %e, "Failed to get records"),
            }

            tokio::select! {
                _ = tokio::time::sleep(config.polling_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Where a newly leased shard is read from
    async fn start_position(&self, shard: &ShardDescription) -> anyhow::Result<ExtendedSequenceNumber> {
        let config = &self.config;
        let first_open = self.opened.lock().insert(shard.shard_id.clone());

        if config.ignore_checkpoints && first_open {
            debug!(shard_id = %shard.shard_id, "Replaying shard from the beginning");
            return Ok(ExtendedSequenceNumber::TrimHorizon);
        }

        let checkpoint = self
            .store
            .get_lease(&config.lease_table, &shard.shard_id)
            .await?
            .and_then(|lease| lease.checkpoint);

        Ok(match checkpoint {
            Some(checkpoint) => checkpoint,
            // Children of a resharded shard continue where their parents ended
            None if shard.parent_shard_id.is_some() => ExtendedSequenceNumber::TrimHorizon,
            None => match config.initial_position {
                InitialPosition::TrimHorizon => ExtendedSequenceNumber::TrimHorizon,
                InitialPosition::Latest => ExtendedSequenceNumber::Latest,
            },
        })
    }
}
