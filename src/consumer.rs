//! Per-stream subscriptions and their scheduler lifecycle
//!
//! [`StreamConsumer`] owns at most one running scheduler per stream. It
//! starts schedulers on a bounded pool, rewinds consumer groups on request
//! and shuts everything down within a bounded time.

use crate::config::Configuration;
use crate::error::{BrokerError, Result};
use crate::event::EventCallback;
use crate::scheduler::{Scheduler, SchedulerFactory};
use crate::store::CheckpointResetter;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One-shot request to start the next scheduler from the beginning of the stream
#[derive(Debug, Default)]
pub struct ResetFlag(AtomicBool);

impl ResetFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the flag
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded pool the schedulers run on, one slot per running scheduler
#[derive(Debug, Clone)]
pub struct ConsumerExecutor {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ConsumerExecutor {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Runs the scheduler once a slot is free
    pub fn execute(&self, stream_name: &str, scheduler: Arc<dyn Scheduler>) -> JoinHandle<()> {
        let permits = self.permits.clone();
        let stream_name = stream_name.to_string();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(stream = %stream_name, error = %e, "Consumer pool closed");
                    return;
                }
            };
            debug!(stream = %stream_name, "Scheduler started on consumer pool");
            scheduler.run().await;
            debug!(stream = %stream_name, "Scheduler left consumer pool");
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A scheduler started for one stream and the pool task running it
struct Subscription {
    stream_name: String,
    scheduler: Arc<dyn Scheduler>,
    handle: JoinHandle<()>,
}

pub struct StreamConsumer {
    scheduler_factory: Arc<dyn SchedulerFactory>,
    resetter: CheckpointResetter,
    config: Configuration,
    executor: ConsumerExecutor,
    // Outlive subscriptions so a reset requested while unsubscribed is kept
    reset_flags: parking_lot::Mutex<HashMap<String, Arc<ResetFlag>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    // Asked to stop but still running after the shutdown timeout
    stopping: parking_lot::Mutex<HashMap<String, Subscription>>,
}

impl StreamConsumer {
    pub fn new(
        scheduler_factory: Arc<dyn SchedulerFactory>,
        resetter: CheckpointResetter,
        config: Configuration,
    ) -> Self {
        let executor = ConsumerExecutor::new(config.number_of_subscribers);
        Self {
            scheduler_factory,
            resetter,
            config,
            executor,
            reset_flags: parking_lot::Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            stopping: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn reset_flag(&self, stream_name: &str) -> Arc<ResetFlag> {
        self.reset_flags
            .lock()
            .entry(stream_name.to_string())
            .or_default()
            .clone()
    }

    /// Starts consuming `stream_name`, replacing any existing subscription to it
    ///
    /// Returns once the scheduler is submitted to the pool, before any lease
    /// is taken. Fails with [`BrokerError::SchedulerStillRunning`] while an
    /// earlier scheduler of the stream has not stopped; in that case the
    /// replaced subscription stays stopped and nothing new is started.
    pub async fn subscribe(&self, stream_name: &str, callback: EventCallback) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;

        if self.is_stopping(stream_name) {
            warn!(stream = %stream_name, "Previous scheduler still running, not subscribing");
            return Err(BrokerError::SchedulerStillRunning(stream_name.to_string()));
        }

        if let Some(existing) = subscriptions.remove(stream_name) {
            info!(stream = %stream_name, "Replacing existing subscription");
            if !self.stop_subscription(&existing).await {
                self.keep_stopping(existing);
                return Err(BrokerError::SchedulerStillRunning(stream_name.to_string()));
            }
        }

        let reset_flag = self.reset_flag(stream_name);
        let from_trim_horizon = reset_flag.take();

        let scheduler = match self
            .scheduler_factory
            .create(stream_name, from_trim_horizon, callback)
        {
            Ok(scheduler) => scheduler,
            Err(e) => {
                if from_trim_horizon {
                    reset_flag.request();
                }
                error!(stream = %stream_name, error = %e, "Failed to build scheduler");
                return Err(e);
            }
        };

        let handle = self.executor.execute(stream_name, scheduler.clone());
        subscriptions.insert(
            stream_name.to_string(),
            Subscription {
                stream_name: stream_name.to_string(),
                scheduler,
                handle,
            },
        );

        info!(
            stream = %stream_name,
            application = %self.config.application_name,
            from_trim_horizon,
            "Subscribed to stream"
        );
        Ok(())
    }

    /// Rewinds every shard checkpoint of the stream and flags the next start
    ///
    /// A running scheduler is not restarted; the rewind applies to the next
    /// `subscribe` of the stream.
    pub async fn reset_offset(&self, stream_name: &str) -> Result<()> {
        let shards = self
            .resetter
            .reset_all_shards_to_beginning(&self.config.application_name, stream_name)
            .await?;

        self.reset_flag(stream_name).request();
        info!(stream = %stream_name, shards, "Offsets reset, next start replays the stream");
        Ok(())
    }

    /// Stops one stream's scheduler; `false` if it was not subscribed
    pub async fn unsubscribe(&self, stream_name: &str) -> bool {
        let removed = self.subscriptions.lock().await.remove(stream_name);
        match removed {
            Some(subscription) => {
                if !self.stop_subscription(&subscription).await {
                    self.keep_stopping(subscription);
                }
                true
            }
            None => {
                debug!(stream = %stream_name, "Not subscribed, nothing to stop");
                false
            }
        }
    }

    /// Stops every scheduler, each wait bounded by the shutdown timeout
    pub async fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();

        if subscriptions.is_empty() {
            debug!("No active subscriptions to shut down");
            return;
        }

        info!(count = subscriptions.len(), "Shutting down all subscriptions");
        let stopped = join_all(
            subscriptions
                .iter()
                .map(|subscription| self.stop_subscription(subscription)),
        )
        .await;

        for (subscription, stopped) in subscriptions.into_iter().zip(stopped) {
            if !stopped {
                self.keep_stopping(subscription);
            }
        }
    }

    /// Requests a graceful shutdown; `true` once the scheduler has stopped
    async fn stop_subscription(&self, subscription: &Subscription) -> bool {
        if subscription.handle.is_finished() {
            debug!(stream = %subscription.stream_name, "Scheduler already exited");
            return true;
        }

        let timeout = self.config.shutdown_timeout;
        info!(stream = %subscription.stream_name, "Shutting down consumer");

        match tokio::time::timeout(timeout, subscription.scheduler.start_graceful_shutdown()).await {
            Ok(true) => {
                info!(stream = %subscription.stream_name, "Consumer shutdown completed");
                true
            }
            // The scheduler dropped its completion signal, so it is no longer running
            Ok(false) => {
                warn!(
                    stream = %subscription.stream_name,
                    "Scheduler reported an incomplete shutdown"
                );
                true
            }
            Err(_) => {
                error!(
                    stream = %subscription.stream_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for graceful shutdown"
                );
                subscription.handle.is_finished()
            }
        }
    }

    fn keep_stopping(&self, subscription: Subscription) {
        warn!(
            stream = %subscription.stream_name,
            "Scheduler still running after shutdown timeout, new subscriptions refused until it exits"
        );
        self.stopping
            .lock()
            .insert(subscription.stream_name.clone(), subscription);
    }

    /// Whether a scheduler of `stream_name` was asked to stop and has not exited yet
    pub fn is_stopping(&self, stream_name: &str) -> bool {
        let mut stopping = self.stopping.lock();
        stopping.retain(|_, subscription| !subscription.handle.is_finished());
        stopping.contains_key(stream_name)
    }

    pub async fn subscribed_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub async fn is_subscribed(&self, stream_name: &str) -> bool {
        self.subscriptions.lock().await.contains_key(stream_name)
    }

    pub fn executor(&self) -> &ConsumerExecutor {
        &self.executor
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }
}
