// tests/common/mod.rs
use futures::future::BoxFuture;
use futures::FutureExt;
use kinesis_events::{
    BrokerError, Configuration, Event, EventCallback, Result, Scheduler, SchedulerFactory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::watch;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kinesis_events=debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn create_test_config() -> Configuration {
    let mut config = Configuration::new("integration");
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

/// Scheduler that hands the callback to the test and waits to be stopped
pub struct ScriptedScheduler {
    pub stream_name: String,
    pub from_trim_horizon: bool,
    callback: EventCallback,
    ignore_shutdown: bool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl ScriptedScheduler {
    pub fn emit(&self, event: Event) -> anyhow::Result<()> {
        (self.callback)(event)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }
}

#[async_trait::async_trait]
impl Scheduler for ScriptedScheduler {
    async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut stop = self.stop_tx.subscribe();
        let _ = stop.wait_for(|s| *s).await;
        self.running.store(false, Ordering::SeqCst);
        self.done_tx.send_replace(true);
    }

    fn start_graceful_shutdown(&self) -> BoxFuture<'static, bool> {
        if self.ignore_shutdown {
            return futures::future::pending().boxed();
        }
        self.stop_tx.send_replace(true);
        let mut done = self.done_tx.subscribe();
        async move { done.wait_for(|d| *d).await.is_ok() }.boxed()
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    pub ignore_shutdown: bool,
    pub reject_streams: Vec<String>,
    pub built: Mutex<Vec<Arc<ScriptedScheduler>>>,
}

impl ScriptedFactory {
    pub fn built(&self) -> Vec<Arc<ScriptedScheduler>> {
        self.built.lock().unwrap().clone()
    }

    pub fn last_for(&self, stream_name: &str) -> Option<Arc<ScriptedScheduler>> {
        self.built()
            .into_iter()
            .rev()
            .find(|s| s.stream_name == stream_name)
    }
}

impl SchedulerFactory for ScriptedFactory {
    fn create(
        &self,
        stream_name: &str,
        from_trim_horizon: bool,
        callback: EventCallback,
    ) -> Result<Arc<dyn Scheduler>> {
        if self.reject_streams.iter().any(|s| s == stream_name) {
            return Err(BrokerError::SchedulerConstruction(format!(
                "stream {} does not exist",
                stream_name
            )));
        }
        let scheduler = Arc::new(ScriptedScheduler {
            stream_name: stream_name.to_string(),
            from_trim_horizon,
            callback,
            ignore_shutdown: self.ignore_shutdown,
            running: AtomicBool::new(false),
            stop_tx: watch::channel(false).0,
            done_tx: watch::channel(false).0,
        });
        self.built.lock().unwrap().push(scheduler.clone());
        Ok(scheduler)
    }
}

pub async fn wait_for<F: Fn() -> bool>(check: F) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
