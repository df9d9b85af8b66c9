//! Configuration surface for publishing and consuming events
//!
//! Values come from a flat string property map (the hosting application's
//! plugin section) and can be overridden per key from the process
//! environment, e.g. `KINESIS_EVENTS_POLLING_INTERVAL_MS=250`.

use crate::error::{BrokerError, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, Level};

pub const REGION_FIELD: &str = "region";
pub const ENDPOINT_FIELD: &str = "endpoint";
pub const STREAM_EVENTS_TOPIC_FIELD: &str = "topic";
pub const NUMBER_OF_SUBSCRIBERS_FIELD: &str = "numberOfSubscribers";
pub const APPLICATION_NAME_FIELD: &str = "applicationName";
pub const INITIAL_POSITION_FIELD: &str = "initialPosition";
pub const POLLING_INTERVAL_MS_FIELD: &str = "pollingIntervalMs";
pub const MAX_RECORDS_FIELD: &str = "maxRecords";
pub const PUBLISH_SINGLE_REQUEST_TIMEOUT_MS_FIELD: &str = "publishSingleRequestTimeoutMs";
pub const PUBLISH_TIMEOUT_MS_FIELD: &str = "publishTimeoutMs";
pub const SHUTDOWN_TIMEOUT_MS_FIELD: &str = "shutdownTimeoutMs";
pub const CHECKPOINT_INTERVAL_MS_FIELD: &str = "checkpointIntervalMs";
pub const AWS_LIB_LOG_LEVEL_FIELD: &str = "awsLibLogLevel";
pub const SEND_ASYNC_FIELD: &str = "sendAsync";
pub const SEND_STREAM_EVENTS_FIELD: &str = "sendStreamEvents";
pub const SHARD_SYNC_INTERVAL_MS_FIELD: &str = "shardSyncIntervalMs";
pub const LEASE_FAILOVER_MS_FIELD: &str = "leaseFailoverMs";

const ENV_PREFIX: &str = "KINESIS_EVENTS_";

pub const DEFAULT_STREAM_EVENTS_TOPIC: &str = "stream-events";
pub const DEFAULT_NUMBER_OF_SUBSCRIBERS: usize = 6;
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RECORDS: i32 = 100;
pub const DEFAULT_PUBLISH_SINGLE_REQUEST_TIMEOUT: Duration = Duration::from_millis(6000);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(6000);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(5 * 60_000);
pub const DEFAULT_SHARD_SYNC_INTERVAL: Duration = Duration::from_millis(10_000);
pub const DEFAULT_LEASE_FAILOVER: Duration = Duration::from_millis(10_000);

/// Where a consumer with no checkpoint for a shard starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPosition {
    /// Oldest record still retained by the stream
    TrimHorizon,
    /// Only records published after the shard was opened
    Latest,
}

impl FromStr for InitialPosition {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trim_horizon" | "earliest" => Ok(InitialPosition::TrimHorizon),
            "latest" => Ok(InitialPosition::Latest),
            other => Err(BrokerError::Configuration(format!(
                "{}: unsupported initial position '{}'",
                INITIAL_POSITION_FIELD, other
            ))),
        }
    }
}

impl fmt::Display for InitialPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            InitialPosition::Latest => write!(f, "LATEST"),
        }
    }
}

/// Name of the lease table shared by every worker of one application on one stream
pub fn consumer_lease_name(application_name: &str, stream_name: &str) -> String {
    format!("{}-{}", application_name, stream_name)
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    /// AWS region; the SDK provider chain decides when unset
    pub region: Option<String>,
    /// Endpoint override, e.g. a localstack URL
    pub endpoint: Option<String>,
    /// Stream the broker's own stream events are forwarded to
    pub stream_events_topic: String,
    /// Size of the consumer worker pool (one slot per subscribed stream)
    pub number_of_subscribers: usize,
    /// Consumer group identity; also prefixes lease table names
    pub application_name: String,
    pub initial_position: InitialPosition,
    pub polling_interval: Duration,
    pub max_records: i32,
    pub publish_single_request_timeout: Duration,
    pub publish_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// Log level applied to the AWS SDK crates
    pub aws_lib_log_level: Level,
    pub send_async: bool,
    pub send_stream_events: bool,
    /// How often the scheduler lists shards and looks for leases to take
    pub shard_sync_interval: Duration,
    /// How long a lease may go unrenewed before another worker may take it
    pub lease_failover: Duration,
}

impl Configuration {
    /// Defaults for a host identified by `plugin_name`
    pub fn new(plugin_name: &str) -> Self {
        Self {
            region: None,
            endpoint: None,
            stream_events_topic: DEFAULT_STREAM_EVENTS_TOPIC.to_string(),
            number_of_subscribers: DEFAULT_NUMBER_OF_SUBSCRIBERS,
            application_name: plugin_name.to_string(),
            initial_position: InitialPosition::Latest,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_records: DEFAULT_MAX_RECORDS,
            publish_single_request_timeout: DEFAULT_PUBLISH_SINGLE_REQUEST_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            aws_lib_log_level: Level::WARN,
            send_async: true,
            send_stream_events: false,
            shard_sync_interval: DEFAULT_SHARD_SYNC_INTERVAL,
            lease_failover: DEFAULT_LEASE_FAILOVER,
        }
    }

    /// Builds a configuration from properties, with environment overrides
    pub fn from_properties(plugin_name: &str, properties: &HashMap<String, String>) -> Result<Self> {
        Self::from_sources(plugin_name, properties, |name| {
            std::env::var(env_key(name)).ok()
        })
    }

    /// Builds a configuration where `overrides` wins over `properties`
    pub fn from_sources<F>(
        plugin_name: &str,
        properties: &HashMap<String, String>,
        overrides: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| -> Option<String> {
            overrides(name)
                .filter(|v| !v.is_empty())
                .or_else(|| properties.get(name).cloned())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::new(plugin_name);
        let config = Self {
            region: lookup(REGION_FIELD),
            endpoint: lookup(ENDPOINT_FIELD).map(validate_endpoint).transpose()?,
            stream_events_topic: lookup(STREAM_EVENTS_TOPIC_FIELD)
                .unwrap_or(defaults.stream_events_topic),
            number_of_subscribers: parse_field(&lookup, NUMBER_OF_SUBSCRIBERS_FIELD)?
                .unwrap_or(defaults.number_of_subscribers),
            application_name: lookup(APPLICATION_NAME_FIELD).unwrap_or(defaults.application_name),
            initial_position: lookup(INITIAL_POSITION_FIELD)
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(defaults.initial_position),
            polling_interval: parse_millis(&lookup, POLLING_INTERVAL_MS_FIELD)?
                .unwrap_or(defaults.polling_interval),
            max_records: parse_field(&lookup, MAX_RECORDS_FIELD)?.unwrap_or(defaults.max_records),
            publish_single_request_timeout: parse_millis(
                &lookup,
                PUBLISH_SINGLE_REQUEST_TIMEOUT_MS_FIELD,
            )?
            .unwrap_or(defaults.publish_single_request_timeout),
            publish_timeout: parse_millis(&lookup, PUBLISH_TIMEOUT_MS_FIELD)?
                .unwrap_or(defaults.publish_timeout),
            shutdown_timeout: parse_millis(&lookup, SHUTDOWN_TIMEOUT_MS_FIELD)?
                .unwrap_or(defaults.shutdown_timeout),
            checkpoint_interval: parse_millis(&lookup, CHECKPOINT_INTERVAL_MS_FIELD)?
                .unwrap_or(defaults.checkpoint_interval),
            aws_lib_log_level: lookup(AWS_LIB_LOG_LEVEL_FIELD)
                .map(|v| {
                    v.trim().parse::<Level>().map_err(|_| {
                        BrokerError::Configuration(format!(
                            "{}: unsupported log level '{}'",
                            AWS_LIB_LOG_LEVEL_FIELD, v
                        ))
                    })
                })
                .transpose()?
                .unwrap_or(defaults.aws_lib_log_level),
            send_async: parse_field(&lookup, SEND_ASYNC_FIELD)?.unwrap_or(defaults.send_async),
            send_stream_events: parse_field(&lookup, SEND_STREAM_EVENTS_FIELD)?
                .unwrap_or(defaults.send_stream_events),
            shard_sync_interval: parse_millis(&lookup, SHARD_SYNC_INTERVAL_MS_FIELD)?
                .unwrap_or(defaults.shard_sync_interval),
            lease_failover: parse_millis(&lookup, LEASE_FAILOVER_MS_FIELD)?
                .unwrap_or(defaults.lease_failover),
        };

        config.validate()?;

        info!(
            application = %config.application_name,
            polling_interval_ms = config.polling_interval.as_millis() as u64,
            max_records = config.max_records,
            region = config.region.as_deref().unwrap_or("<provider chain>"),
            endpoint = config.endpoint.as_deref().unwrap_or("<default>"),
            "Kinesis events configuration loaded"
        );

        Ok(config)
    }

    /// Rejects values the consumer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.number_of_subscribers == 0 {
            return Err(BrokerError::Configuration(format!(
                "{} must be at least 1",
                NUMBER_OF_SUBSCRIBERS_FIELD
            )));
        }
        if !(1..=10_000).contains(&self.max_records) {
            return Err(BrokerError::Configuration(format!(
                "{} must be between 1 and 10000, got {}",
                MAX_RECORDS_FIELD, self.max_records
            )));
        }
        if self.application_name.trim().is_empty() {
            return Err(BrokerError::Configuration(format!(
                "{} must not be empty",
                APPLICATION_NAME_FIELD
            )));
        }
        Ok(())
    }

    pub fn lease_table(&self, stream_name: &str) -> String {
        consumer_lease_name(&self.application_name, stream_name)
    }
}

fn env_key(name: &str) -> String {
    let mut key = String::from(ENV_PREFIX);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            key.push('_');
        }
        key.push(c.to_ascii_uppercase());
    }
    key
}

fn validate_endpoint(endpoint: String) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint)
    } else {
        Err(BrokerError::Configuration(format!(
            "{}: '{}' is not an http(s) URL",
            ENDPOINT_FIELD, endpoint
        )))
    }
}

fn parse_field<T, L>(lookup: &L, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                BrokerError::Configuration(format!("{}: invalid value '{}': {}", name, raw, e))
            })
        })
        .transpose()
}

fn parse_millis<L>(lookup: &L, name: &str) -> Result<Option<Duration>>
where
    L: Fn(&str) -> Option<String>,
{
    Ok(parse_field::<u64, L>(lookup, name)?.map(Duration::from_millis))
}
