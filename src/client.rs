//! Thin client seam over the Kinesis API
//!
//! The scheduler and the producer only talk to Kinesis through
//! [`KinesisClientTrait`], which keeps them testable against in-memory doubles.

use crate::config::Configuration;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use aws_smithy_types::Blob;
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};

use crate::store::ExtendedSequenceNumber;

/// Classified Kinesis API failure
#[derive(Debug, Clone, Error)]
pub enum KinesisClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

/// A record as handed to shard processors, independent of the SDK types
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub sequence_number: String,
    pub sub_sequence_number: u64,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl StreamRecord {
    pub fn new(sequence_number: impl Into<String>, partition_key: impl Into<String>, data: Bytes) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number: 0,
            partition_key: partition_key.into(),
            data,
            approximate_arrival: None,
        }
    }

    pub fn extended_sequence_number(&self) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber::At {
            sequence_number: self.sequence_number.clone(),
            sub_sequence_number: self.sub_sequence_number,
        }
    }
}

impl From<&aws_sdk_kinesis::types::Record> for StreamRecord {
    fn from(record: &aws_sdk_kinesis::types::Record) -> Self {
        Self {
            sequence_number: record.sequence_number().to_string(),
            sub_sequence_number: 0,
            partition_key: record.partition_key().unwrap_or_default().to_string(),
            data: Bytes::copy_from_slice(record.data().as_ref()),
            approximate_arrival: record
                .approximate_arrival_timestamp()
                .and_then(|ts| ts.to_chrono_utc().ok()),
        }
    }
}

/// Shard as listed by the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub adjacent_parent_shard_id: Option<String>,
}

impl ShardDescription {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }

    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.parent_shard_id
            .as_deref()
            .into_iter()
            .chain(self.adjacent_parent_shard_id.as_deref())
    }
}

/// Where to position a new shard iterator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AfterSequenceNumber(String),
}

/// One page of records
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,
    /// `None` once a closed shard has been fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// Acknowledgement of a published record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordOutcome {
    pub shard_id: String,
    pub sequence_number: String,
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardDescription>, KinesisClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<String, KinesisClientError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, KinesisClientError>;

    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordOutcome, KinesisClientError>;
}

/// Loads the shared AWS configuration honouring the region and endpoint overrides
pub async fn load_sdk_config(config: &Configuration) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint {
        loader = loader.endpoint_url(endpoint.as_str());
    }
    debug!(
        region = ?config.region,
        endpoint = ?config.endpoint,
        "Loading AWS SDK configuration"
    );
    loader.load().await
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardDescription>, KinesisClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name together with a continuation token
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };

            let response = request.send().await.map_err(|e| {
                let err = e.into_service_error();
                if err.is_resource_not_found_exception() {
                    KinesisClientError::ResourceNotFound(err.to_string())
                } else if err.is_limit_exceeded_exception() {
                    KinesisClientError::ThroughputExceeded
                } else {
                    KinesisClientError::Other(err.to_string())
                }
            })?;

            shards.extend(response.shards().iter().map(|shard| ShardDescription {
                shard_id: shard.shard_id().to_string(),
                parent_shard_id: shard.parent_shard_id().map(String::from),
                adjacent_parent_shard_id: shard.adjacent_parent_shard_id().map(String::from),
            }));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        trace!(stream = %stream_name, count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<String, KinesisClientError> {
        let mut request = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id);

        request = match position {
            IteratorPosition::TrimHorizon => request.shard_iterator_type(ShardIteratorType::TrimHorizon),
            IteratorPosition::Latest => request.shard_iterator_type(ShardIteratorType::Latest),
            IteratorPosition::AfterSequenceNumber(sequence) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(sequence),
        };

        let response = request.send().await.map_err(|e| {
            let err = e.into_service_error();
            if err.is_resource_not_found_exception() {
                KinesisClientError::ResourceNotFound(err.to_string())
            } else if err.is_provisioned_throughput_exceeded_exception() {
                KinesisClientError::ThroughputExceeded
            } else {
                KinesisClientError::Other(err.to_string())
            }
        })?;

        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| KinesisClientError::Other(format!("No iterator returned for shard {}", shard_id)))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, KinesisClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_expired_iterator_exception() {
                    KinesisClientError::ExpiredIterator
                } else if err.is_provisioned_throughput_exceeded_exception() {
                    KinesisClientError::ThroughputExceeded
                } else if err.is_resource_not_found_exception() {
                    KinesisClientError::ResourceNotFound(err.to_string())
                } else {
                    KinesisClientError::Other(err.to_string())
                }
            })?;

        Ok(RecordBatch {
            records: response.records().iter().map(StreamRecord::from).collect(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }

    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordOutcome, KinesisClientError> {
        let response = self
            .put_record()
            .stream_name(stream_name)
            .partition_key(partition_key)
            .data(Blob::new(data.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_resource_not_found_exception() {
                    KinesisClientError::ResourceNotFound(err.to_string())
                } else if err.is_provisioned_throughput_exceeded_exception() {
                    KinesisClientError::ThroughputExceeded
                } else {
                    KinesisClientError::Other(err.to_string())
                }
            })?;

        Ok(PutRecordOutcome {
            shard_id: response.shard_id().to_string(),
            sequence_number: response.sequence_number().to_string(),
        })
    }
}
