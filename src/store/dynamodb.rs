//! DynamoDB-backed lease table
//!
//! One item per shard, keyed by `leaseKey`. Ownership changes use
//! conditional writes so two workers never both believe they hold a shard.

use crate::error::CheckpointError;
use crate::retry::{ExponentialBackoff, RetryConfig, RetryHandle};
use crate::store::{CheckpointStore, ExtendedSequenceNumber, Lease};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    types::{
        AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
        ScalarAttributeType, TableStatus,
    },
    Client as DynamoClient,
};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{Configuration, DEFAULT_LEASE_FAILOVER};

const LEASE_KEY: &str = "leaseKey";
const LEASE_OWNER: &str = "leaseOwner";
const LEASE_COUNTER: &str = "leaseCounter";
const CHECKPOINT: &str = "checkpoint";
const CHECKPOINT_SUB_SEQUENCE: &str = "checkpointSubSequenceNumber";
const LAST_RENEWAL: &str = "lastRenewal";

const TABLE_ACTIVE_POLL: Duration = Duration::from_secs(1);
const TABLE_ACTIVE_ATTEMPTS: u32 = 60;

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    failover: Duration,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::new()
    }

    pub fn new(client: DynamoClient) -> Self {
        Self {
            client,
            failover: DEFAULT_LEASE_FAILOVER,
            retry_config: RetryConfig::default(),
            backoff: default_backoff(),
        }
    }

    /// Store whose lease failover follows `leaseFailoverMs`
    pub fn from_configuration(client: DynamoClient, config: &Configuration) -> Self {
        Self {
            failover: config.lease_failover,
            ..Self::new(client)
        }
    }

    pub fn failover(&self) -> Duration {
        self.failover
    }

    fn retry_handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.retry_config.clone(), self.backoff.clone())
    }

    async fn table_is_active(&self, lease_table: &str) -> anyhow::Result<bool> {
        let response = self
            .client
            .describe_table()
            .table_name(lease_table)
            .send()
            .await
            .context("Failed to describe lease table")?;
        Ok(response
            .table()
            .and_then(|t| t.table_status())
            .map(|status| *status == TableStatus::Active)
            .unwrap_or(false))
    }
}

fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(5))
        .build()
}

fn key(shard_id: &str) -> Item {
    HashMap::from([(LEASE_KEY.to_string(), AttributeValue::S(shard_id.to_string()))])
}

fn number(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn lease_from_item(item: &Item) -> anyhow::Result<Lease> {
    let shard_id = item
        .get(LEASE_KEY)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("lease item without {}", LEASE_KEY))?
        .clone();

    let read_number = |name: &str| -> anyhow::Result<Option<i64>> {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .map(|n| n.parse::<i64>().with_context(|| format!("invalid {} '{}'", name, n)))
            .transpose()
    };

    let sub_sequence = read_number(CHECKPOINT_SUB_SEQUENCE)?.unwrap_or(0).max(0) as u64;
    let checkpoint = item
        .get(CHECKPOINT)
        .and_then(|v| v.as_s().ok())
        .map(|cp| ExtendedSequenceNumber::from_parts(cp, sub_sequence));

    Ok(Lease {
        shard_id,
        owner: item.get(LEASE_OWNER).and_then(|v| v.as_s().ok()).cloned(),
        counter: read_number(LEASE_COUNTER)?.unwrap_or(0).max(0) as u64,
        checkpoint,
        last_renewal_millis: read_number(LAST_RENEWAL)?.unwrap_or(0),
    })
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self))]
    async fn prepare(&self, lease_table: &str) -> anyhow::Result<()> {
        let attribute = AttributeDefinition::builder()
            .attribute_name(LEASE_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name(LEASE_KEY)
            .key_type(KeyType::Hash)
            .build()?;

        match self
            .client
            .create_table()
            .table_name(lease_table)
            .attribute_definitions(attribute)
            .key_schema(key_schema)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
        {
            Ok(_) => info!("Created lease table"),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_resource_in_use_exception() {
                    trace!("Lease table already exists");
                } else {
                    return Err(anyhow::Error::new(err).context("Failed to create lease table"));
                }
            }
        }

        for _ in 0..TABLE_ACTIVE_ATTEMPTS {
            if self.table_is_active(lease_table).await? {
                debug!("Lease table is active");
                return Ok(());
            }
            tokio::time::sleep(TABLE_ACTIVE_POLL).await;
        }
        anyhow::bail!("lease table {} did not become active", lease_table)
    }

    #[instrument(skip(self))]
    async fn list_leases(&self, lease_table: &str) -> anyhow::Result<Vec<Lease>> {
        let mut leases = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let request = self
                .client
                .scan()
                .table_name(lease_table)
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take());

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = e.into_service_error();
                    if err.is_resource_not_found_exception() {
                        debug!("Lease table does not exist");
                        return Ok(Vec::new());
                    }
                    return Err(anyhow::Error::new(err).context("Failed to scan lease table"));
                }
            };

            for item in response.items() {
                leases.push(lease_from_item(item)?);
            }

            match response.last_evaluated_key() {
                Some(last) if !last.is_empty() => start_key = Some(last.clone()),
                _ => break,
            }
        }

        trace!(count = leases.len(), "Listed leases from DynamoDB");
        Ok(leases)
    }

    async fn get_lease(&self, lease_table: &str, shard_id: &str) -> anyhow::Result<Option<Lease>> {
        let response = self
            .retry_handle()
            .retry(|| {
                let request = self
                    .client
                    .get_item()
                    .table_name(lease_table)
                    .set_key(Some(key(shard_id)))
                    .consistent_read(true);
                async move { request.send().await }
            })
            .await
            .context("Failed to get lease from DynamoDB")?;

        response.item().map(lease_from_item).transpose()
    }

    #[instrument(skip(self))]
    async fn take_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool> {
        let now = Utc::now().timestamp_millis();

        let Some(current) = self.get_lease(lease_table, shard_id).await? else {
            let result = self
                .client
                .put_item()
                .table_name(lease_table)
                .item(LEASE_KEY, AttributeValue::S(shard_id.to_string()))
                .item(LEASE_OWNER, AttributeValue::S(owner.to_string()))
                .item(LEASE_COUNTER, number(1))
                .item(LAST_RENEWAL, number(now))
                .condition_expression("attribute_not_exists(#key)")
                .expression_attribute_names("#key", LEASE_KEY)
                .send()
                .await;

            return match result {
                Ok(_) => {
                    debug!("Created and took lease");
                    Ok(true)
                }
                Err(e) => {
                    let err = e.into_service_error();
                    if err.is_conditional_check_failed_exception() {
                        trace!("Lease created concurrently by another worker");
                        Ok(false)
                    } else {
                        Err(anyhow::Error::new(err).context("Failed to create lease"))
                    }
                }
            };
        };

        if !current.is_available_to(owner, now, self.failover.as_millis() as i64) {
            trace!(current_owner = ?current.owner, "Lease held by another worker");
            return Ok(false);
        }

        let result = self
            .client
            .update_item()
            .table_name(lease_table)
            .set_key(Some(key(shard_id)))
            .update_expression("SET #owner = :owner, #counter = :next, #renewal = :now")
            .condition_expression("#counter = :expected")
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_names("#renewal", LAST_RENEWAL)
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .expression_attribute_values(":next", number(current.counter + 1))
            .expression_attribute_values(":expected", number(current.counter))
            .expression_attribute_values(":now", number(now))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(previous_owner = ?current.owner, "Took lease");
                Ok(true)
            }
            Err(e) => {
                let err = e.into_service_error();
                if err.is_conditional_check_failed_exception() {
                    trace!("Lease changed while taking it");
                    Ok(false)
                } else {
                    Err(anyhow::Error::new(err).context("Failed to take lease"))
                }
            }
        }
    }

    async fn renew_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<bool> {
        let result = self
            .client
            .update_item()
            .table_name(lease_table)
            .set_key(Some(key(shard_id)))
            .update_expression("SET #counter = #counter + :one, #renewal = :now")
            .condition_expression("#owner = :owner")
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_names("#counter", LEASE_COUNTER)
            .expression_attribute_names("#renewal", LAST_RENEWAL)
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .expression_attribute_values(":one", number(1))
            .expression_attribute_values(":now", number(Utc::now().timestamp_millis()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_conditional_check_failed_exception() {
                    Ok(false)
                } else {
                    Err(anyhow::Error::new(err).context("Failed to renew lease"))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, lease_table: &str, shard_id: &str, owner: &str) -> anyhow::Result<()> {
        let result = self
            .client
            .update_item()
            .table_name(lease_table)
            .set_key(Some(key(shard_id)))
            .update_expression("REMOVE #owner")
            .condition_expression("#owner = :owner")
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Released lease");
                Ok(())
            }
            Err(e) => {
                let err = e.into_service_error();
                if err.is_conditional_check_failed_exception() {
                    trace!("Lease no longer ours, nothing to release");
                    Ok(())
                } else {
                    Err(anyhow::Error::new(err).context("Failed to release lease"))
                }
            }
        }
    }

    #[instrument(skip(self), fields(checkpoint = %checkpoint))]
    async fn update_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        owner: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> Result<(), CheckpointError> {
        let (value, sub_sequence) = checkpoint.to_parts();

        let result = self
            .client
            .update_item()
            .table_name(lease_table)
            .set_key(Some(key(shard_id)))
            .update_expression("SET #checkpoint = :checkpoint, #sub = :sub")
            .condition_expression("#owner = :owner")
            .expression_attribute_names("#checkpoint", CHECKPOINT)
            .expression_attribute_names("#sub", CHECKPOINT_SUB_SEQUENCE)
            .expression_attribute_names("#owner", LEASE_OWNER)
            .expression_attribute_values(":checkpoint", AttributeValue::S(value))
            .expression_attribute_values(":sub", number(sub_sequence))
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Checkpoint saved to DynamoDB");
                Ok(())
            }
            Err(e) => {
                let err = e.into_service_error();
                if err.is_conditional_check_failed_exception() {
                    Err(CheckpointError::InvalidState(format!(
                        "lease for {} is not held by {}",
                        shard_id, owner
                    )))
                } else if err.is_provisioned_throughput_exceeded_exception() {
                    Err(CheckpointError::Throttling(err.to_string()))
                } else {
                    warn!(error = %err, "Checkpoint write failed");
                    Err(CheckpointError::Store(anyhow::Error::new(err)))
                }
            }
        }
    }

    #[instrument(skip(self), fields(checkpoint = %checkpoint))]
    async fn reset_checkpoint(
        &self,
        lease_table: &str,
        shard_id: &str,
        checkpoint: &ExtendedSequenceNumber,
    ) -> anyhow::Result<()> {
        let (value, sub_sequence) = checkpoint.to_parts();

        self.retry_handle()
            .retry(|| {
                let request = self
                    .client
                    .update_item()
                    .table_name(lease_table)
                    .set_key(Some(key(shard_id)))
                    .update_expression("SET #checkpoint = :checkpoint, #sub = :sub")
                    .condition_expression("attribute_exists(#key)")
                    .expression_attribute_names("#checkpoint", CHECKPOINT)
                    .expression_attribute_names("#sub", CHECKPOINT_SUB_SEQUENCE)
                    .expression_attribute_names("#key", LEASE_KEY)
                    .expression_attribute_values(":checkpoint", AttributeValue::S(value.clone()))
                    .expression_attribute_values(":sub", number(sub_sequence));
                async move { request.send().await }
            })
            .await
            .with_context(|| format!("Failed to reset checkpoint of {}", shard_id))?;

        debug!("Checkpoint overwritten in DynamoDB");
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    failover: Duration,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl Default for DynamoDbCheckpointStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            failover: DEFAULT_LEASE_FAILOVER,
            retry_config: RetryConfig::default(),
            backoff: default_backoff(),
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    /// How long a lease may go unrenewed before it can be taken over
    pub fn with_failover(mut self, failover: Duration) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        Ok(DynamoDbCheckpointStore {
            client: self.client.ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            failover: self.failover,
            retry_config: self.retry_config,
            backoff: self.backoff,
        })
    }
}
