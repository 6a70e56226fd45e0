//! DynamoDB LockTable implementation.
//!
//! Table schema:
//! - PK: `state_key` (String)
//! - `holder_id` (String, absent when released)
//! - `acquired_at`, `expires_at`: epoch milliseconds (Number, optional)
//! - `fencing_token`, `revision` (Number)
//!
//! Conditional writes use `attribute_not_exists(state_key)` for new rows and
//! `#rev = :rev` for updates.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use super::{LockTable, Result, StorageError};
use crate::model::LockEntry;

/// DynamoDB implementation of LockTable.
pub struct DynamoLockTable {
    client: Client,
    table_name: String,
}

impl DynamoLockTable {
    /// Create a new DynamoDB lock table.
    pub async fn new(table_name: impl Into<String>, endpoint_url: Option<&str>) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let client = if let Some(endpoint) = endpoint_url {
            let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(dynamo_config)
        } else {
            Client::new(&config)
        };

        let table_name = table_name.into();
        info!(table = %table_name, "Connected to DynamoDB for locks");

        Ok(Self { client, table_name })
    }

    fn to_item(entry: LockEntry) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::new();
        item.insert("state_key".to_string(), AttributeValue::S(entry.state_key));
        if let Some(holder) = entry.holder_id {
            item.insert("holder_id".to_string(), AttributeValue::S(holder));
        }
        if let Some(acquired_at) = entry.acquired_at {
            item.insert(
                "acquired_at".to_string(),
                AttributeValue::N(acquired_at.timestamp_millis().to_string()),
            );
        }
        if let Some(expires_at) = entry.expires_at {
            item.insert(
                "expires_at".to_string(),
                AttributeValue::N(expires_at.timestamp_millis().to_string()),
            );
        }
        item.insert(
            "fencing_token".to_string(),
            AttributeValue::N(entry.fencing_token.to_string()),
        );
        item.insert(
            "revision".to_string(),
            AttributeValue::N(entry.revision.to_string()),
        );
        item
    }

    fn from_item(item: &HashMap<String, AttributeValue>) -> Result<LockEntry> {
        let string = |name: &str| match item.get(name) {
            Some(AttributeValue::S(value)) => Some(value.clone()),
            _ => None,
        };
        let number = |name: &str| -> Result<Option<i64>> {
            match item.get(name) {
                Some(AttributeValue::N(value)) => value
                    .parse()
                    .map(Some)
                    .map_err(|_| StorageError::Corrupt(format!("bad {} {:?}", name, value))),
                _ => Ok(None),
            }
        };
        let millis = |name: &str| -> Result<Option<DateTime<Utc>>> {
            number(name)?
                .map(|ms| {
                    Utc.timestamp_millis_opt(ms)
                        .single()
                        .ok_or_else(|| StorageError::Corrupt(format!("bad {} {}", name, ms)))
                })
                .transpose()
        };
        let counter = |name: &str| -> Result<u64> {
            number(name)?
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| StorageError::Corrupt(format!("missing {}", name)))
        };

        Ok(LockEntry {
            state_key: string("state_key")
                .ok_or_else(|| StorageError::Corrupt("missing state_key".to_string()))?,
            holder_id: string("holder_id"),
            acquired_at: millis("acquired_at")?,
            expires_at: millis("expires_at")?,
            fencing_token: counter("fencing_token")?,
            revision: counter("revision")?,
        })
    }
}

#[async_trait]
impl LockTable for DynamoLockTable {
    async fn load(&self, state_key: &str) -> Result<Option<LockEntry>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("state_key", AttributeValue::S(state_key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("DynamoDB get_item failed: {}", e)))?;

        result.item.as_ref().map(Self::from_item).transpose()
    }

    async fn put_if(&self, entry: LockEntry, expected_revision: Option<u64>) -> Result<bool> {
        let state_key = entry.state_key.clone();
        let request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::to_item(entry)));

        let request = match expected_revision {
            None => request.condition_expression("attribute_not_exists(state_key)"),
            Some(revision) => request
                .condition_expression("#rev = :rev")
                .expression_attribute_names("#rev", "revision")
                .expression_attribute_values(":rev", AttributeValue::N(revision.to_string())),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                debug!(state_key = %state_key, "Lock row condition failed");
                Ok(false)
            }
            Err(e) => Err(StorageError::Unavailable(format!(
                "DynamoDB put_item failed: {}",
                e
            ))),
        }
    }
}
