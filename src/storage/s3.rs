//! Amazon S3 replica destination.
//!
//! Stores replicated versions as objects in a bucket:
//! ```text
//! s3://{bucket}/{prefix}/{state_key}/{version_id}
//! ```
//! Version metadata travels as object user metadata, so a replica can be
//! verified with a `HEAD` request.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use super::{ReplicaStore, Result, StorageError};
use crate::model::{object_key, VersionId, VersionMeta, VersionRecord};

const META_CONTENT_HASH: &str = "content-hash";
const META_KEY_ID: &str = "encryption-key-id";
const META_CREATED_AT: &str = "created-at";
const META_FENCING_TOKEN: &str = "fencing-token";

/// S3-based replica store.
pub struct S3ReplicaStore {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3ReplicaStore {
    /// Create a new S3 replica store.
    ///
    /// Uses default credentials from the environment (AWS_ACCESS_KEY_ID,
    /// AWS_SECRET_ACCESS_KEY, or IAM role). A custom endpoint enables
    /// S3-compatible services like MinIO.
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = config_loader.load().await;

        let client = match endpoint {
            Some(endpoint) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&config)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&config),
        };

        Ok(Self::with_client(name, client, bucket, prefix))
    }

    /// Create with explicit client (for testing).
    pub fn with_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn key_prefix(&self, state_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}/", prefix, state_key),
            None => format!("{}/", state_key),
        }
    }

    fn s3_key(&self, state_key: &str, version: VersionId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, object_key(state_key, version)),
            None => object_key(state_key, version),
        }
    }

    fn unavailable(&self, action: &str, e: impl std::fmt::Display) -> StorageError {
        StorageError::Unavailable(format!("S3 {} on {} failed: {}", action, self.bucket, e))
    }

    fn meta_from_object(
        state_key: &str,
        version: VersionId,
        size: u64,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<VersionMeta> {
        let field = |name: &str| {
            metadata
                .and_then(|m| m.get(name))
                .cloned()
                .ok_or_else(|| {
                    StorageError::Corrupt(format!(
                        "{} is missing metadata {}",
                        object_key(state_key, version),
                        name
                    ))
                })
        };

        let created_at = field(META_CREATED_AT)?;
        let fencing_token = field(META_FENCING_TOKEN)?;
        Ok(VersionMeta {
            state_key: state_key.to_string(),
            version_id: version,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| StorageError::Corrupt(format!("bad created-at: {}", e)))?,
            content_hash: field(META_CONTENT_HASH)?,
            encryption_key_id: field(META_KEY_ID)?,
            fencing_token: fencing_token
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("bad fencing-token {}", fencing_token)))?,
            size,
        })
    }

    async fn head_meta(&self, state_key: &str, version: VersionId) -> Result<Option<VersionMeta>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.s3_key(state_key, version))
            .send()
            .await;

        match response {
            Ok(head) => {
                let size = head.content_length().unwrap_or(0).max(0) as u64;
                Self::meta_from_object(state_key, version, size, head.metadata()).map(Some)
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(self.unavailable("head_object", e)),
        }
    }

    /// Version ids stored directly under the key's prefix, oldest first.
    async fn scan_versions(&self, state_key: &str) -> Result<Vec<VersionId>> {
        let prefix = self.key_prefix(state_key);
        let mut versions = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| self.unavailable("list_objects_v2", e))?;

            versions.extend(response.contents().iter().filter_map(|object| {
                object
                    .key()
                    .and_then(|key| key.strip_prefix(&prefix))
                    .and_then(|id| id.parse::<VersionId>().ok())
            }));

            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        versions.sort();
        Ok(versions)
    }
}

#[async_trait]
impl ReplicaStore for S3ReplicaStore {
    async fn put_replica(&self, record: &VersionRecord) -> Result<()> {
        let meta = &record.meta;

        if let Some(existing) = self.head_meta(&meta.state_key, meta.version_id).await? {
            if existing.content_hash != meta.content_hash {
                return Err(StorageError::Corrupt(format!(
                    "replica {} already holds {} with a different hash",
                    self.name,
                    meta.object_key()
                )));
            }
            debug!(object_key = %meta.object_key(), "Replica already present in S3");
            return Ok(());
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.s3_key(&meta.state_key, meta.version_id))
            .body(ByteStream::from(record.ciphertext.clone()))
            .metadata(META_CONTENT_HASH, &meta.content_hash)
            .metadata(META_KEY_ID, &meta.encryption_key_id)
            .metadata(
                META_CREATED_AT,
                meta.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            )
            .metadata(META_FENCING_TOKEN, meta.fencing_token.to_string())
            .send()
            .await
            .map_err(|e| self.unavailable("put_object", e))?;

        debug!(
            object_key = %meta.object_key(),
            size = record.ciphertext.len(),
            bucket = %self.bucket,
            "Stored replica in S3"
        );
        Ok(())
    }

    async fn get_replica(
        &self,
        state_key: &str,
        version: VersionId,
    ) -> Result<Option<VersionRecord>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.s3_key(state_key, version))
            .send()
            .await;

        let object = match response {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None)
            }
            Err(e) => return Err(self.unavailable("get_object", e)),
        };

        let metadata = object.metadata().cloned();
        let ciphertext = object
            .body
            .collect()
            .await
            .map_err(|e| self.unavailable("body read", e))?
            .into_bytes()
            .to_vec();

        let meta = Self::meta_from_object(
            state_key,
            version,
            ciphertext.len() as u64,
            metadata.as_ref(),
        )?;
        Ok(Some(VersionRecord { meta, ciphertext }))
    }

    async fn latest_replicated(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        match self.scan_versions(state_key).await?.last() {
            Some(version) => self.head_meta(state_key, *version).await,
            None => Ok(None),
        }
    }

    async fn list_replicated(&self, state_key: &str) -> Result<Vec<VersionId>> {
        self.scan_versions(state_key).await
    }

    async fn has_replica(&self, state_key: &str, version: VersionId) -> Result<bool> {
        Ok(self.head_meta(state_key, version).await?.is_some())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
