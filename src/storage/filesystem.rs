//! Filesystem replica destination.
//!
//! Stores each replicated version at its object key, with a metadata sidecar:
//! ```text
//! {base_path}/
//!   {state_key}/
//!     {version_id}        encrypted envelope
//!     {version_id}.json   version metadata
//! ```
//!
//! State key segments never start with a version id, so a key's directory
//! can't collide with a sibling key's version files.
//!
//! The metadata file is written last. A version without its `.json` is an
//! interrupted copy and is invisible to readers.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{ReplicaStore, Result, StorageError};
use crate::model::{VersionId, VersionMeta, VersionRecord};

/// Replica store on a local or mounted filesystem.
pub struct FilesystemReplicaStore {
    name: String,
    base_path: PathBuf,
}

impl FilesystemReplicaStore {
    /// Create a new filesystem replica store.
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(name: impl Into<String>, base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self {
            name: name.into(),
            base_path,
        })
    }

    fn key_dir(&self, state_key: &str) -> PathBuf {
        state_key
            .split('/')
            .fold(self.base_path.clone(), |path, segment| path.join(segment))
    }

    fn data_path(&self, state_key: &str, version: VersionId) -> PathBuf {
        self.key_dir(state_key).join(version.to_string())
    }

    fn meta_path(&self, state_key: &str, version: VersionId) -> PathBuf {
        self.key_dir(state_key).join(format!("{}.json", version))
    }

    async fn read_meta(&self, path: &Path) -> Result<Option<VersionMeta>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Version ids with a metadata sidecar, oldest first.
    async fn scan_versions(&self, state_key: &str) -> Result<Vec<VersionId>> {
        let mut entries = match fs::read_dir(self.key_dir(state_key)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let version = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<VersionId>().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Write atomically using temp file + rename.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut temp_name = path.file_name().map(OsString::from).unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        fs::write(&temp_path, bytes).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ReplicaStore for FilesystemReplicaStore {
    async fn put_replica(&self, record: &VersionRecord) -> Result<()> {
        let meta = &record.meta;
        let meta_path = self.meta_path(&meta.state_key, meta.version_id);

        if let Some(existing) = self.read_meta(&meta_path).await? {
            if existing.content_hash != meta.content_hash {
                return Err(StorageError::Corrupt(format!(
                    "replica {} already holds {} with a different hash",
                    self.name,
                    meta.object_key()
                )));
            }
            debug!(object_key = %meta.object_key(), "Replica already present");
            return Ok(());
        }

        fs::create_dir_all(self.key_dir(&meta.state_key)).await?;
        Self::write_atomic(
            &self.data_path(&meta.state_key, meta.version_id),
            &record.ciphertext,
        )
        .await?;
        Self::write_atomic(&meta_path, &serde_json::to_vec(meta)?).await?;

        debug!(
            object_key = %meta.object_key(),
            size = record.ciphertext.len(),
            "Stored replica"
        );
        Ok(())
    }

    async fn get_replica(
        &self,
        state_key: &str,
        version: VersionId,
    ) -> Result<Option<VersionRecord>> {
        let Some(meta) = self.read_meta(&self.meta_path(state_key, version)).await? else {
            return Ok(None);
        };
        let ciphertext = fs::read(self.data_path(state_key, version)).await?;
        Ok(Some(VersionRecord { meta, ciphertext }))
    }

    async fn latest_replicated(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        match self.scan_versions(state_key).await?.last() {
            Some(version) => self.read_meta(&self.meta_path(state_key, *version)).await,
            None => Ok(None),
        }
    }

    async fn list_replicated(&self, state_key: &str) -> Result<Vec<VersionId>> {
        self.scan_versions(state_key).await
    }

    async fn has_replica(&self, state_key: &str, version: VersionId) -> Result<bool> {
        Ok(self.read_meta(&self.meta_path(state_key, version)).await?.is_some())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
