//! Operational alerts for replication failures and backup lag.
//!
//! Alerts are the durable escalation path: a job that exhausts its retries
//! is never dropped silently. Sinks:
//! - `LogAlertSink`: `error!` log line, used when nothing is configured
//! - `ChannelAlertSink`: in-memory channel, for tests and embedding
//! - `FileAlertSink`: append-only JSON lines file, fsynced per alert

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::AlertSinkConfig;
use crate::model::VersionId;

/// Errors that can occur while raising an alert.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert channel closed")]
    ChannelClosed,

    #[error("Failed to write alert: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A replication job exhausted its retry bound.
    ReplicationFailed,
    /// A key has versions but the replica holds none of them.
    NotReplicated,
    /// The oldest unreplicated version is older than the allowed lag.
    ReplicationLagging,
    /// A replicated version sits above a missing predecessor.
    ReplicaGap,
    /// The replica does not reach back as far as the minimum retention.
    RetentionShort,
    /// A backup check could not be completed.
    ValidationError,
}

/// An alert raised to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAlert {
    pub kind: AlertKind,
    pub state_key: String,
    pub version: Option<VersionId>,
    pub destination: String,
    pub attempts: u32,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl ReplicationAlert {
    pub fn new(
        kind: AlertKind,
        state_key: impl Into<String>,
        destination: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            state_key: state_key.into(),
            version: None,
            destination: destination.into(),
            attempts: 0,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: VersionId) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Destination for operational alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Raise an alert.
    async fn raise(&self, alert: ReplicationAlert) -> Result<(), AlertError>;
}

/// Alert sink that only logs. Used when no sink is configured.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: ReplicationAlert) -> Result<(), AlertError> {
        error!(
            kind = ?alert.kind,
            state_key = %alert.state_key,
            version = ?alert.version,
            destination = %alert.destination,
            attempts = alert.attempts,
            message = %alert.message,
            "Replication alert"
        );
        Ok(())
    }
}

/// In-memory alert sink using a channel.
pub struct ChannelAlertSink {
    sender: mpsc::UnboundedSender<ReplicationAlert>,
}

impl ChannelAlertSink {
    /// Create a new channel-based alert sink.
    ///
    /// Returns the sink and a receiver for consuming alerts.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplicationAlert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn raise(&self, alert: ReplicationAlert) -> Result<(), AlertError> {
        debug!(kind = ?alert.kind, state_key = %alert.state_key, "Publishing alert to channel");
        self.sender
            .send(alert)
            .map_err(|_| AlertError::ChannelClosed)
    }
}

/// Alert sink appending JSON lines to a file.
pub struct FileAlertSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAlertSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertSink for FileAlertSink {
    async fn raise(&self, alert: ReplicationAlert) -> Result<(), AlertError> {
        let mut line = serde_json::to_vec(&alert)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        info!(
            kind = ?alert.kind,
            state_key = %alert.state_key,
            path = %self.path.display(),
            "Recorded alert"
        );
        Ok(())
    }
}

/// Create an alert sink based on configuration.
///
/// Returns `LogAlertSink` if nothing is configured.
pub fn create_alert_sink(config: Option<&AlertSinkConfig>) -> Arc<dyn AlertSink> {
    match config {
        Some(AlertSinkConfig::File { path }) => Arc::new(FileAlertSink::new(path)),
        Some(AlertSinkConfig::Log) => Arc::new(LogAlertSink),
        None => {
            debug!("No alert sink configured, using log sink");
            Arc::new(LogAlertSink)
        }
    }
}
