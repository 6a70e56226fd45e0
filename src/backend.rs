//! Wiring of a complete backend from configuration.
//!
//! Opens the configured storage, builds the envelope cipher from the
//! configured keys, connects the state store's commit events to a replication
//! agent and runs a reconcile pass so versions committed before a restart
//! still reach the replica.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, EncryptionConfig};
use crate::crypto::{CryptoError, EnvelopeCipher, KeyProvider, LocalKeyring};
use crate::lock::LockManager;
use crate::replication::{
    commit_channel, create_alert_sink, BackupValidator, ReplicationAgent, ReplicationError,
};
use crate::state_store::StateStore;
use crate::storage::{init_replica_store, init_storage, StorageError};

/// Errors raised while opening a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
}

/// A running backend: state store, lock manager and replication.
pub struct StateBackend {
    store: StateStore,
    agent: ReplicationAgent,
    validator: BackupValidator,
    agent_task: JoinHandle<()>,
}

impl StateBackend {
    /// Open every component described by `config` and start replication.
    pub async fn open(config: &Config) -> Result<Self, BackendError> {
        config.validate()?;

        let (versions, lock_table) = init_storage(&config.storage).await?;
        let replica = init_replica_store(&config.replica).await?;
        let alerts = create_alert_sink(config.alerts.as_ref());
        let cipher = EnvelopeCipher::new(key_provider(&config.encryption)?);

        let mut locks = LockManager::new(lock_table);
        if let Some(timeout) = config.state.request_timeout() {
            locks = locks.with_timeout(timeout);
        }

        let agent = ReplicationAgent::new(
            versions.clone(),
            replica.clone(),
            alerts.clone(),
            config.replication.clone(),
        );
        let (events, receiver) = commit_channel();
        let agent_task = agent.spawn(receiver);

        let store = StateStore::new(versions.clone(), locks, cipher)
            .with_config(config.state.store_config())
            .with_commit_events(events);

        let mut validator = BackupValidator::new(versions, replica, alerts)
            .with_max_lag(config.validator.max_lag());
        if let Some(retention) = config.validator.min_retention() {
            validator = validator.with_min_retention(retention);
        }

        match agent.reconcile().await {
            Ok(0) => {}
            Ok(queued) => info!(queued, "Queued versions missing from the replica"),
            Err(e) => warn!(error = %e, "Startup reconcile failed; will retry on next pass"),
        }

        info!(destination = %agent.destination(), "State backend ready");
        Ok(Self {
            store,
            agent,
            validator,
            agent_task,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        self.store.locks()
    }

    pub fn replication(&self) -> &ReplicationAgent {
        &self.agent
    }

    pub fn validator(&self) -> &BackupValidator {
        &self.validator
    }

    /// Wait for in-flight replication to settle, then stop the agent.
    ///
    /// Versions whose events were not yet consumed are picked up by the
    /// reconcile pass of the next `open`.
    pub async fn shutdown(self) {
        self.agent.drain().await;
        self.agent_task.abort();
        info!("State backend stopped");
    }
}

fn key_provider(config: &EncryptionConfig) -> Result<Arc<dyn KeyProvider>, BackendError> {
    if config.keys.is_empty() {
        warn!(
            key_id = %config.active_key,
            "No encryption keys configured; generated an ephemeral key. Stored state will be unreadable after restart"
        );
        return Ok(Arc::new(LocalKeyring::generate(config.active_key.clone())));
    }
    let keyring = LocalKeyring::from_encoded(
        &config.active_key,
        config
            .keys
            .iter()
            .map(|(id, material)| (id.as_str(), material.as_str())),
    )?;
    Ok(Arc::new(keyring))
}
