use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::{StoreError, StoreResult};

/// Logical connection epoch of a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session expires.
    Ephemeral,
}

/// Connection state transitions, delivered in order: `Lost` always precedes
/// the matching `RegainedAfterLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost,
    RegainedAfterLost,
}

/// Single write command accepted by [`CoordinationStore::execute_single`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
    },
}

impl StoreCommand {
    pub fn create_persistent(path: impl Into<String>) -> Self {
        StoreCommand::Create {
            path: path.into(),
            data: Vec::new(),
            mode: CreateMode::Persistent,
        }
    }

    pub fn create_ephemeral(path: impl Into<String>, data: Vec<u8>) -> Self {
        StoreCommand::Create {
            path: path.into(),
            data,
            mode: CreateMode::Ephemeral,
        }
    }
}

/// Client of a linearizable hierarchical key/value store.
///
/// Each instance is bound to one session. Ephemeral entries created through
/// it disappear when that session expires.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Session that owns the ephemeral entry at `path`, `None` for persistent or absent entries.
    async fn ephemeral_owner(&self, path: &str) -> StoreResult<Option<SessionId>>;

    /// Whether a leader-election entry exists for `name`. Older deployments
    /// elect task owners this way, so a hit means they are still contending.
    async fn election_path_exists(&self, name: &str) -> StoreResult<bool>;

    fn session_id(&self) -> SessionId;

    /// Best effort; `None` when the client cannot report it.
    fn session_timeout(&self) -> Option<Duration>;

    fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn execute_single(&self, command: StoreCommand) -> StoreResult<()> {
        match command {
            StoreCommand::Create { path, data, mode } => self.create(&path, &data, mode).await,
            StoreCommand::Delete { path } => self.delete(&path).await,
        }
    }

    /// Creates a persistent path, treating an existing one as success.
    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        match self.execute_single(StoreCommand::create_persistent(path)).await {
            Ok(()) | Err(StoreError::PathExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Deletes a path, treating an absent one as success.
    async fn delete_if_exists(&self, path: &str) -> StoreResult<()> {
        match self.delete(path).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
