//! Cluster-wide bookkeeping of which query node holds which profile.
//!
//! The coordination layer is split in two:
//!
//! - A [`CoordinationService`] is a thin client for a strongly consistent, hierarchical key-value
//!   service with session-scoped ephemeral nodes, atomic multi-operation transactions, a
//!   distributed mutex and connection state notifications (a ZooKeeper-class system).
//!   [`InMemoryCoordination`] implements it in-process for tests and simulations.
//!
//! - The [`CoordinationBackend`] layers the residency protocol on top of such a service. It owns
//!   the following namespace, rooted at an optional namespace prefix:
//!
//!   ```text
//!   /nodesInfo/{ip}:{port}                   ephemeral, NodeLoadRecord of that node
//!   /profilesLoadStatus/{base32(profile)}    ephemeral, ResidencyRecord naming the owner
//!   /global_mutex                            distributed mutex
//!   ```
//!
//!   Every read-modify-write sequence on these records happens while holding the global mutex.
//!   The backend tracks the connection state of the service and fails fast with
//!   [`CoordinationError::NotConnected`] while disconnected. After a session loss it re-creates
//!   all records this node is responsible for before it reports itself as connected again.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

mod backend;
mod memory;
mod records;

pub use backend::*;
pub use memory::*;
pub use records::*;

/// Identifies one client session with the coordination service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifetime of a node in the coordination service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
}

/// Metadata about an existing node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStat {
    /// The session owning this node, if it is ephemeral.
    pub ephemeral_owner: Option<SessionId>,
    /// Number of times the data of the node was changed.
    pub version: u64,
}

/// A single operation within an atomic [`CoordinationService::commit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
}

/// Connection state changes reported by a [`CoordinationService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The first successful connection.
    Connected,
    /// The connection was interrupted, the session may still be alive.
    Suspended,
    /// The connection was re-established after being suspended or lost.
    Reconnected,
    /// The session expired, all ephemeral nodes of the session are gone.
    Lost,
    /// Connected to a server that only serves reads.
    ReadOnly,
}

/// Errors reported by a [`CoordinationService`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("node `{0}` does not exist")]
    NoNode(String),
    #[error("node `{0}` already exists")]
    NodeExists(String),
    #[error("node `{0}` has children")]
    NotEmpty(String),
    #[error("connection to the coordination service lost")]
    ConnectionLoss,
    #[error("coordination session expired")]
    SessionExpired,
}

/// A client for a ZooKeeper-class coordination service.
///
/// Implementations must provide atomic transactions, session-scoped ephemeral nodes and a mutex
/// that is exclusive across all clients of the service.
#[async_trait]
pub trait CoordinationService: Send + Sync + fmt::Debug + 'static {
    /// Creates a node, optionally creating missing parents as persistent nodes.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<(), ServiceError>;

    /// Returns the data of a node, or `None` if it does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, ServiceError>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), ServiceError>;

    /// Returns metadata about a node, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, ServiceError>;

    /// Checks the existence of many nodes with as few round-trips as the service allows.
    async fn exists_many(&self, paths: &[String]) -> Result<Vec<Option<NodeStat>>, ServiceError> {
        let mut stats = Vec::with_capacity(paths.len());
        for path in paths {
            stats.push(self.exists(path).await?);
        }
        Ok(stats)
    }

    async fn delete(&self, path: &str) -> Result<(), ServiceError>;

    /// Applies all operations atomically, or none of them.
    async fn commit(&self, ops: Vec<Op>) -> Result<(), ServiceError>;

    /// Waits until the mutex at `path` is held by this client.
    ///
    /// Dropping the returned future before it resolves abandons the acquisition.
    async fn acquire_mutex(&self, path: &str) -> Result<(), ServiceError>;

    /// Releases a mutex previously acquired by this client.
    fn release_mutex(&self, path: &str) -> Result<(), ServiceError>;

    /// The current session, if connected.
    fn session_id(&self) -> Option<SessionId>;

    fn is_connected(&self) -> bool;

    /// The negotiated session timeout.
    fn session_timeout(&self) -> Duration;

    /// Subscribes to connection state changes.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Errors of the [`CoordinationBackend`].
#[derive(Clone, Debug, Error)]
pub enum CoordinationError {
    /// The backend is disconnected from the coordination service.
    #[error("not connected to the coordination service (session lost: {session_lost})")]
    NotConnected { session_lost: bool },
    /// The global mutex could not be acquired in time.
    #[error("failed to acquire the global mutex within {0:?}")]
    LockTimeout(Duration),
    /// An operation that requires the global mutex was attempted without holding it.
    #[error("the global mutex is not held by this process")]
    LockNotHeld,
    /// A single request to the coordination service did not complete in time.
    #[error("coordination request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("malformed record at `{path}`: {details}")]
    MalformedRecord { path: String, details: String },
    /// The load record of this node is gone although the session is alive.
    #[error("node record `{0}` is missing")]
    NodeRecordMissing(String),
}
