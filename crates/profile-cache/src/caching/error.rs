use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::types::{NodeAddr, ProfileKey, WorkType};

/// The error type of a failed [`ProfileLoader::load`](super::ProfileLoader::load).
pub type LoadError = anyhow::Error;

/// An error returned when requesting a profile or a view from the [`CacheCoordinator`].
///
/// [`CacheCoordinator`]: super::CacheCoordinator
#[derive(Debug, Clone, Error)]
pub enum ProfileCacheError {
    /// The profile is being loaded by this node right now.
    ///
    /// Callers should retry after a delay.
    #[error("profile {0} is being loaded")]
    LoadInProgress(ProfileKey),
    /// The profile is not held by this node.
    ///
    /// If `owner` is set, another node holds the profile and callers should be redirected there.
    /// Otherwise it is not cached anywhere.
    #[error("profile not found locally{}", owner_suffix(.owner))]
    NotFoundLocally { owner: Option<NodeAddr> },
    /// Loading the profile failed.
    ///
    /// The failure is cached alongside the profile key until the entry is evicted.
    #[error("failed to load profile: {0:#}")]
    LoadFailed(Arc<LoadError>),
    /// This node lost its connection to the coordination service.
    #[error("coordination service unavailable")]
    CoordinationUnavailable,
    /// The global mutex could not be acquired in time.
    #[error("failed to acquire the global mutex within {0:?}")]
    LockAcquisitionTimeout(Duration),
    /// Views cannot be built for profiles of this work type.
    #[error("views are not supported for {0}")]
    UnsupportedWorkType(WorkType),
    /// Any other failure of the coordination service.
    #[error("coordination failed")]
    Coordination(#[source] CoordinationError),
    /// The worker task computing the result panicked or was shut down.
    #[error("worker task canceled")]
    Canceled,
}

fn owner_suffix(owner: &Option<NodeAddr>) -> String {
    match owner {
        Some(owner) => format!(", cached by {owner}"),
        None => String::new(),
    }
}

impl From<CoordinationError> for ProfileCacheError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::NotConnected { .. } => Self::CoordinationUnavailable,
            CoordinationError::LockTimeout(timeout) => Self::LockAcquisitionTimeout(timeout),
            err => Self::Coordination(err),
        }
    }
}

impl From<tokio::task::JoinError> for ProfileCacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = &err as &dyn std::error::Error, "Worker task failed");
        Self::Canceled
    }
}

/// How a caller of the cache should respond to a [`ProfileCacheError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Try again later, the result may become available.
    Retry,
    /// Ask the given node instead.
    Redirect(NodeAddr),
    /// The profile is not cached anywhere.
    NotFound,
    /// The request failed for good.
    Failed,
}

impl ProfileCacheError {
    /// Classifies the error for the request handling layer.
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            Self::LoadInProgress(_)
            | Self::CoordinationUnavailable
            | Self::LockAcquisitionTimeout(_) => ErrorDisposition::Retry,
            Self::NotFoundLocally { owner: Some(owner) } => {
                ErrorDisposition::Redirect(owner.clone())
            }
            Self::NotFoundLocally { owner: None } => ErrorDisposition::NotFound,
            Self::LoadFailed(_)
            | Self::UnsupportedWorkType(_)
            | Self::Coordination(_)
            | Self::Canceled => ErrorDisposition::Failed,
        }
    }

    /// The original loader error if this is a cached load failure.
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::LoadFailed(err) => Some(err),
            _ => None,
        }
    }
}
