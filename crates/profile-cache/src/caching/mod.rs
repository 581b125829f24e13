//! # Cluster-aware profile caching
//!
//! Loading an aggregated profile means fetching and decoding a multi-megabyte blob, so query nodes
//! keep loaded profiles in memory. No node can hold every profile, and loading the same profile on
//! several nodes at once wastes memory and time. This module makes sure that:
//!
//! - at most one node of the cluster loads a given profile at any time,
//! - any node can find out which node already holds a profile and redirect there,
//! - local memory and the cluster-wide residency records are cleaned up together when a profile is
//!   evicted, including across connection loss to the coordination service.
//!
//! ## Layers
//!
//! - The [`LocalStore`] is a bounded in-memory cache of [`ProfileHandle`]s, plus a second bounded
//!   cache of views derived from those profiles. A pending handle means "being loaded by this node".
//!   Views are registered as dependents of their profile and are invalidated together with it.
//! - The [`CoordinationBackend`](crate::coordination::CoordinationBackend) records which node holds
//!   which profile in a coordination service.
//! - The [`CacheCoordinator`] ties both together. On a local miss it takes the global mutex,
//!   consults the residency records, and either redirects the caller to the owning node or starts
//!   the single load of the profile on this node.
//!
//! Callers are never queued behind a load. A request for a profile that is still loading fails
//! with [`ProfileCacheError::LoadInProgress`] and is expected to be retried.
//!
//! ### Metrics
//!
//! - `profiles.access`: All profile requests.
//! - `profiles.hit`: Requests served from the local store.
//! - `profiles.redirect`: Requests for profiles held by another node.
//! - `profiles.load.started`, `profiles.load.failed`, `profiles.load.duration`: Profile loads.
//! - `profiles.evicted`: Evicted profiles, tagged with the eviction `cause`.
//! - `views.hit`, `views.computed`: View requests served from the view cache, or computed.
//! - `coordination.cleanup.failed`: Residency cleanups after eviction that did not succeed.
//! - `coordination.lock.wait`, `coordination.state`, `coordination.reinit` and
//!   `coordination.reinit.profiles` are emitted by the coordination backend.

use async_trait::async_trait;

use crate::types::ProfileKey;

mod coordinator;
mod error;
mod handle;
mod local_store;


pub use coordinator::*;
pub use error::*;
pub use handle::*;
pub use local_store::*;

/// Something held in one of the bounded caches.
pub trait Cacheable: Send + Sync + 'static {
    /// The weight of this item against the capacity of its cache.
    fn utilization_weight(&self) -> u32 {
        1
    }
}

/// A loaded, aggregated profile.
pub trait Profile: Cacheable {
    /// Describes the samples of one trace within the profile.
    type SampleContext: Send + 'static;

    /// Returns the sample context of `trace`, if the profile contains it.
    fn sample_context(&self, trace: &str) -> Option<Self::SampleContext>;
}

/// Loads aggregated profiles from storage.
#[async_trait]
pub trait ProfileLoader<P>: Send + Sync + 'static {
    async fn load(&self, key: &ProfileKey) -> Result<P, LoadError>;
}

/// Derives a view from a loaded profile.
///
/// Views are built synchronously on a blocking worker thread.
pub trait ViewBuilder<P, V>: Send + Sync + 'static {
    fn build_view(&self, profile: &P, trace: &str) -> V;
}

impl<P, V, F> ViewBuilder<P, V> for F
where
    F: Fn(&P, &str) -> V + Send + Sync + 'static,
{
    fn build_view(&self, profile: &P, trace: &str) -> V {
        self(profile, trace)
    }
}
