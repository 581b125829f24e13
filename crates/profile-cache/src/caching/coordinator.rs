use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::FutureExt;
use tokio::runtime::Handle;

use crate::config::Config;
use crate::coordination::{CoordinationBackend, CoordinationError, CoordinationService};
use crate::types::{ProfileKey, ViewKey, ViewKind};

use super::{
    CallbackAlreadyRegistered, Cacheable, EvictionCause, LoadError, LocalStore, Profile,
    ProfileCacheError, ProfileHandle, ProfileLoader, ViewBuilder,
};

/// A view together with the sample context of the trace it was requested for.
///
/// The context is `None` if the profile has no samples for the trace.
pub type ViewResult<P, V> = (Option<<P as Profile>::SampleContext>, Arc<V>);

struct CoordinatorInner<P, V> {
    store: Arc<LocalStore<P, V>>,
    backend: Arc<CoordinationBackend>,
    runtime: Handle,
}

/// Serves profiles and views from the [`LocalStore`], making sure each profile is loaded by at
/// most one node of the cluster.
///
/// See the [module docs](super) for the protocol.
pub struct CacheCoordinator<P, V> {
    inner: Arc<CoordinatorInner<P, V>>,
}

impl<P, V> Clone for CacheCoordinator<P, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, V> fmt::Debug for CacheCoordinator<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("node", self.inner.backend.node())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<P: Profile, V: Cacheable> CacheCoordinator<P, V> {
    /// Creates a coordinator and registers its eviction cleanup on `store`.
    ///
    /// The coordinator is not usable before [`start`](Self::start) was awaited.
    pub fn new(
        store: Arc<LocalStore<P, V>>,
        backend: Arc<CoordinationBackend>,
        runtime: Handle,
    ) -> Result<Self, CallbackAlreadyRegistered> {
        let inner = Arc::new(CoordinatorInner {
            store,
            backend,
            runtime,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .store
            .set_eviction_callback(Box::new(
                move |key: &ProfileKey, _handle: &ProfileHandle<P>, cause: EvictionCause| {
                    on_evicted(&weak, key, cause)
                },
            ))?;

        Ok(Self { inner })
    }

    /// Creates the local store and the coordination backend from `config`, and starts them.
    pub async fn create(
        config: &Config,
        service: Arc<dyn CoordinationService>,
        runtime: Handle,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(LocalStore::new(&config.caches));
        let backend = CoordinationBackend::new(
            service,
            config.node.clone(),
            config.coordination.clone(),
        );
        let coordinator = Self::new(store, backend, runtime)?;
        let first = coordinator.start().await?;
        tracing::info!(node = %config.node, first, "Profile cache started");
        Ok(coordinator)
    }

    /// Creates the records of this node and starts following the coordination connection.
    ///
    /// Returns whether this node is the first one of the cluster.
    pub async fn start(&self) -> Result<bool, CoordinationError> {
        let residency = Arc::clone(&self.inner.store);
        self.inner
            .backend
            .start(residency, &self.inner.runtime)
            .await
    }

    pub fn store(&self) -> &Arc<LocalStore<P, V>> {
        &self.inner.store
    }

    pub fn backend(&self) -> &Arc<CoordinationBackend> {
        &self.inner.backend
    }

    /// Returns a loaded profile, or starts loading it on this node.
    ///
    /// This never waits for a load. If the profile is not loaded yet, this fails with
    /// [`ProfileCacheError::LoadInProgress`] after making sure a load is running somewhere,
    /// or with [`ProfileCacheError::NotFoundLocally`] naming the node that holds the profile.
    pub async fn get_profile(
        &self,
        key: &ProfileKey,
        loader: Arc<dyn ProfileLoader<P>>,
    ) -> Result<Arc<P>, ProfileCacheError> {
        metric!(counter("profiles.access") += 1);
        if let Some(handle) = self.inner.store.get(key) {
            return resolve_local(key, &handle);
        }

        // the decision runs to completion even if the caller goes away, so a residency record is
        // never written without the matching local entry
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        self.inner
            .runtime
            .spawn(async move { inner.load_or_redirect(key, loader).await })
            .await?
    }

    /// Returns a view of a loaded profile, building and caching it if necessary.
    ///
    /// Views are only built for profiles held by this node. For any other profile this fails
    /// the same way as [`get_profile`](Self::get_profile) does, without starting a load.
    pub async fn get_view(
        &self,
        key: &ProfileKey,
        kind: ViewKind,
        trace: &str,
        builder: Arc<dyn ViewBuilder<P, V>>,
    ) -> Result<ViewResult<P, V>, ProfileCacheError> {
        let view_key = ViewKey::new(key.clone(), kind, trace);
        let Some((handle, view)) = self.inner.store.get_view(&view_key) else {
            return self.inner.locate(key).await;
        };

        let profile = resolve_local(key, &handle)?;
        if let Some(view) = view {
            metric!(counter("views.hit") += 1);
            return Ok((profile.sample_context(trace), view));
        }
        if !key.work_type.supports_views() {
            return Err(ProfileCacheError::UnsupportedWorkType(key.work_type));
        }

        let store = Arc::clone(&self.inner.store);
        let computed = self
            .inner
            .runtime
            .spawn_blocking(move || {
                let trace = view_key.trace.clone();
                store
                    .compute_view_if_absent(&view_key, |profile| {
                        builder.build_view(profile, &trace)
                    })
                    .map(|(profile, view)| (profile.sample_context(&trace), view))
            })
            .await?;

        match computed {
            Some(result) => Ok(result),
            // evicted while the view was built
            None => self.inner.locate(key).await,
        }
    }

    /// Returns the call tree of `trace` within a profile.
    pub async fn get_call_tree_view(
        &self,
        key: &ProfileKey,
        trace: &str,
        builder: Arc<dyn ViewBuilder<P, V>>,
    ) -> Result<ViewResult<P, V>, ProfileCacheError> {
        self.get_view(key, ViewKind::CallTree, trace, builder).await
    }

    /// Returns the callees tree of `trace` within a profile.
    pub async fn get_callees_tree_view(
        &self,
        key: &ProfileKey,
        trace: &str,
        builder: Arc<dyn ViewBuilder<P, V>>,
    ) -> Result<ViewResult<P, V>, ProfileCacheError> {
        self.get_view(key, ViewKind::CalleesTree, trace, builder).await
    }
}

/// Maps a handle found in the local store to the result handed out to callers.
fn resolve_local<P>(
    key: &ProfileKey,
    handle: &ProfileHandle<P>,
) -> Result<Arc<P>, ProfileCacheError> {
    match handle.peek() {
        Some(Ok(profile)) => {
            metric!(counter("profiles.hit") += 1);
            Ok(Arc::clone(profile))
        }
        Some(Err(err)) => Err(ProfileCacheError::LoadFailed(Arc::clone(err))),
        None => Err(ProfileCacheError::LoadInProgress(key.clone())),
    }
}

fn on_evicted<P: Profile, V: Cacheable>(
    inner: &Weak<CoordinatorInner<P, V>>,
    key: &ProfileKey,
    cause: EvictionCause,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    tracing::debug!(
        profile = %key,
        cause = cause.as_str(),
        "Releasing residency of evicted profile"
    );
    let key = key.clone();
    let runtime = inner.runtime.clone();
    runtime.spawn(async move { inner.cleanup_after_eviction(key).await });
}

impl<P: Profile, V: Cacheable> CoordinatorInner<P, V> {
    async fn load_or_redirect(
        self: Arc<Self>,
        key: ProfileKey,
        loader: Arc<dyn ProfileLoader<P>>,
    ) -> Result<Arc<P>, ProfileCacheError> {
        let lock = self.backend.lock().await?;

        // another request of this process may have won the race for the mutex
        if let Some(handle) = self.store.get(&key) {
            return resolve_local(&key, &handle);
        }

        let residency = self.backend.read_residency(&lock, &key).await?;
        if let Some(residency) = &residency {
            if !residency.record.is_owned_by(self.backend.node()) {
                let owner = residency.record.owner();
                metric!(counter("profiles.redirect") += 1);
                tracing::debug!(profile = %key, %owner, "Profile is cached by another node");
                return Err(ProfileCacheError::NotFoundLocally { owner: Some(owner) });
            }
        }

        self.backend
            .update_residency(&lock, &key, residency.as_ref())
            .await?;
        let handle = ProfileHandle::pending();
        self.store.put(key.clone(), handle.clone());
        drop(lock);

        self.spawn_load(key.clone(), handle, loader);
        Err(ProfileCacheError::LoadInProgress(key))
    }

    fn spawn_load(
        self: &Arc<Self>,
        key: ProfileKey,
        handle: ProfileHandle<P>,
        loader: Arc<dyn ProfileLoader<P>>,
    ) {
        metric!(counter("profiles.load.started") += 1);
        tracing::debug!(profile = %key, "Loading profile");

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let start = Instant::now();
            let result = AssertUnwindSafe(loader.load(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(LoadError::msg("profile loader panicked")));
            metric!(timer("profiles.load.duration") = start.elapsed());

            if let Err(e) = &result {
                metric!(counter("profiles.load.failed") += 1);
                tracing::error!(
                    error = &**e as &dyn std::error::Error,
                    profile = %key,
                    "Failed to load profile"
                );
            }

            handle.complete(result);
            if !inner.store.refresh(&key, &handle) {
                tracing::debug!(profile = %key, "Profile left the local store while loading");
            }
        });
    }

    /// Fails with a redirect to the owner of a profile that is not held locally.
    async fn locate<T>(&self, key: &ProfileKey) -> Result<T, ProfileCacheError> {
        let lock = self.backend.lock().await?;
        if let Some(handle) = self.store.get(key) {
            // registered while waiting for the mutex
            return Err(match resolve_local(key, &handle) {
                Ok(_) | Err(ProfileCacheError::LoadInProgress(_)) => {
                    ProfileCacheError::LoadInProgress(key.clone())
                }
                Err(e) => e,
            });
        }

        let owner = self
            .backend
            .read_residency(&lock, key)
            .await?
            .map(|residency| residency.record.owner())
            .filter(|owner| owner != self.backend.node());
        if owner.is_some() {
            metric!(counter("profiles.redirect") += 1);
        }
        Err(ProfileCacheError::NotFoundLocally { owner })
    }

    async fn cleanup_after_eviction(self: Arc<Self>, key: ProfileKey) {
        if let Err(e) = self.release_residency(&key).await {
            metric!(counter("coordination.cleanup.failed") += 1);
            tracing::error!(
                error = &e as &dyn std::error::Error,
                profile = %key,
                "Failed to release residency of evicted profile"
            );
        }
    }

    async fn release_residency(&self, key: &ProfileKey) -> Result<(), CoordinationError> {
        let lock = self.backend.lock().await?;
        if self.store.get(key).is_some() {
            // the new entry took over the record and its share of the load counter
            tracing::debug!(profile = %key, "Evicted profile was registered again");
            return Ok(());
        }

        let owned = self
            .backend
            .read_residency(&lock, key)
            .await?
            .is_some_and(|residency| residency.record.is_owned_by(self.backend.node()));
        self.backend.remove_residency(&lock, key, owned).await
    }
}
