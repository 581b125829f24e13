use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use thiserror::Error;

use crate::config::{CacheConfigs, InMemoryCacheConfig};
use crate::coordination::LocalResidency;
use crate::types::{ProfileKey, ViewKey};

use super::{Cacheable, Profile, ProfileHandle};

/// Why a profile left the [`LocalStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionCause {
    /// The profile was not accessed for longer than the idle timeout.
    Expired,
    /// The profile was evicted to stay within the capacity of the cache.
    Size,
    /// The profile was removed explicitly.
    Explicit,
}

impl EvictionCause {
    fn from_removal(cause: RemovalCause) -> Option<Self> {
        match cause {
            RemovalCause::Expired => Some(Self::Expired),
            RemovalCause::Size => Some(Self::Size),
            RemovalCause::Explicit => Some(Self::Explicit),
            RemovalCause::Replaced => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Size => "size",
            Self::Explicit => "explicit",
        }
    }
}

/// Invoked for every profile leaving the [`LocalStore`].
pub type EvictionCallback<P> =
    Box<dyn Fn(&ProfileKey, &ProfileHandle<P>, EvictionCause) + Send + Sync + 'static>;

/// An eviction callback was registered on a [`LocalStore`] that already has one.
#[derive(Debug, Clone, Copy, Error)]
#[error("an eviction callback is already registered")]
pub struct CallbackAlreadyRegistered;

#[derive(Debug, Default)]
struct Dependents {
    evicted: bool,
    views: Vec<ViewKey>,
}

struct ProfileEntry<P> {
    /// Distinguishes this entry from earlier and later entries for the same key.
    generation: u64,
    handle: ProfileHandle<P>,
    dependents: Mutex<Dependents>,
}

impl<P> ProfileEntry<P> {
    fn dependents(&self) -> MutexGuard<'_, Dependents> {
        self.dependents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CachedViewKey {
    generation: u64,
    view: ViewKey,
}

/// Marks an entry as evicted and drops all views depending on it.
fn invalidate_dependents<P, V>(views: &Cache<CachedViewKey, Arc<V>>, entry: &ProfileEntry<P>)
where
    V: Cacheable,
{
    let dependents = {
        let mut dependents = entry.dependents();
        dependents.evicted = true;
        std::mem::take(&mut dependents.views)
    };
    for view in dependents {
        views.invalidate(&CachedViewKey {
            generation: entry.generation,
            view,
        });
    }
}

fn build_cache<K, V>(
    name: &str,
    config: InMemoryCacheConfig,
    weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static,
) -> moka::sync::CacheBuilder<K, V, Cache<K, V>>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut builder = Cache::builder()
        .name(name)
        .max_capacity(config.max_weight)
        .weigher(weigher)
        // admit every new entry, the newest profile is the one most likely to be requested
        .eviction_policy(EvictionPolicy::lru());
    if let Some(idle) = config.max_unused_for {
        builder = builder.time_to_idle(idle);
    }
    builder
}

/// The in-memory store of a single node: loaded profiles and the views derived from them.
///
/// Both caches are bounded by weight and expire entries that have not been accessed for a while.
/// Every view is registered as a dependent of its profile entry, and all dependents are
/// invalidated when the profile entry leaves the cache.
pub struct LocalStore<P, V> {
    profiles: Cache<ProfileKey, Arc<ProfileEntry<P>>>,
    views: Cache<CachedViewKey, Arc<V>>,
    generations: AtomicU64,
    on_evict: Arc<OnceLock<EvictionCallback<P>>>,
}

impl<P, V> fmt::Debug for LocalStore<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("profiles", &self.profiles.entry_count())
            .field("views", &self.views.entry_count())
            .finish()
    }
}

impl<P: Profile, V: Cacheable> LocalStore<P, V> {
    pub fn new(config: &CacheConfigs) -> Self {
        let views = build_cache(
            "views",
            config.views.into(),
            |_key: &CachedViewKey, view: &Arc<V>| view.utilization_weight().max(1),
        )
        .build();

        let on_evict: Arc<OnceLock<EvictionCallback<P>>> = Arc::new(OnceLock::new());
        let listener = {
            let views = views.clone();
            let on_evict = Arc::clone(&on_evict);
            move |key: Arc<ProfileKey>, entry: Arc<ProfileEntry<P>>, cause: RemovalCause| {
                // replacements keep the entry resident, see `put` for differing handles
                let Some(cause) = EvictionCause::from_removal(cause) else {
                    return;
                };
                tracing::debug!(
                    profile = %key,
                    cause = cause.as_str(),
                    "Profile left the local store"
                );
                metric!(counter("profiles.evicted") += 1, "cause" => cause.as_str());

                invalidate_dependents(&views, &entry);
                if let Some(on_evict) = on_evict.get() {
                    on_evict(&key, &entry.handle, cause);
                }
            }
        };

        let profiles = build_cache(
            "profiles",
            config.profiles.into(),
            |_key: &ProfileKey, entry: &Arc<ProfileEntry<P>>| entry.handle.weight(),
        )
        .eviction_listener(listener)
        .build();

        Self {
            profiles,
            views,
            generations: AtomicU64::new(0),
            on_evict,
        }
    }

    /// Registers the callback invoked for every profile leaving the store.
    ///
    /// Dependent views are already invalidated when the callback runs.
    pub fn set_eviction_callback(
        &self,
        callback: EvictionCallback<P>,
    ) -> Result<(), CallbackAlreadyRegistered> {
        self.on_evict
            .set(callback)
            .map_err(|_| CallbackAlreadyRegistered)
    }

    /// Returns the handle of a profile, refreshing its idle timeout.
    pub fn get(&self, key: &ProfileKey) -> Option<ProfileHandle<P>> {
        self.profiles.get(key).map(|entry| entry.handle.clone())
    }

    /// Stores `handle` for `key`, replacing any previous handle.
    ///
    /// Storing the handle that is already present keeps its views and only lets the cache
    /// recompute the weight of the entry. Replacing a different handle drops the views of the
    /// previous one.
    pub fn put(&self, key: ProfileKey, handle: ProfileHandle<P>) {
        match self.profiles.get(&key) {
            Some(entry) if entry.handle.ptr_eq(&handle) => self.profiles.insert(key, entry),
            previous => {
                let entry = self.new_entry(handle);
                self.profiles.insert(key, entry);
                if let Some(previous) = previous {
                    invalidate_dependents(&self.views, &previous);
                }
            }
        }
    }

    /// Re-inserts `handle` so that its final weight is accounted, but only if it is still the
    /// handle stored for `key`.
    ///
    /// Returns `false` if the entry was evicted or replaced in the meantime.
    pub fn refresh(&self, key: &ProfileKey, handle: &ProfileHandle<P>) -> bool {
        let result = self
            .profiles
            .entry(key.clone())
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().handle.ptr_eq(handle) => Op::Put(entry.into_value()),
                _ => Op::Nop,
            });
        matches!(result, CompResult::ReplacedWith(_))
    }

    /// Removes a profile, which triggers the eviction callback.
    pub fn invalidate(&self, key: &ProfileKey) {
        self.profiles.invalidate(key);
    }

    /// Looks up a view together with the handle of the profile it depends on.
    ///
    /// Returns `None` if the profile is not in the store. Otherwise the view is `None` if it was
    /// not computed yet, or was evicted from the view cache.
    pub fn get_view(&self, key: &ViewKey) -> Option<(ProfileHandle<P>, Option<Arc<V>>)> {
        let entry = self.profiles.get(&key.profile)?;
        let view = self.views.get(&CachedViewKey {
            generation: entry.generation,
            view: key.clone(),
        });
        Some((entry.handle.clone(), view))
    }

    /// Returns the cached view, or builds it from the loaded profile.
    ///
    /// Concurrent calls for views of the same profile are serialized, so every view is built at
    /// most once per profile entry and registered as its dependent exactly once. Returns `None`
    /// if the profile is not in the store, or not successfully loaded.
    pub fn compute_view_if_absent<F>(&self, key: &ViewKey, build: F) -> Option<(Arc<P>, Arc<V>)>
    where
        F: FnOnce(&P) -> V,
    {
        let entry = self.profiles.get(&key.profile)?;
        let Some(Ok(profile)) = entry.handle.peek() else {
            return None;
        };
        let profile = Arc::clone(profile);

        let mut dependents = entry.dependents();
        if dependents.evicted {
            return None;
        }

        let cache_key = CachedViewKey {
            generation: entry.generation,
            view: key.clone(),
        };
        if let Some(view) = self.views.get(&cache_key) {
            metric!(counter("views.hit") += 1);
            return Some((profile, view));
        }

        let view = Arc::new(build(&profile));
        metric!(counter("views.computed") += 1);
        self.views.insert(cache_key, Arc::clone(&view));
        if !dependents.views.contains(key) {
            dependents.views.push(key.clone());
        }
        Some((profile, view))
    }

    /// Removes views of the profiles currently in the store.
    pub fn invalidate_views(&self, keys: &[ViewKey]) {
        for key in keys {
            let Some(entry) = self.profiles.get(&key.profile) else {
                continue;
            };
            entry.dependents().views.retain(|view| view != key);
            self.views.invalidate(&CachedViewKey {
                generation: entry.generation,
                view: key.clone(),
            });
        }
    }

    /// The views currently registered as dependents of a profile.
    pub fn dependent_views(&self, key: &ProfileKey) -> Vec<ViewKey> {
        match self.profiles.get(key) {
            Some(entry) => entry.dependents().views.clone(),
            None => Vec::new(),
        }
    }

    /// The keys of all profiles in the store, including pending and failed loads.
    pub fn resident_keys(&self) -> Vec<ProfileKey> {
        self.profiles
            .iter()
            .map(|(key, _)| ProfileKey::clone(&key))
            .collect()
    }

    /// The number of profiles in the store.
    ///
    /// This is an estimate until [`run_pending_tasks`](Self::run_pending_tasks) was called.
    pub fn profile_count(&self) -> u64 {
        self.profiles.entry_count()
    }

    /// The number of views in the store.
    pub fn view_count(&self) -> u64 {
        self.views.entry_count()
    }

    /// Processes pending evictions and expirations of both caches.
    ///
    /// The caches perform this maintenance lazily, so eviction callbacks may otherwise be delayed.
    pub fn run_pending_tasks(&self) {
        self.profiles.run_pending_tasks();
        self.views.run_pending_tasks();
    }

    fn new_entry(&self, handle: ProfileHandle<P>) -> Arc<ProfileEntry<P>> {
        Arc::new(ProfileEntry {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            handle,
            dependents: Mutex::new(Dependents::default()),
        })
    }
}

impl<P: Profile, V: Cacheable> LocalResidency for LocalStore<P, V> {
    fn resident_profiles(&self) -> Vec<ProfileKey> {
        self.resident_keys()
    }

    fn ownership_lost(&self, keys: &[ProfileKey]) {
        for key in keys {
            self.invalidate(key);
        }
    }
}
