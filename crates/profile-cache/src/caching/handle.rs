use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use super::{Cacheable, LoadError};

/// The outcome of a profile load, shared by everyone holding the handle.
pub type LoadResult<P> = Result<Arc<P>, Arc<LoadError>>;

struct HandleInner<P> {
    result: OnceLock<LoadResult<P>>,
    completed: Notify,
}

/// A shared handle to the result of loading a profile.
///
/// A pending handle means the profile is being loaded by this node right now. Once completed,
/// the handle holds either the loaded profile or the load failure for as long as it stays in the
/// cache. Completion happens at most once.
pub struct ProfileHandle<P> {
    inner: Arc<HandleInner<P>>,
}

impl<P> Clone for ProfileHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for ProfileHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.result.get() {
            None => "pending",
            Some(Ok(_)) => "loaded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("ProfileHandle")
            .field("state", &state)
            .finish()
    }
}

impl<P> ProfileHandle<P> {
    /// Creates a handle for a load that has not finished yet.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                result: OnceLock::new(),
                completed: Notify::new(),
            }),
        }
    }

    /// Creates an already completed handle.
    pub fn completed(result: Result<P, LoadError>) -> Self {
        let handle = Self::pending();
        handle.complete(result);
        handle
    }

    /// Stores the outcome of the load and wakes up all waiters.
    ///
    /// Returns `false` if the handle was completed before, in which case `result` is dropped.
    pub fn complete(&self, result: Result<P, LoadError>) -> bool {
        let result = result.map(Arc::new).map_err(Arc::new);
        let stored = self.inner.result.set(result).is_ok();
        if stored {
            self.inner.completed.notify_waiters();
        }
        stored
    }

    /// Returns the outcome if the load has finished.
    pub fn peek(&self) -> Option<&LoadResult<P>> {
        self.inner.result.get()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Waits for the load to finish.
    pub async fn wait(&self) -> LoadResult<P> {
        loop {
            // register before checking, so a completion in between is not missed
            let completed = self.inner.completed.notified();
            if let Some(result) = self.inner.result.get() {
                return result.clone();
            }
            completed.await;
        }
    }

    /// Whether both handles refer to the same load.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<P: Cacheable> ProfileHandle<P> {
    /// The weight of this entry in the profile cache.
    ///
    /// Pending and failed loads weigh `1`, loaded profiles report their own weight.
    pub fn weight(&self) -> u32 {
        match self.inner.result.get() {
            Some(Ok(profile)) => profile.utilization_weight().max(1),
            _ => 1,
        }
    }
}
