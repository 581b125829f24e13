use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;

use crate::config::CoordinationConfig;
use crate::types::{NodeAddr, ProfileKey};

use super::records::{decode_record, encode_record};
use super::{
    ConnectionEvent, CoordinationError, CoordinationPaths, CoordinationService, CreateMode,
    NodeLoadRecord, NodeStat, Op, ResidencyRecord, ServiceError, SessionId,
};

/// Access to the profiles held by the local store of this node.
///
/// The backend uses this to recreate residency records after a session loss.
pub trait LocalResidency: Send + Sync + 'static {
    /// All profiles this node holds or is loading.
    fn resident_profiles(&self) -> Vec<ProfileKey>;

    /// Called with profiles that turned out to be owned by another node after a reconnect.
    fn ownership_lost(&self, keys: &[ProfileKey]);
}

/// Whether the backend can currently talk to the coordination service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// The residency record of a profile, as read under the global mutex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Residency {
    pub record: ResidencyRecord,
    /// Whether the record is tied to the current session of this node.
    pub current_session: bool,
}

/// Scoped ownership of the global mutex.
///
/// Releases the mutex when dropped, unless it was handed out to a nested call path that did not
/// acquire it itself.
#[must_use = "the global mutex is released when the guard is dropped"]
pub struct CoordinationLock<'a> {
    backend: &'a CoordinationBackend,
    gate: Option<tokio::sync::MutexGuard<'a, ()>>,
}

impl CoordinationLock<'_> {
    /// Whether this guard releases the mutex on drop.
    pub fn is_owner(&self) -> bool {
        self.gate.is_some()
    }
}

impl Drop for CoordinationLock<'_> {
    fn drop(&mut self) {
        if self.gate.is_none() {
            return;
        }
        self.backend.lock_held.store(false, Ordering::Release);
        let path = self.backend.paths.mutex();
        if let Err(e) = self.backend.service.release_mutex(&path) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                "Failed to release the global mutex"
            );
        }
    }
}

/// Implements the residency protocol on top of a [`CoordinationService`].
#[derive(Debug)]
pub struct CoordinationBackend {
    service: Arc<dyn CoordinationService>,
    node: NodeAddr,
    paths: CoordinationPaths,
    config: CoordinationConfig,

    connected: AtomicBool,
    session_lost: AtomicBool,
    /// Unix timestamp in milliseconds of the last session loss, `0` if there was none.
    last_lost_at: AtomicI64,

    /// Serializes contenders within this process before they reach the distributed mutex.
    gate: tokio::sync::Mutex<()>,
    lock_held: AtomicBool,

    residency: OnceLock<Arc<dyn LocalResidency>>,
}

impl std::fmt::Debug for dyn LocalResidency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalResidency")
    }
}

impl CoordinationBackend {
    pub fn new(
        service: Arc<dyn CoordinationService>,
        node: NodeAddr,
        config: CoordinationConfig,
    ) -> Arc<Self> {
        let connected = service.is_connected();
        Arc::new(Self {
            paths: CoordinationPaths::new(&config.namespace),
            service,
            node,
            config,
            connected: AtomicBool::new(connected),
            session_lost: AtomicBool::new(false),
            last_lost_at: AtomicI64::new(0),
            gate: tokio::sync::Mutex::new(()),
            lock_held: AtomicBool::new(false),
            residency: OnceLock::new(),
        })
    }

    /// Sets up this node's records and starts following connection state changes.
    ///
    /// Returns `true` if the shared namespace was created by this call, which means this node
    /// is the first one of the cluster.
    pub async fn start(
        self: &Arc<Self>,
        residency: Arc<dyn LocalResidency>,
        runtime: &tokio::runtime::Handle,
    ) -> Result<bool, CoordinationError> {
        if self.residency.set(residency).is_err() {
            tracing::warn!("Coordination backend started more than once");
        }

        let mut events = self.service.subscribe();
        let backend = Arc::downgrade(self);
        runtime.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed coordination connection events");
                        None
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(backend) = Weak::upgrade(&backend) else {
                    break;
                };
                match event {
                    Some(event) => backend.handle_event(event).await,
                    None => backend.resynchronize().await,
                }
            }
        });

        self.ensure_base_paths_exist().await
    }

    /// The node this backend records residency for.
    pub fn node(&self) -> &NodeAddr {
        &self.node
    }

    pub fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// When the coordination session was last lost.
    pub fn last_session_loss(&self) -> Option<DateTime<Utc>> {
        match self.last_lost_at.load(Ordering::Acquire) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Fails with [`CoordinationError::NotConnected`] unless the backend is connected.
    ///
    /// This never blocks, so callers can check it on any thread.
    pub fn ensure_connected(&self) -> Result<(), CoordinationError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoordinationError::NotConnected {
                session_lost: self.session_lost.load(Ordering::Acquire),
            })
        }
    }

    /// Creates the load record of this node and the shared residency namespace.
    ///
    /// An existing load record of this node is reset to zero and re-created if it belongs to an
    /// older session. Returns whether the residency namespace was created by this call.
    pub async fn ensure_base_paths_exist(&self) -> Result<bool, CoordinationError> {
        self.ensure_connected()?;

        let node_path = self.paths.node(&self.node);
        let empty_load = encode_record(&NodeLoadRecord::default());
        let session = self.service.session_id();
        match self.call(self.service.exists(&node_path)).await? {
            None => {
                self.call(self.service.create(
                    &node_path,
                    empty_load,
                    CreateMode::Ephemeral,
                    true,
                ))
                .await?
            }
            Some(stat) if stat.ephemeral_owner.is_some() && stat.ephemeral_owner == session => {
                self.call(self.service.set_data(&node_path, empty_load))
                    .await?
            }
            Some(_) => {
                let ops = vec![
                    Op::Delete {
                        path: node_path.clone(),
                    },
                    Op::Create {
                        path: node_path.clone(),
                        data: empty_load,
                        mode: CreateMode::Ephemeral,
                    },
                ];
                self.call(self.service.commit(ops)).await?
            }
        }

        let profiles_root = self.paths.profiles_root();
        let created = self
            .call(
                self.service
                    .create(&profiles_root, Vec::new(), CreateMode::Persistent, true),
            )
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(CoordinationError::Service(ServiceError::NodeExists(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquires the global mutex.
    pub async fn lock(&self) -> Result<CoordinationLock<'_>, CoordinationError> {
        self.lock_with(false).await
    }

    /// Acquires the global mutex, or joins an acquisition of this process.
    ///
    /// With `expect_already_held`, the mutex must already be held by this process and the
    /// returned guard does not release it. Otherwise the mutex is acquired, waiting for other
    /// holders within this process and across the cluster for at most the configured lock
    /// timeout.
    pub async fn lock_with(
        &self,
        expect_already_held: bool,
    ) -> Result<CoordinationLock<'_>, CoordinationError> {
        self.ensure_connected()?;
        if expect_already_held {
            return match self.lock_held.load(Ordering::Acquire) {
                true => Ok(CoordinationLock {
                    backend: self,
                    gate: None,
                }),
                false => Err(CoordinationError::LockNotHeld),
            };
        }
        self.acquire(true).await
    }

    /// Whether this process currently holds the global mutex.
    pub fn is_lock_held(&self) -> bool {
        self.lock_held.load(Ordering::Acquire)
    }

    async fn acquire(
        &self,
        check_connection: bool,
    ) -> Result<CoordinationLock<'_>, CoordinationError> {
        let timeout = self.config.lock_timeout;
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let gate = tokio::time::timeout_at(deadline, self.gate.lock())
            .await
            .map_err(|_| CoordinationError::LockTimeout(timeout))?;
        if check_connection {
            self.ensure_connected()?;
        }

        let path = self.paths.mutex();
        let acquired = tokio::time::timeout_at(deadline, self.service.acquire_mutex(&path)).await;
        metric!(timer("coordination.lock.wait") = start.elapsed());

        match acquired {
            Ok(Ok(())) => {
                self.lock_held.store(true, Ordering::Release);
                Ok(CoordinationLock {
                    backend: self,
                    gate: Some(gate),
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoordinationError::LockTimeout(timeout)),
        }
    }

    /// Reads the residency record of a profile.
    pub async fn read_residency(
        &self,
        lock: &CoordinationLock<'_>,
        key: &ProfileKey,
    ) -> Result<Option<Residency>, CoordinationError> {
        self.check_lock(lock)?;
        let path = self.paths.profile(key);
        let Some(stat) = self.call(self.service.exists(&path)).await? else {
            return Ok(None);
        };
        let Some(data) = self.call(self.service.get_data(&path)).await? else {
            return Ok(None);
        };
        let record: ResidencyRecord = decode_record(&path, &data)?;
        let session = self.service.session_id();
        Ok(Some(Residency {
            record,
            current_session: session.is_some() && stat.ephemeral_owner == session,
        }))
    }

    /// Records this node as the owner of a profile.
    ///
    /// A record of the current session is updated in place. A record left behind by an older
    /// session is replaced so that it is tied to the live session. The load record of this node is
    /// incremented unless the profile was already recorded by the current session.
    pub async fn update_residency(
        &self,
        lock: &CoordinationLock<'_>,
        key: &ProfileKey,
        existing: Option<&Residency>,
    ) -> Result<(), CoordinationError> {
        self.check_lock(lock)?;
        let node_path = self.paths.node(&self.node);
        let path = self.paths.profile(key);
        let record = encode_record(&ResidencyRecord::from(&self.node));
        let load = self.read_own_load().await?;

        let (residency_ops, added) = match existing {
            None => (
                vec![Op::Create {
                    path,
                    data: record,
                    mode: CreateMode::Ephemeral,
                }],
                1,
            ),
            Some(existing) if existing.current_session => {
                (vec![Op::SetData { path, data: record }], 0)
            }
            Some(_) => (
                vec![
                    Op::Delete { path: path.clone() },
                    Op::Create {
                        path,
                        data: record,
                        mode: CreateMode::Ephemeral,
                    },
                ],
                1,
            ),
        };

        let mut ops = vec![Op::SetData {
            path: node_path,
            data: encode_record(&NodeLoadRecord {
                profiles_loaded: load.profiles_loaded + added,
            }),
        }];
        ops.extend(residency_ops);
        self.call(self.service.commit(ops)).await
    }

    /// Decrements the load record of this node, and deletes the residency record of the profile
    /// within the same transaction if `delete_record` is set.
    pub async fn remove_residency(
        &self,
        lock: &CoordinationLock<'_>,
        key: &ProfileKey,
        delete_record: bool,
    ) -> Result<(), CoordinationError> {
        self.check_lock(lock)?;
        let node_path = self.paths.node(&self.node);
        let load = self.read_own_load().await?;

        let mut ops = vec![Op::SetData {
            path: node_path,
            data: encode_record(&NodeLoadRecord {
                profiles_loaded: load.profiles_loaded - 1,
            }),
        }];
        if delete_record {
            ops.push(Op::Delete {
                path: self.paths.profile(key),
            });
        }
        self.call(self.service.commit(ops)).await
    }

    /// Reads the load record of any node.
    pub async fn read_node_load(
        &self,
        node: &NodeAddr,
    ) -> Result<Option<NodeLoadRecord>, CoordinationError> {
        self.ensure_connected()?;
        let path = self.paths.node(node);
        match self.call(self.service.get_data(&path)).await? {
            Some(data) => Ok(Some(decode_record(&path, &data)?)),
            None => Ok(None),
        }
    }

    pub async fn profile_info_exists(&self, key: &ProfileKey) -> Result<bool, CoordinationError> {
        self.ensure_connected()?;
        let path = self.paths.profile(key);
        Ok(self.call(self.service.exists(&path)).await?.is_some())
    }

    pub async fn node_info_exists(&self) -> Result<bool, CoordinationError> {
        self.ensure_connected()?;
        let path = self.paths.node(&self.node);
        Ok(self.call(self.service.exists(&path)).await?.is_some())
    }

    async fn read_own_load(&self) -> Result<NodeLoadRecord, CoordinationError> {
        let path = self.paths.node(&self.node);
        match self.call(self.service.get_data(&path)).await? {
            Some(data) => decode_record(&path, &data),
            None => Err(CoordinationError::NodeRecordMissing(path)),
        }
    }

    fn check_lock(&self, lock: &CoordinationLock<'_>) -> Result<(), CoordinationError> {
        if !std::ptr::eq(lock.backend, self) || !self.lock_held.load(Ordering::Acquire) {
            return Err(CoordinationError::LockNotHeld);
        }
        self.ensure_connected()
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, CoordinationError> {
        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoordinationError::Timeout(timeout)),
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        tracing::info!(?event, node = %self.node, "Coordination connection state changed");
        match event {
            ConnectionEvent::Lost => self.mark_disconnected(true),
            ConnectionEvent::Suspended | ConnectionEvent::ReadOnly => {
                self.mark_disconnected(false)
            }
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => {
                self.resynchronize().await
            }
        }
    }

    fn mark_disconnected(&self, session_lost: bool) {
        self.connected.store(false, Ordering::Release);
        if session_lost {
            self.session_lost.store(true, Ordering::Release);
            self.last_lost_at
                .store(Utc::now().timestamp_millis(), Ordering::Release);
        }
        metric!(gauge("coordination.state") = 0u64);
    }

    fn mark_connected(&self) {
        self.session_lost.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        metric!(gauge("coordination.state") = 1u64);
    }

    /// Brings the records of this node in line with the local store after a reconnect, and only
    /// then reports the backend as connected.
    async fn resynchronize(&self) {
        let mut attempt = 0;
        loop {
            if !self.service.is_connected() {
                self.mark_disconnected(false);
                return;
            }

            let result = if self.session_lost.load(Ordering::Acquire) {
                self.reinit().await
            } else {
                match self.verify_node_record().await {
                    Ok(true) => Ok(Vec::new()),
                    Ok(false) => {
                        tracing::warn!(node = %self.node, "Node record vanished during suspension");
                        self.reinit().await
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(conflicts) => {
                    self.mark_connected();
                    metric!(counter("coordination.reinit") += 1, "outcome" => "success");
                    tracing::info!(node = %self.node, "Coordination backend connected");
                    if !conflicts.is_empty() {
                        tracing::warn!(
                            count = conflicts.len(),
                            "Profiles are cached by other nodes, evicting local copies"
                        );
                        if let Some(residency) = self.residency.get() {
                            residency.ownership_lost(&conflicts);
                        }
                    }
                    return;
                }
                Err(e) => {
                    metric!(counter("coordination.reinit") += 1, "outcome" => "failure");
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        attempt,
                        "Failed to resynchronize with the coordination service"
                    );
                    if attempt >= self.config.retry.max_retries {
                        return;
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay(attempt)).await;
                }
            }
        }
    }

    async fn verify_node_record(&self) -> Result<bool, CoordinationError> {
        let path = self.paths.node(&self.node);
        let stat = self.call(self.service.exists(&path)).await?;
        let session = self.service.session_id();
        Ok(stat.is_some_and(|stat| session.is_some() && stat.ephemeral_owner == session))
    }

    /// Recreates all records of this node after its session was lost.
    ///
    /// Returns the profiles that are resident locally but meanwhile recorded by another node.
    async fn reinit(&self) -> Result<Vec<ProfileKey>, CoordinationError> {
        let _lock = self.acquire(false).await?;
        let session = self
            .service
            .session_id()
            .ok_or(CoordinationError::NotConnected { session_lost: true })?;

        let node_path = self.paths.node(&self.node);
        self.await_stale_node_record(&node_path, session).await?;

        let keys = self
            .residency
            .get()
            .map(|residency| residency.resident_profiles())
            .unwrap_or_default();
        let mut paths: Vec<String> = keys.iter().map(|key| self.paths.profile(key)).collect();
        paths.push(node_path.clone());

        let mut stats = self.call(self.service.exists_many(&paths)).await?;
        let node_stat = stats.pop().flatten();
        paths.pop();

        let record = encode_record(&ResidencyRecord::from(&self.node));
        let mut ops = Vec::new();
        let mut conflicts = Vec::new();
        for ((key, path), stat) in keys.iter().zip(paths).zip(stats) {
            match stat {
                None => ops.push(Op::Create {
                    path,
                    data: record.clone(),
                    mode: CreateMode::Ephemeral,
                }),
                Some(NodeStat {
                    ephemeral_owner, ..
                }) if ephemeral_owner == Some(session) => {}
                Some(_) => {
                    let owner = match self.call(self.service.get_data(&path)).await? {
                        Some(data) => Some(decode_record::<ResidencyRecord>(&path, &data)?),
                        None => None,
                    };
                    match owner {
                        Some(owner) if !owner.is_owned_by(&self.node) => {
                            conflicts.push(key.clone())
                        }
                        _ => {
                            ops.push(Op::Delete { path: path.clone() });
                            ops.push(Op::Create {
                                path,
                                data: record.clone(),
                                mode: CreateMode::Ephemeral,
                            });
                        }
                    }
                }
            }
        }

        // conflicting profiles are still counted until their eviction decrements the counter
        let load = encode_record(&NodeLoadRecord {
            profiles_loaded: keys.len() as i64,
        });
        ops.push(match node_stat {
            None => Op::Create {
                path: node_path,
                data: load,
                mode: CreateMode::Ephemeral,
            },
            Some(_) => Op::SetData {
                path: node_path,
                data: load,
            },
        });

        tracing::info!(
            profiles = keys.len(),
            conflicts = conflicts.len(),
            "Recreating coordination records"
        );
        metric!(histogram("coordination.reinit.profiles") = keys.len() as u64);
        self.call(self.service.commit(ops)).await?;
        Ok(conflicts)
    }

    /// Waits for the node record of an older session of this node to expire.
    async fn await_stale_node_record(
        &self,
        path: &str,
        session: SessionId,
    ) -> Result<(), CoordinationError> {
        let session_timeout = self.service.session_timeout();
        let max_wait = session_timeout * 2;
        let poll_interval =
            (session_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            match self.call(self.service.exists(path)).await? {
                Some(stat) if stat.ephemeral_owner.is_some_and(|owner| owner != session) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CoordinationError::Timeout(max_wait));
                    }
                    tracing::debug!(path, "Waiting for node record of an older session to expire");
                    tokio::time::sleep(poll_interval).await;
                }
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::coordination::{InMemoryClient, InMemoryCoordination};
    use crate::test;

    #[derive(Default)]
    struct FixedResidency {
        keys: Mutex<Vec<ProfileKey>>,
        lost: Mutex<Vec<ProfileKey>>,
    }

    impl LocalResidency for FixedResidency {
        fn resident_profiles(&self) -> Vec<ProfileKey> {
            self.keys.lock().unwrap().clone()
        }

        fn ownership_lost(&self, keys: &[ProfileKey]) {
            self.lost.lock().unwrap().extend_from_slice(keys);
        }
    }

    async fn started_backend(
        ensemble: &InMemoryCoordination,
        port: u16,
        residency: Arc<FixedResidency>,
    ) -> (Arc<InMemoryClient>, Arc<CoordinationBackend>) {
        let client = ensemble.connect();
        let backend = CoordinationBackend::new(
            client.clone(),
            NodeAddr::new("127.0.0.1", port),
            test::coordination_config(),
        );
        backend
            .start(residency, &tokio::runtime::Handle::current())
            .await
            .unwrap();
        (client, backend)
    }

    fn load_of(ensemble: &InMemoryCoordination, backend: &CoordinationBackend) -> i64 {
        let path = backend.paths().node(backend.node());
        let data = ensemble.read(&path).unwrap();
        decode_record::<NodeLoadRecord>(&path, &data)
            .unwrap()
            .profiles_loaded
    }

    #[tokio::test]
    async fn test_base_paths() {
        test::setup();
        let ensemble = InMemoryCoordination::new();

        let client = ensemble.connect();
        let backend = CoordinationBackend::new(
            client,
            NodeAddr::new("127.0.0.1", 1),
            test::coordination_config(),
        );
        assert!(backend.ensure_base_paths_exist().await.unwrap());
        assert!(!backend.ensure_base_paths_exist().await.unwrap());
        assert!(backend.node_info_exists().await.unwrap());
        assert_eq!(load_of(&ensemble, &backend), 0);

        let (_client, other) = started_backend(&ensemble, 2, Default::default()).await;
        assert_eq!(
            other.read_node_load(backend.node()).await.unwrap(),
            Some(NodeLoadRecord::default())
        );
    }

    #[tokio::test]
    async fn test_update_and_remove_residency() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let (_client, backend) = started_backend(&ensemble, 1, Default::default()).await;
        let key = test::profile_key("app1");

        let lock = backend.lock().await.unwrap();
        assert_eq!(backend.read_residency(&lock, &key).await.unwrap(), None);
        backend.update_residency(&lock, &key, None).await.unwrap();

        let residency = backend.read_residency(&lock, &key).await.unwrap().unwrap();
        assert!(residency.current_session);
        assert!(residency.record.is_owned_by(backend.node()));
        assert_eq!(load_of(&ensemble, &backend), 1);

        // updating a record of the current session does not count the profile twice
        backend
            .update_residency(&lock, &key, Some(&residency))
            .await
            .unwrap();
        assert_eq!(load_of(&ensemble, &backend), 1);

        backend.remove_residency(&lock, &key, true).await.unwrap();
        assert!(!backend.profile_info_exists(&key).await.unwrap());
        assert_eq!(load_of(&ensemble, &backend), 0);
    }

    #[tokio::test]
    async fn test_stale_record_is_taken_over() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let (client, backend) = started_backend(&ensemble, 1, Default::default()).await;
        let key = test::profile_key("app1");

        // a record naming this node, written by another session
        let previous = ensemble.connect();
        previous
            .create(
                &backend.paths().profile(&key),
                encode_record(&ResidencyRecord::from(backend.node())),
                CreateMode::Ephemeral,
                false,
            )
            .await
            .unwrap();

        let lock = backend.lock().await.unwrap();
        let residency = backend.read_residency(&lock, &key).await.unwrap().unwrap();
        assert!(!residency.current_session);
        backend
            .update_residency(&lock, &key, Some(&residency))
            .await
            .unwrap();
        drop(lock);

        // the record survives the expiry of the old session
        previous.expire_session();
        let stat = ensemble.stat(&backend.paths().profile(&key)).unwrap();
        assert_eq!(stat.ephemeral_owner, client.session_id());
        assert_eq!(load_of(&ensemble, &backend), 1);
    }

    #[tokio::test]
    async fn test_lock_requires_ownership() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let (_client, backend) = started_backend(&ensemble, 1, Default::default()).await;

        assert!(matches!(
            backend.lock_with(true).await,
            Err(CoordinationError::LockNotHeld)
        ));

        let lock = backend.lock().await.unwrap();
        assert!(lock.is_owner());
        assert!(backend.is_lock_held());
        {
            let nested = backend.lock_with(true).await.unwrap();
            assert!(!nested.is_owner());
        }
        // dropping the nested guard keeps the mutex
        assert!(backend.is_lock_held());
        drop(lock);
        assert!(!backend.is_lock_held());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let (_client, backend) = started_backend(&ensemble, 1, Default::default()).await;
        let (_other_client, other) = started_backend(&ensemble, 2, Default::default()).await;

        let _lock = backend.lock().await.unwrap();
        let start = Instant::now();
        let result = other.lock().await;
        assert!(matches!(result, Err(CoordinationError::LockTimeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_disconnected_fails_fast() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let (client, backend) = started_backend(&ensemble, 1, Default::default()).await;

        client.suspend();
        profile_cache_test::wait_until(Duration::from_secs(1), || async {
            backend.state() == ConnectionState::Disconnected
        })
        .await;

        let start = Instant::now();
        assert!(matches!(
            backend.lock().await,
            Err(CoordinationError::NotConnected {
                session_lost: false
            })
        ));
        assert!(matches!(
            backend.node_info_exists().await,
            Err(CoordinationError::NotConnected { .. })
        ));
        assert!(start.elapsed() < Duration::from_millis(100));

        client.resume();
        profile_cache_test::wait_until(Duration::from_secs(1), || async {
            backend.state() == ConnectionState::Connected
        })
        .await;
        assert!(backend.last_session_loss().is_none());
    }

    #[tokio::test]
    async fn test_reinit_after_session_loss() {
        test::setup();
        let ensemble = InMemoryCoordination::new();
        let residency = Arc::new(FixedResidency::default());
        let (client, backend) = started_backend(&ensemble, 1, residency.clone()).await;
        let (_other_client, other) = started_backend(&ensemble, 2, Default::default()).await;

        let keys = vec![
            test::profile_key("app1"),
            test::profile_key("app2"),
            test::profile_key("app3"),
        ];
        {
            let lock = backend.lock().await.unwrap();
            for key in &keys {
                backend.update_residency(&lock, key, None).await.unwrap();
            }
        }
        *residency.keys.lock().unwrap() = keys.clone();

        client.expire_session();
        profile_cache_test::wait_until(Duration::from_secs(1), || async {
            backend.state() == ConnectionState::Disconnected
        })
        .await;
        assert!(backend.last_session_loss().is_some());
        assert!(!other.profile_info_exists(&keys[0]).await.unwrap());

        // another node picks up one of the profiles while this node is gone
        {
            let lock = other.lock().await.unwrap();
            other.update_residency(&lock, &keys[2], None).await.unwrap();
        }

        client.reconnect();
        profile_cache_test::wait_until(Duration::from_secs(1), || async {
            backend.state() == ConnectionState::Connected
        })
        .await;

        let lock = backend.lock().await.unwrap();
        for key in &keys[..2] {
            let record = backend.read_residency(&lock, key).await.unwrap().unwrap();
            assert!(record.record.is_owned_by(backend.node()));
            assert!(record.current_session);
        }
        let record = backend.read_residency(&lock, &keys[2]).await.unwrap().unwrap();
        assert!(record.record.is_owned_by(other.node()));
        drop(lock);

        assert_eq!(load_of(&ensemble, &backend), 3);
        assert_eq!(*residency.lost.lock().unwrap(), vec![keys[2].clone()]);
    }
}
