use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};

use super::{
    ConnectionEvent, CoordinationService, CreateMode, NodeStat, Op, ServiceError, SessionId,
};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct StoredNode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
    version: u64,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: BTreeMap<String, StoredNode>,
    sessions: HashSet<SessionId>,
    next_session: u64,
}

#[derive(Debug)]
struct Ensemble {
    state: Mutex<EnsembleState>,
    mutexes: Mutex<HashMap<String, Arc<Semaphore>>>,
    session_timeout: Duration,
}

impl Ensemble {
    fn state(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn semaphore(&self, path: &str) -> Arc<Semaphore> {
        let mut mutexes = self.mutexes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            mutexes
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

/// An in-process coordination ensemble.
///
/// Each call to [`connect`](Self::connect) opens a new client session against the shared
/// namespace, so a single ensemble can stand in for the coordination service of a whole cluster of
/// query nodes. The returned clients allow injecting connection faults.
#[derive(Clone, Debug)]
pub struct InMemoryCoordination {
    ensemble: Arc<Ensemble>,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::with_session_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_session_timeout(session_timeout: Duration) -> Self {
        Self {
            ensemble: Arc::new(Ensemble {
                state: Mutex::new(EnsembleState::default()),
                mutexes: Mutex::new(HashMap::new()),
                session_timeout,
            }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> Arc<InMemoryClient> {
        let session = open_session(&self.ensemble);
        let (events, _) = broadcast::channel(16);
        Arc::new(InMemoryClient {
            ensemble: Arc::clone(&self.ensemble),
            state: Mutex::new(ClientState::Connected(session)),
            held: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Returns the data stored at `path`, bypassing any session.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.ensemble.state();
        state.nodes.get(path).map(|node| node.data.clone())
    }

    /// Returns the metadata of the node at `path`, bypassing any session.
    pub fn stat(&self, path: &str) -> Option<NodeStat> {
        let state = self.ensemble.state();
        state.nodes.get(path).map(stat_of)
    }

    /// Lists the paths of all direct children of `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        let state = self.ensemble.state();
        state
            .nodes
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_owned)
            .collect()
    }
}

fn open_session(ensemble: &Ensemble) -> SessionId {
    let mut state = ensemble.state();
    state.next_session += 1;
    let session = SessionId(state.next_session);
    state.sessions.insert(session);
    session
}

fn stat_of(node: &StoredNode) -> NodeStat {
    NodeStat {
        ephemeral_owner: node.ephemeral_owner,
        version: node.version,
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn has_children(nodes: &BTreeMap<String, StoredNode>, path: &str) -> bool {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(p, _)| p.starts_with(&prefix))
}

fn apply(
    nodes: &mut BTreeMap<String, StoredNode>,
    session: SessionId,
    op: Op,
) -> Result<(), ServiceError> {
    match op {
        Op::Create { path, data, mode } => {
            if nodes.contains_key(&path) {
                return Err(ServiceError::NodeExists(path));
            }
            let parent = parent_of(&path);
            if !parent.is_empty() && !nodes.contains_key(parent) {
                return Err(ServiceError::NoNode(parent.to_owned()));
            }
            let ephemeral_owner = (mode == CreateMode::Ephemeral).then_some(session);
            nodes.insert(
                path,
                StoredNode {
                    data,
                    ephemeral_owner,
                    version: 0,
                },
            );
        }
        Op::SetData { path, data } => {
            let node = nodes.get_mut(&path).ok_or(ServiceError::NoNode(path))?;
            node.data = data;
            node.version += 1;
        }
        Op::Delete { path } => {
            if !nodes.contains_key(&path) {
                return Err(ServiceError::NoNode(path));
            }
            if has_children(nodes, &path) {
                return Err(ServiceError::NotEmpty(path));
            }
            nodes.remove(&path);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    Connected(SessionId),
    Suspended(SessionId),
    Expired,
}

/// A client session of an [`InMemoryCoordination`] ensemble.
#[derive(Debug)]
pub struct InMemoryClient {
    ensemble: Arc<Ensemble>,
    state: Mutex<ClientState>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemoryClient {
    fn client_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, OwnedSemaphorePermit>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_session(&self) -> Result<SessionId, ServiceError> {
        match *self.client_state() {
            ClientState::Connected(session) => Ok(session),
            ClientState::Suspended(_) => Err(ServiceError::ConnectionLoss),
            ClientState::Expired => Err(ServiceError::SessionExpired),
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Interrupts the connection while keeping the session alive.
    pub fn suspend(&self) {
        let mut state = self.client_state();
        if let ClientState::Connected(session) = *state {
            *state = ClientState::Suspended(session);
            drop(state);
            self.emit(ConnectionEvent::Suspended);
        }
    }

    /// Re-establishes a suspended connection within the same session.
    pub fn resume(&self) {
        let mut state = self.client_state();
        if let ClientState::Suspended(session) = *state {
            *state = ClientState::Connected(session);
            drop(state);
            self.emit(ConnectionEvent::Reconnected);
        }
    }

    /// Expires the session: removes its ephemeral nodes and releases its mutexes.
    pub fn expire_session(&self) {
        let mut state = self.client_state();
        let session = match *state {
            ClientState::Connected(session) | ClientState::Suspended(session) => session,
            ClientState::Expired => return,
        };
        *state = ClientState::Expired;
        drop(state);

        {
            let mut ensemble = self.ensemble.state();
            ensemble.sessions.remove(&session);
            ensemble
                .nodes
                .retain(|_, node| node.ephemeral_owner != Some(session));
        }
        self.held().clear();

        self.emit(ConnectionEvent::Lost);
    }

    /// Opens a new session after the previous one expired.
    pub fn reconnect(&self) {
        let mut state = self.client_state();
        if *state == ClientState::Expired {
            *state = ClientState::Connected(open_session(&self.ensemble));
            drop(state);
            self.emit(ConnectionEvent::Reconnected);
        }
    }
}

#[async_trait]
impl CoordinationService for InMemoryClient {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<(), ServiceError> {
        let session = self.live_session()?;
        let mut state = self.ensemble.state();
        if create_parents {
            let mut missing = Vec::new();
            let mut parent = parent_of(path);
            while !parent.is_empty() && !state.nodes.contains_key(parent) {
                missing.push(parent.to_owned());
                parent = parent_of(parent);
            }
            for parent in missing.into_iter().rev() {
                state.nodes.insert(
                    parent,
                    StoredNode {
                        data: Vec::new(),
                        ephemeral_owner: None,
                        version: 0,
                    },
                );
            }
        }
        let op = Op::Create {
            path: path.to_owned(),
            data,
            mode,
        };
        apply(&mut state.nodes, session, op)
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        self.live_session()?;
        let state = self.ensemble.state();
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<(), ServiceError> {
        let session = self.live_session()?;
        let mut state = self.ensemble.state();
        let op = Op::SetData {
            path: path.to_owned(),
            data,
        };
        apply(&mut state.nodes, session, op)
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, ServiceError> {
        self.live_session()?;
        let state = self.ensemble.state();
        Ok(state.nodes.get(path).map(stat_of))
    }

    async fn exists_many(&self, paths: &[String]) -> Result<Vec<Option<NodeStat>>, ServiceError> {
        self.live_session()?;
        let state = self.ensemble.state();
        Ok(paths
            .iter()
            .map(|path| state.nodes.get(path).map(stat_of))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        let session = self.live_session()?;
        let mut state = self.ensemble.state();
        apply(
            &mut state.nodes,
            session,
            Op::Delete {
                path: path.to_owned(),
            },
        )
    }

    async fn commit(&self, ops: Vec<Op>) -> Result<(), ServiceError> {
        let session = self.live_session()?;
        let mut state = self.ensemble.state();
        let mut nodes = state.nodes.clone();
        for op in ops {
            apply(&mut nodes, session, op)?;
        }
        state.nodes = nodes;
        Ok(())
    }

    async fn acquire_mutex(&self, path: &str) -> Result<(), ServiceError> {
        let session = self.live_session()?;
        let permit = self
            .ensemble
            .semaphore(path)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::ConnectionLoss)?;

        // the session might have ended while waiting
        if self.live_session()? != session {
            return Err(ServiceError::SessionExpired);
        }
        self.held().insert(path.to_owned(), permit);
        Ok(())
    }

    fn release_mutex(&self, path: &str) -> Result<(), ServiceError> {
        match self.held().remove(path) {
            Some(_permit) => Ok(()),
            None => Err(ServiceError::NoNode(path.to_owned())),
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        match *self.client_state() {
            ClientState::Connected(session) => Some(session),
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.client_state(), ClientState::Connected(_))
    }

    fn session_timeout(&self) -> Duration {
        self.ensemble.session_timeout
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = InMemoryCoordination::new();
        let client = ensemble.connect();

        let result = client
            .create("/a/b", vec![], CreateMode::Persistent, false)
            .await;
        assert_eq!(result, Err(ServiceError::NoNode("/a".into())));

        client
            .create("/a/b/c", b"c".to_vec(), CreateMode::Ephemeral, true)
            .await
            .unwrap();
        assert_eq!(ensemble.read("/a/b/c"), Some(b"c".to_vec()));
        assert_eq!(ensemble.children("/a"), vec!["b".to_owned()]);
        assert_eq!(ensemble.stat("/a/b").unwrap().ephemeral_owner, None);

        let result = client.delete("/a/b").await;
        assert_eq!(result, Err(ServiceError::NotEmpty("/a/b".into())));
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let ensemble = InMemoryCoordination::new();
        let client = ensemble.connect();
        client
            .create("/counter", b"1".to_vec(), CreateMode::Persistent, false)
            .await
            .unwrap();

        let result = client
            .commit(vec![
                Op::SetData {
                    path: "/counter".into(),
                    data: b"2".to_vec(),
                },
                Op::Delete {
                    path: "/missing".into(),
                },
            ])
            .await;
        assert_eq!(result, Err(ServiceError::NoNode("/missing".into())));
        assert_eq!(ensemble.read("/counter"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() {
        let ensemble = InMemoryCoordination::new();
        let client = ensemble.connect();
        let other = ensemble.connect();
        let mut events = client.subscribe();

        client
            .create("/mine", vec![], CreateMode::Ephemeral, false)
            .await
            .unwrap();
        other
            .create("/theirs", vec![], CreateMode::Ephemeral, false)
            .await
            .unwrap();
        client.acquire_mutex("/lock").await.unwrap();

        client.expire_session();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Lost);
        assert_eq!(ensemble.read("/mine"), None);
        assert!(ensemble.read("/theirs").is_some());
        assert_eq!(
            client.get_data("/theirs").await,
            Err(ServiceError::SessionExpired)
        );

        // the mutex of the expired session is free again
        other.acquire_mutex("/lock").await.unwrap();
        other.release_mutex("/lock").unwrap();

        let expired = client.session_id();
        client.reconnect();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Reconnected);
        assert!(client.is_connected());
        assert_ne!(client.session_id(), expired);
    }

    #[tokio::test]
    async fn test_suspension_keeps_session() {
        let ensemble = InMemoryCoordination::new();
        let client = ensemble.connect();
        let session = client.session_id();
        client
            .create("/mine", vec![], CreateMode::Ephemeral, false)
            .await
            .unwrap();

        client.suspend();
        assert_eq!(client.exists("/mine").await, Err(ServiceError::ConnectionLoss));

        client.resume();
        assert_eq!(client.session_id(), session);
        assert!(client.exists("/mine").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mutex_is_exclusive() {
        let ensemble = InMemoryCoordination::new();
        let first = ensemble.connect();
        let second = ensemble.connect();

        first.acquire_mutex("/lock").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), second.acquire_mutex("/lock")).await;
        assert!(blocked.is_err());

        first.release_mutex("/lock").unwrap();
        second.acquire_mutex("/lock").await.unwrap();
        assert!(first.release_mutex("/lock").is_err());
    }
}
