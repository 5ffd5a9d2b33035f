use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use singleton_core::{
    ConnectionEvent, CoordinationStore, CreateMode, SessionId, StoreError, StoreResult,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 内存协调存储实现
///
/// A linearizable hierarchical store shared by every simulated node of one
/// cluster. Nodes attach through [`InMemoryCoordinationStore::connect`], which
/// opens a session; each [`InMemorySession`] can be disconnected, reconnected,
/// expired or killed to exercise connection-loss handling.
#[derive(Debug, Clone)]
pub struct InMemoryCoordinationStore {
    state: Arc<Mutex<ClusterState>>,
    session_timeout: Duration,
    report_session_timeout: bool,
}

#[derive(Debug)]
struct StoreNode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
}

impl StoreNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            ephemeral_owner,
            children: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
struct ClusterState {
    nodes: HashMap<String, StoreNode>,
    expired_sessions: HashSet<SessionId>,
    next_session: u64,
    legacy_elections: HashSet<String>,
}

impl ClusterState {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), StoreNode::new(Vec::new(), None));
        Self {
            nodes,
            expired_sessions: HashSet::new(),
            next_session: 0,
            legacy_elections: HashSet::new(),
        }
    }

    fn allocate_session(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }

    fn node(&self, path: &str) -> StoreResult<&StoreNode> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        ephemeral_owner: Option<SessionId>,
    ) -> StoreResult<()> {
        validate_path(path)?;
        if path == "/" || self.nodes.contains_key(path) {
            return Err(StoreError::PathExists(path.to_string()));
        }

        let (parent, name) = split_path(path);
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NoNode(parent.to_string()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(StoreError::InvalidPath(format!(
                "ephemeral {parent} cannot have children"
            )));
        }
        parent_node.children.insert(name.to_string());

        self.nodes
            .insert(path.to_string(), StoreNode::new(data.to_vec(), ephemeral_owner));
        Ok(())
    }

    fn delete(&mut self, path: &str) -> StoreResult<()> {
        let node = self.node(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        let (parent, name) = split_path(path);
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.remove(name);
        }
        Ok(())
    }

    /// Marks the session expired and drops every ephemeral it owns.
    fn expire(&mut self, session: SessionId) -> usize {
        self.expired_sessions.insert(session);
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            let _ = self.delete(path);
        }
        owned.len()
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

fn lock_state(state: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryCoordinationStore {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new())),
            session_timeout,
            report_session_timeout: true,
        }
    }

    /// Sessions opened afterwards report no timeout, like clients that cannot query it.
    pub fn with_hidden_session_timeout(mut self) -> Self {
        self.report_session_timeout = false;
        self
    }

    /// Opens a new session for one simulated node.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let session = lock_state(&self.state).allocate_session();
        let (events, _) = broadcast::channel(64);
        debug!(session = %session, "Opened in-memory store session");

        Arc::new(InMemorySession {
            state: self.state.clone(),
            session: Mutex::new(session),
            connected: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            epoch: Arc::new(AtomicU64::new(0)),
            session_timeout: self.session_timeout,
            report_session_timeout: self.report_session_timeout,
            events,
        })
    }

    pub fn node_exists(&self, path: &str) -> bool {
        lock_state(&self.state).nodes.contains_key(path)
    }

    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        lock_state(&self.state)
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    pub fn node_children(&self, path: &str) -> Vec<String> {
        lock_state(&self.state)
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulates an older deployment contending through leader election.
    pub fn register_legacy_election(&self, name: &str) {
        lock_state(&self.state)
            .legacy_elections
            .insert(name.to_string());
    }

    pub fn clear_legacy_election(&self, name: &str) {
        lock_state(&self.state).legacy_elections.remove(name);
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(singleton_core::config::DEFAULT_SESSION_TIMEOUT_MS))
    }
}

/// One node's session against an [`InMemoryCoordinationStore`].
#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<Mutex<ClusterState>>,
    session: Mutex<SessionId>,
    connected: AtomicBool,
    killed: AtomicBool,
    unavailable: AtomicBool,
    /// Bumped on every disconnect/reconnect so stale expiry timers do nothing.
    epoch: Arc<AtomicU64>,
    session_timeout: Duration,
    report_session_timeout: bool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemorySession {
    fn current_session(&self) -> SessionId {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks cluster state after checking this client may issue requests.
    fn checked_state(&self) -> StoreResult<(MutexGuard<'_, ClusterState>, SessionId)> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        let state = lock_state(&self.state);
        let session = self.current_session();
        if state.expired_sessions.contains(&session) {
            return Err(StoreError::SessionExpired);
        }
        Ok((state, session))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Makes every request fail with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops the connection. The session expires cluster-side unless
    /// [`reconnect`](Self::reconnect) is called within the session timeout.
    pub fn disconnect(&self) {
        if self.killed.load(Ordering::SeqCst) || !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.current_session();
        info!(session = %session, "In-memory store connection lost");
        self.emit(ConnectionEvent::Lost);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, session will only expire explicitly");
            return;
        };
        let state = self.state.clone();
        let epoch_counter = self.epoch.clone();
        let timeout = self.session_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if epoch_counter.load(Ordering::SeqCst) == epoch {
                let removed = lock_state(&state).expire(session);
                info!(session = %session, removed, "Session expired while disconnected");
            }
        });
    }

    /// Restores the connection, opening a fresh session if the old one expired.
    pub fn reconnect(&self) {
        if self.killed.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = lock_state(&self.state);
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if state.expired_sessions.contains(&session) {
                *session = state.allocate_session();
                info!(session = %*session, "Reconnected with a new session");
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::RegainedAfterLost);
    }

    /// Expires the session immediately and reconnects under a new one.
    pub fn expire_session(&self) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock_state(&self.state);
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = state.expire(*session);
            info!(session = %*session, removed, "Session expired");
            *session = state.allocate_session();
        }
        if self.connected.load(Ordering::SeqCst) {
            self.emit(ConnectionEvent::Lost);
            self.emit(ConnectionEvent::RegainedAfterLost);
        }
    }

    /// Simulates a crashed node: the session expires and never comes back.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let session = self.current_session();
        let removed = lock_state(&self.state).expire(session);
        info!(session = %session, removed, "Session killed");
        if was_connected {
            self.emit(ConnectionEvent::Lost);
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()> {
        let (mut state, session) = self.checked_state()?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session),
        };
        state.create(path, data, owner)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let (mut state, _) = self.checked_state()?;
        state.delete(path)
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let (state, _) = self.checked_state()?;
        validate_path(path)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let (state, _) = self.checked_state()?;
        validate_path(path)?;
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let (mut state, _) = self.checked_state()?;
        validate_path(path)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Ok(())
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let (state, _) = self.checked_state()?;
        Ok(state.node(path)?.children.iter().cloned().collect())
    }

    async fn ephemeral_owner(&self, path: &str) -> StoreResult<Option<SessionId>> {
        let (state, _) = self.checked_state()?;
        validate_path(path)?;
        Ok(state.nodes.get(path).and_then(|node| node.ephemeral_owner))
    }

    async fn election_path_exists(&self, name: &str) -> StoreResult<bool> {
        let (state, _) = self.checked_state()?;
        Ok(state.legacy_elections.contains(name))
    }

    fn session_id(&self) -> SessionId {
        self.current_session()
    }

    fn session_timeout(&self) -> Option<Duration> {
        self.report_session_timeout.then_some(self.session_timeout)
    }

    fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent_and_rejects_duplicates() {
        let store = InMemoryCoordinationStore::default();
        let session = store.connect();

        assert_eq!(
            session.create("/a/b", b"", CreateMode::Persistent).await,
            Err(StoreError::NoNode("/a".to_string()))
        );
        session.create("/a", b"", CreateMode::Persistent).await.unwrap();
        session.create("/a/b", b"x", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            session.create("/a/b", b"y", CreateMode::Persistent).await,
            Err(StoreError::PathExists("/a/b".to_string()))
        );
        assert_eq!(session.get_data("/a/b").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(session.get_children("/a").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let store = InMemoryCoordinationStore::default();
        let session = store.connect();
        session.ensure_path("/a").await.unwrap();
        session.ensure_path("/a").await.unwrap();
        session.create("/a/b", b"", CreateMode::Persistent).await.unwrap();

        assert_eq!(
            session.delete("/a").await,
            Err(StoreError::NotEmpty("/a".to_string()))
        );
        session.delete("/a/b").await.unwrap();
        assert_eq!(
            session.delete("/a/b").await,
            Err(StoreError::NoNode("/a/b".to_string()))
        );
        session.delete_if_exists("/a/b").await.unwrap();
        assert!(session.get_children("/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_paths_are_rejected() {
        let store = InMemoryCoordinationStore::default();
        let session = store.connect();
        for path in ["relative", "/trailing/", "/double//slash"] {
            assert!(matches!(
                session.create(path, b"", CreateMode::Persistent).await,
                Err(StoreError::InvalidPath(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_vanish_with_session() {
        let store = InMemoryCoordinationStore::default();
        let owner = store.connect();
        let observer = store.connect();
        owner.ensure_path("/task").await.unwrap();
        owner
            .create("/task/booking", b"me", CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(
            observer.ephemeral_owner("/task/booking").await.unwrap(),
            Some(owner.session_id())
        );

        let old_session = owner.session_id();
        owner.expire_session();
        assert_ne!(owner.session_id(), old_session);
        assert!(!observer.exists("/task/booking").await.unwrap());
        assert!(observer.exists("/task").await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_within_timeout_keeps_session() {
        let store = InMemoryCoordinationStore::new(Duration::from_millis(200));
        let session = store.connect();
        let mut events = session.subscribe_connection_events();
        session.ensure_path("/task").await.unwrap();
        session
            .create("/task/booking", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        let original = session.session_id();

        session.disconnect();
        assert_eq!(session.exists("/task").await, Err(StoreError::ConnectionLoss));
        session.reconnect();

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Lost);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::RegainedAfterLost);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.session_id(), original);
        assert!(store.node_exists("/task/booking"));
    }

    #[tokio::test]
    async fn test_disconnect_past_timeout_expires_session() {
        let store = InMemoryCoordinationStore::new(Duration::from_millis(50));
        let session = store.connect();
        session.ensure_path("/task").await.unwrap();
        session
            .create("/task/booking", b"", CreateMode::Ephemeral)
            .await
            .unwrap();
        let original = session.session_id();

        session.disconnect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.node_exists("/task/booking"));

        session.reconnect();
        assert_ne!(session.session_id(), original);
        assert!(session.exists("/task").await.unwrap());
    }

    #[tokio::test]
    async fn test_kill_is_permanent() {
        let store = InMemoryCoordinationStore::default();
        let session = store.connect();
        session.ensure_path("/task").await.unwrap();
        session
            .create("/task/booking", b"", CreateMode::Ephemeral)
            .await
            .unwrap();

        session.kill();
        session.reconnect();
        assert!(!session.is_connected());
        assert!(!store.node_exists("/task/booking"));
        assert_eq!(session.exists("/task").await, Err(StoreError::ConnectionLoss));
    }

    #[tokio::test]
    async fn test_legacy_election_and_injected_failures() {
        let store = InMemoryCoordinationStore::default().with_hidden_session_timeout();
        let session = store.connect();
        assert_eq!(session.session_timeout(), None);

        assert!(!session.election_path_exists("refresh").await.unwrap());
        store.register_legacy_election("refresh");
        assert!(session.election_path_exists("refresh").await.unwrap());
        store.clear_legacy_election("refresh");
        assert!(!session.election_path_exists("refresh").await.unwrap());

        session.set_unavailable(true);
        assert!(matches!(
            session.exists("/").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
