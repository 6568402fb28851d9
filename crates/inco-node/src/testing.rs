//! In-memory collaborators for exercising a node without network or disk.

use crate::console::{Console, ConsoleCapture};
use crate::session::{Collaborators, NodeSession};
use anyhow::{Result, bail};
use async_trait::async_trait;
use inco_mesh::graph::{Authenticator, GraphError, LoginGrant, Registrar, Registration};
use inco_mesh::receiver::Listener;
use inco_mesh::relay::RelayDirectory;
use inco_mesh::user_data::{StoreError, UserData, UserDataStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A graph call recorded by [`FakeGraph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphCall {
    Register,
    Unregister,
    Login,
    Logoff,
}

/// Graph backend double. Checks the same preconditions as the real client and
/// records every call.
pub struct FakeGraph {
    nickname: String,
    calls: Mutex<Vec<GraphCall>>,
    failing: AtomicBool,
}

impl FakeGraph {
    /// A backend that hands out `nickname` on registration.
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every following call fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GraphCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: GraphCall) -> Result<(), GraphError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(GraphError::Backend {
                status: 503,
                message: "graph unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn token(&self) -> String {
        format!("token-{}", self.nickname)
    }
}

#[async_trait]
impl Registrar for FakeGraph {
    async fn register(&self, user: &UserData) -> Result<Registration, GraphError> {
        self.record(GraphCall::Register)?;
        if user.key_set.is_none() {
            return Err(GraphError::KeySetMissing);
        }
        if user.role.is_none() {
            return Err(GraphError::RoleMissing);
        }
        Ok(Registration {
            nickname: self.nickname.clone(),
            token: self.token(),
        })
    }

    async fn unregister(&self, user: &UserData) -> Result<(), GraphError> {
        self.record(GraphCall::Unregister)?;
        if user.nickname.is_none() {
            return Err(GraphError::UserDataMissing("nickname"));
        }
        if user.token.is_none() {
            return Err(GraphError::TokenMissing);
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for FakeGraph {
    async fn login(&self, user: &UserData) -> Result<LoginGrant, GraphError> {
        self.record(GraphCall::Login)?;
        if user.nickname.is_none() {
            return Err(GraphError::UserDataMissing("nickname"));
        }
        if user.key_set.is_none() {
            return Err(GraphError::KeySetMissing);
        }
        Ok(LoginGrant {
            token: self.token(),
        })
    }

    async fn logoff(&self, user: &UserData) -> Result<(), GraphError> {
        self.record(GraphCall::Logoff)?;
        if user.token.is_none() {
            return Err(GraphError::TokenMissing);
        }
        Ok(())
    }
}

/// User data store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    stored: Mutex<Option<UserData>>,
    writes: Mutex<Vec<UserData>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `user`.
    pub fn with(user: UserData) -> Self {
        Self {
            stored: Mutex::new(Some(user)),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn last_written(&self) -> Option<UserData> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl UserDataStore for MemoryStore {
    fn read_user_data(&self) -> Result<UserData, StoreError> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| StoreError::NotFound(PathBuf::from("memory")))
    }

    fn write_user_data(&self, user: &UserData) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        *self.stored.lock().unwrap_or_else(PoisonError::into_inner) = Some(user.clone());
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user.clone());
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Failure {
    None,
    Setup,
    Run,
}

/// Listener that idles until cancelled, then lingers before exiting.
pub struct FakeListener {
    watch: ListenerWatch,
    linger: Duration,
    failure: Failure,
}

/// Observes a [`FakeListener`] after it has been handed to a supervisor.
#[derive(Clone, Default)]
pub struct ListenerWatch {
    alive: Arc<AtomicBool>,
    set_up: Arc<AtomicBool>,
}

impl ListenerWatch {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn was_set_up(&self) -> bool {
        self.set_up.load(Ordering::SeqCst)
    }
}

impl FakeListener {
    pub fn new() -> (Self, ListenerWatch) {
        Self::build(Duration::ZERO, Failure::None)
    }

    pub fn with_linger(linger: Duration) -> (Self, ListenerWatch) {
        Self::build(linger, Failure::None)
    }

    pub fn failing_setup() -> (Self, ListenerWatch) {
        Self::build(Duration::ZERO, Failure::Setup)
    }

    /// A listener whose run loop errors right after the stop request.
    pub fn failing_run() -> (Self, ListenerWatch) {
        Self::build(Duration::ZERO, Failure::Run)
    }

    fn build(linger: Duration, failure: Failure) -> (Self, ListenerWatch) {
        let watch = ListenerWatch::default();
        let listener = Self {
            watch: watch.clone(),
            linger,
            failure,
        };
        (listener, watch)
    }
}

#[async_trait]
impl Listener for FakeListener {
    async fn setup(&mut self) -> Result<()> {
        if matches!(self.failure, Failure::Setup) {
            bail!("port already in use");
        }
        self.watch.set_up.store(true, Ordering::SeqCst);
        self.watch.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run(self, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        tokio::time::sleep(self.linger).await;
        self.watch.alive.store(false, Ordering::SeqCst);
        if matches!(self.failure, Failure::Run) {
            bail!("connection reset");
        }
        Ok(())
    }
}

/// A session wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub graph: Arc<FakeGraph>,
    pub store: Arc<MemoryStore>,
    pub relay: Arc<RelayDirectory>,
    pub console: Console,
    pub output: ConsoleCapture,
    pub work_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let (console, output) = Console::capture();
        Self {
            graph: Arc::new(FakeGraph::new("alice")),
            store: Arc::new(store),
            relay: Arc::new(RelayDirectory::new()),
            console,
            output,
            work_dir: PathBuf::from("/srv/inco"),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            registrar: self.graph.clone(),
            authenticator: self.graph.clone(),
            relay: self.relay.clone(),
        }
    }

    /// A session starting from `user`, without touching the store.
    pub fn session(&self, user: UserData) -> NodeSession {
        NodeSession::new(
            user,
            self.collaborators(),
            self.console.clone(),
            self.work_dir.clone(),
        )
    }

    /// A session loaded from the store.
    pub fn load_session(&self) -> NodeSession {
        NodeSession::load(
            self.collaborators(),
            self.console.clone(),
            self.work_dir.clone(),
        )
    }

    /// Console output with timestamps stripped.
    pub fn lines(&self) -> Vec<String> {
        self.output.lines()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
