use crate::console::Console;
use crate::supervisor::ListenerSupervisor;
use anyhow::{Result, bail};
use inco_mesh::graph::{Authenticator, Registrar};
use inco_mesh::keys::KeySet;
use inco_mesh::receiver::Listener;
use inco_mesh::relay::RelayDirectory;
use inco_mesh::user_data::{StoreError, UserData, UserDataStore, VertexRole};
use std::path::PathBuf;
use std::sync::Arc;

pub const STANDARD_MESSAGE_PORT: u32 = 1312;
pub const STANDARD_FILE_PORT: u32 = 1337;

/// The operator's answer to the port prompts. `None` means "use the standard port".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortChoice {
    pub message: Option<u32>,
    pub file: Option<u32>,
}

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn UserDataStore>,
    pub registrar: Arc<dyn Registrar>,
    pub authenticator: Arc<dyn Authenticator>,
    pub relay: Arc<RelayDirectory>,
}

/// Registration and session lifecycle of this node, plus its listener.
pub struct NodeSession {
    user: UserData,
    store: Arc<dyn UserDataStore>,
    registrar: Arc<dyn Registrar>,
    authenticator: Arc<dyn Authenticator>,
    relay: Arc<RelayDirectory>,
    console: Console,
    work_dir: PathBuf,
    ports_fixed: bool,
    listener: Option<ListenerSupervisor>,
}

impl NodeSession {
    pub fn new(
        user: UserData,
        collaborators: Collaborators,
        console: Console,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            user,
            store: collaborators.store,
            registrar: collaborators.registrar,
            authenticator: collaborators.authenticator,
            relay: collaborators.relay,
            console,
            work_dir,
            ports_fixed: false,
            listener: None,
        }
    }

    /// Start from the stored user data, or from scratch on first run.
    pub fn load(collaborators: Collaborators, console: Console, work_dir: PathBuf) -> Self {
        let user = match collaborators.store.read_user_data() {
            Ok(user) => user,
            Err(StoreError::NotFound(_)) => {
                console.print_line("INFO: No userdata found! Creating new userdata...");
                UserData::default()
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to read user data, starting fresh");
                UserData::default()
            }
        };
        Self::new(user, collaborators, console, work_dir)
    }

    /// Whether [`NodeSession::configure`] will use a port choice. Registered
    /// nodes keep their ports, and ports are fixed once per process.
    pub fn needs_ports(&self) -> bool {
        !self.ports_fixed && self.user.nickname.is_none()
    }

    /// Prepare the node for registration. Safe to call repeatedly: the key set
    /// is generated once and ports are only applied on the first call.
    pub fn configure(&mut self, ports: PortChoice) {
        if self.user.key_set.is_none() {
            self.console.print_line("INFO: Generating key set...");
            self.user.key_set = Some(KeySet::generate());
        }

        if !self.ports_fixed {
            if self.user.nickname.is_none() {
                self.user.message_port = Some(ports.message.unwrap_or(STANDARD_MESSAGE_PORT));
                self.user.file_port = Some(ports.file.unwrap_or(STANDARD_FILE_PORT));
            }
            self.user.relay_path = Some(self.work_dir.join("Relay"));
            self.user.endpoint_path = Some(self.work_dir.join("Endpoint"));
            self.user.temp_path = Some(self.work_dir.join("Temp"));
            self.user.role = Some(VertexRole::Node);
            self.ports_fixed = true;
        }

        // Stored data from an older run may lack ports.
        self.user.message_port.get_or_insert(STANDARD_MESSAGE_PORT);
        self.user.file_port.get_or_insert(STANDARD_FILE_PORT);

        self.persist();
    }

    pub async fn register(&mut self) {
        if self.user.nickname.is_some() {
            self.console.print_line("INFO: Node already registered.");
            return;
        }

        self.console.print_line("INFO: Registering Node...");
        match self.registrar.register(&self.user).await {
            Ok(registration) => {
                self.console
                    .print_line(format!("INFO: Node registered as {}.", registration.nickname));
                self.user.nickname = Some(registration.nickname);
                self.user.token = Some(registration.token);
                self.user.online = true;
                self.persist();
            }
            Err(e) => tracing::warn!(err = %e, "registration failed"),
        }
    }

    pub async fn unregister(&mut self) {
        self.console.print_line("INFO: Unregistering Node...");
        match self.registrar.unregister(&self.user).await {
            Ok(()) => {
                self.user.nickname = None;
                self.user.token = None;
                self.user.online = false;
                self.persist();
                self.console.print_line("INFO: Node unregistered.");
            }
            Err(e) => tracing::warn!(err = %e, "unregistration failed"),
        }
    }

    pub async fn login(&mut self) {
        self.console.print_line("INFO: Logging in Node...");
        match self.authenticator.login(&self.user).await {
            Ok(grant) => {
                self.user.token = Some(grant.token);
                self.user.online = true;
                self.persist();
                self.console.print_line("INFO: Node logged in.");
            }
            Err(e) => tracing::warn!(err = %e, "login failed"),
        }
    }

    pub async fn logout(&mut self) {
        if self.user.nickname.is_none() {
            self.console.print_line("INFO: Node not registered.");
            return;
        }

        self.console.print_line("INFO: Logging out Node...");
        match self.authenticator.logoff(&self.user).await {
            Ok(()) => {
                self.user.online = false;
                self.user.token = None;
                self.persist();
                self.console.print_line("INFO: Node logged out.");
            }
            Err(e) => tracing::warn!(err = %e, "logout failed"),
        }
    }

    /// Spawn the background listener. Requires configured ports.
    pub async fn start_listener<L: Listener>(&mut self, listener: L) -> Result<()> {
        if self.listener.is_some() {
            bail!("listener already started");
        }
        if self.user.message_port.is_none() || self.user.file_port.is_none() {
            bail!("node is not configured");
        }
        self.listener = Some(ListenerSupervisor::start(listener).await?);
        Ok(())
    }

    /// Log out, stop the listener and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.console.print_line("INFO: Initiated shutdown...");
        self.logout().await;

        self.console.print_line("INFO: Shutting down receiver...");
        if let Some(listener) = self.listener.take() {
            listener.stop().await_termination().await;
        }
        self.console.print_line("INFO: Node stopped.");
    }

    pub fn nickname(&self) -> Option<&str> {
        self.user.nickname.as_deref()
    }

    pub fn message_port(&self) -> Option<u32> {
        self.user.message_port
    }

    pub fn file_port(&self) -> Option<u32> {
        self.user.file_port
    }

    pub fn user_data(&self) -> &UserData {
        &self.user
    }

    pub fn relay(&self) -> &Arc<RelayDirectory> {
        &self.relay
    }

    pub fn listener_alive(&self) -> bool {
        self.listener.as_ref().is_some_and(ListenerSupervisor::is_alive)
    }

    pub async fn connected_nicknames(&self) -> Vec<String> {
        self.relay.connected_nicknames().await
    }

    fn persist(&self) {
        if let Err(e) = self.store.write_user_data(&self.user) {
            tracing::warn!(err = %e, "failed to save user data");
        }
    }
}
