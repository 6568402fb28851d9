use crate::keys::KeySet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const USER_DATA_FILE: &str = "userdata.json";

/// State directory below `$HOME` when none is configured.
const HOME_STATE_DIR: &str = ".local/state/inco";

/// Role a vertex plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VertexRole {
    Node,
    Endpoint,
}

impl std::fmt::Display for VertexRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VertexRole::Node => f.write_str("NODE"),
            VertexRole::Endpoint => f.write_str("ENDPOINT"),
        }
    }
}

/// The node's identity and configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// Assigned by the graph on registration.
    pub nickname: Option<String>,
    pub key_set: Option<KeySet>,
    pub message_port: Option<u32>,
    pub file_port: Option<u32>,
    #[serde(default)]
    pub online: bool,
    pub role: Option<VertexRole>,
    pub relay_path: Option<PathBuf>,
    pub endpoint_path: Option<PathBuf>,
    pub temp_path: Option<PathBuf>,
    /// Bearer token for the current graph session.
    #[serde(default)]
    pub token: Option<String>,
}

impl UserData {
    pub fn is_registered(&self) -> bool {
        self.nickname.is_some()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no user data found at {0}")]
    NotFound(PathBuf),

    #[error("no state directory configured and HOME is not set")]
    NoStateDir,

    #[error("invalid user data: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence for [`UserData`].
pub trait UserDataStore: Send + Sync {
    fn read_user_data(&self) -> Result<UserData, StoreError>;
    fn write_user_data(&self, user: &UserData) -> Result<(), StoreError>;
}

/// Stores the user data as pretty JSON in a private state directory.
pub struct JsonUserDataStore {
    path: PathBuf,
}

impl JsonUserDataStore {
    /// Open the store in `state_dir`, falling back to `~/.local/state/inco`.
    /// The directory is created if needed and restricted to the owner.
    pub fn open(state_dir: Option<&Path>) -> Result<Self, StoreError> {
        let dir = match state_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(HOME_STATE_DIR))
                .ok_or(StoreError::NoStateDir)?,
        };
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            path: dir.join(USER_DATA_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UserDataStore for JsonUserDataStore {
    fn read_user_data(&self) -> Result<UserData, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    fn write_user_data(&self, user: &UserData) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(user)?;
        std::fs::write(&self.path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
