//! Relay bookkeeping: which endpoints currently use this node as their relay,
//! and a disk spool for messages addressed to endpoints that are offline.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};

struct ConnectedEndpoint {
    nickname: String,
    connection_id: u64,
    outbound: mpsc::Sender<String>,
}

/// Endpoints connected to this node, kept in connection order.
#[derive(Default)]
pub struct RelayDirectory {
    endpoints: RwLock<Vec<ConnectedEndpoint>>,
    next_id: AtomicU64,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an endpoint connection. A nickname that reconnects replaces its
    /// previous connection and moves to the end of the list.
    ///
    /// Returns the connection id to pass to [`RelayDirectory::disconnect`].
    pub async fn connect(&self, nickname: &str, outbound: mpsc::Sender<String>) -> u64 {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut endpoints = self.endpoints.write().await;
        endpoints.retain(|e| e.nickname != nickname);
        endpoints.push(ConnectedEndpoint {
            nickname: nickname.to_string(),
            connection_id,
            outbound,
        });
        connection_id
    }

    /// Forget a connection. Stale ids (the nickname reconnected since) are ignored.
    pub async fn disconnect(&self, nickname: &str, connection_id: u64) {
        self.endpoints
            .write()
            .await
            .retain(|e| !(e.nickname == nickname && e.connection_id == connection_id));
    }

    /// Outbound line channel for a connected endpoint.
    pub async fn sender(&self, nickname: &str) -> Option<mpsc::Sender<String>> {
        self.endpoints
            .read()
            .await
            .iter()
            .find(|e| e.nickname == nickname)
            .map(|e| e.outbound.clone())
    }

    pub async fn connected_nicknames(&self) -> Vec<String> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|e| e.nickname.clone())
            .collect()
    }
}

/// Nicknames end up in file names, so only a conservative charset is allowed.
pub fn validate_nickname(nickname: &str) -> Result<()> {
    if nickname.is_empty() || nickname.len() > 64 {
        bail!("nickname must be 1-64 characters");
    }
    if !nickname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("nickname may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}

/// Line-per-message spool for endpoints that are not connected.
///
/// Connecting an endpoint and delivering to it are serialised, so a message is
/// either sent live or spooled before the endpoint's next drain.
pub struct RelaySpool {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl RelaySpool {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn spool_path(&self, nickname: &str) -> Result<PathBuf> {
        validate_nickname(nickname)?;
        Ok(self.dir.join(format!("{nickname}.jsonl")))
    }

    /// Register `nickname` in `relay` and take everything spooled for it,
    /// oldest first. Returns the connection id and the spooled lines.
    pub async fn connect(
        &self,
        relay: &RelayDirectory,
        nickname: &str,
        outbound: mpsc::Sender<String>,
    ) -> (u64, Vec<String>) {
        let _guard = self.lock.lock().await;
        let connection_id = relay.connect(nickname, outbound).await;
        let queued = self.drain(nickname).await.unwrap_or_else(|e| {
            tracing::warn!(%nickname, err = %e, "failed to drain relay spool");
            Vec::new()
        });
        (connection_id, queued)
    }

    /// Hand `line` to `nickname` if it is connected and keeping up, otherwise
    /// spool it. Returns whether it went to a live connection.
    pub async fn deliver(
        &self,
        relay: &RelayDirectory,
        nickname: &str,
        line: String,
    ) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let line = match relay.sender(nickname).await {
            Some(tx) => match tx.try_send(line) {
                Ok(()) => return Ok(true),
                Err(TrySendError::Full(line) | TrySendError::Closed(line)) => line,
            },
            None => line,
        };
        self.append(nickname, &line).await?;
        Ok(false)
    }

    async fn append(&self, nickname: &str, line: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let path = self.spool_path(nickname)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn drain(&self, nickname: &str) -> Result<Vec<String>> {
        let path = self.spool_path(nickname)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(data
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_directory_lists_nothing() {
        let dir = RelayDirectory::new();
        assert!(dir.connected_nicknames().await.is_empty());
    }

    #[tokio::test]
    async fn nicknames_keep_connection_order() {
        let dir = RelayDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        dir.connect("bob", tx.clone()).await;
        dir.connect("carol", tx.clone()).await;
        dir.connect("dave", tx).await;
        assert_eq!(dir.connected_nicknames().await, vec!["bob", "carol", "dave"]);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_connection() {
        let dir = RelayDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        let first = dir.connect("bob", tx.clone()).await;
        let second = dir.connect("bob", tx).await;
        assert_ne!(first, second);

        dir.disconnect("bob", first).await;
        assert_eq!(dir.connected_nicknames().await, vec!["bob"]);

        dir.disconnect("bob", second).await;
        assert!(dir.connected_nicknames().await.is_empty());
        assert!(dir.sender("bob").await.is_none());
    }

    #[test]
    fn nickname_validation() {
        assert!(validate_nickname("alice_01").is_ok());
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname("../etc").is_err());
        assert!(validate_nickname(&"a".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn offline_lines_are_handed_over_on_connect() {
        let tmp = TempDir::new().unwrap();
        let relay = RelayDirectory::new();
        let spool = RelaySpool::new(&tmp.path().join("Relay"));
        assert!(!spool.deliver(&relay, "bob", "one".into()).await.unwrap());
        assert!(!spool.deliver(&relay, "bob", "two".into()).await.unwrap());

        let (tx, mut rx) = mpsc::channel(4);
        let (_, queued) = spool.connect(&relay, "bob", tx.clone()).await;
        assert_eq!(queued, vec!["one", "two"]);

        assert!(spool.deliver(&relay, "bob", "three".into()).await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "three");

        // Reconnecting finds nothing left over.
        let (_, queued) = spool.connect(&relay, "bob", tx).await;
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn full_endpoint_queue_spools_instead_of_blocking() {
        let tmp = TempDir::new().unwrap();
        let relay = RelayDirectory::new();
        let spool = RelaySpool::new(tmp.path());
        let (tx, _rx) = mpsc::channel(1);
        spool.connect(&relay, "bob", tx.clone()).await;

        assert!(spool.deliver(&relay, "bob", "first".into()).await.unwrap());
        assert!(!spool.deliver(&relay, "bob", "second".into()).await.unwrap());

        let (_, queued) = spool.connect(&relay, "bob", tx).await;
        assert_eq!(queued, vec!["second"]);
    }

    #[tokio::test]
    async fn no_line_is_lost_while_an_endpoint_connects() {
        let tmp = TempDir::new().unwrap();
        let relay = Arc::new(RelayDirectory::new());
        let spool = Arc::new(RelaySpool::new(tmp.path()));
        let (tx, mut rx) = mpsc::channel(512);

        let mut senders = Vec::new();
        for i in 0..200 {
            let relay = relay.clone();
            let spool = spool.clone();
            senders.push(tokio::spawn(async move {
                spool.deliver(&relay, "bob", format!("m{i}")).await.unwrap()
            }));
        }
        let (_, queued) = spool.connect(&relay, "bob", tx).await;
        for sender in senders {
            sender.await.unwrap();
        }

        // Each line was either drained on connect or sent live afterwards.
        let mut seen = queued;
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn spool_rejects_path_like_nicknames() {
        let tmp = TempDir::new().unwrap();
        let relay = RelayDirectory::new();
        let spool = RelaySpool::new(tmp.path());
        assert!(spool.deliver(&relay, "../bob", "x".into()).await.is_err());
    }
}
