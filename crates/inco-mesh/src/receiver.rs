//! The background receive service: accepts endpoint connections on the message
//! port and file uploads on the file port, relaying both to their recipients.

use crate::relay::{RelayDirectory, RelaySpool, validate_nickname};
use crate::user_data::UserData;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Maximum length of one protocol line.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Largest file accepted on the file port.
pub const MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;

/// A background service the node supervises.
///
/// `setup` runs once on the caller's task; `run` then executes on its own task
/// and must return promptly once `cancel` fires.
#[async_trait]
pub trait Listener: Send + 'static {
    async fn setup(&mut self) -> Result<()>;
    async fn run(self, cancel: CancellationToken) -> Result<()>;
}

/// Frames sent by endpoints on the message port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Hello { nickname: String },
    Message { to: String, body: String },
}

/// Frames sent back to endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Welcome { version: String },
    Message { from: String, body: String },
    Ack { delivered: bool },
    Stored { bytes: u64 },
    Error { message: String },
}

/// Header line preceding the raw bytes of an upload on the file port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub to: String,
    pub name: String,
    pub size: u64,
}

/// Immutable snapshot of what the receiver needs from the user data.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub message_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub relay_path: PathBuf,
    pub temp_path: PathBuf,
}

impl ReceiverConfig {
    /// Build from configured user data. Ports above 65535 pass the operator
    /// prompt but cannot be bound, so they are rejected here.
    pub fn from_user_data(user: &UserData) -> Result<Self> {
        let message_port = tcp_port(user.message_port, "message")?;
        let file_port = tcp_port(user.file_port, "file")?;
        Ok(Self {
            message_addr: SocketAddr::from(([0, 0, 0, 0], message_port)),
            file_addr: SocketAddr::from(([0, 0, 0, 0], file_port)),
            relay_path: user.relay_path.clone().context("relay path not set")?,
            temp_path: user.temp_path.clone().context("temp path not set")?,
        })
    }
}

fn tcp_port(port: Option<u32>, usage: &str) -> Result<u16> {
    let port = port.with_context(|| format!("{usage} port not set"))?;
    u16::try_from(port).with_context(|| format!("{usage} port {port} is outside the TCP range"))
}

/// Listens on the message and file ports.
pub struct ReceiveHandler {
    config: ReceiverConfig,
    relay: Arc<RelayDirectory>,
    message_listener: Option<TcpListener>,
    file_listener: Option<TcpListener>,
}

impl ReceiveHandler {
    pub fn new(config: ReceiverConfig, relay: Arc<RelayDirectory>) -> Self {
        Self {
            config,
            relay,
            message_listener: None,
            file_listener: None,
        }
    }

    /// Bound addresses as `(message, file)`, available after `setup`.
    pub fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let message = self.message_listener.as_ref()?.local_addr().ok()?;
        let file = self.file_listener.as_ref()?.local_addr().ok()?;
        Some((message, file))
    }
}

#[async_trait]
impl Listener for ReceiveHandler {
    async fn setup(&mut self) -> Result<()> {
        for dir in [&self.config.relay_path, &self.config.temp_path] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let message = TcpListener::bind(self.config.message_addr)
            .await
            .with_context(|| format!("failed to bind message port {}", self.config.message_addr))?;
        let file = TcpListener::bind(self.config.file_addr)
            .await
            .with_context(|| format!("failed to bind file port {}", self.config.file_addr))?;

        tracing::info!(
            message = %message.local_addr()?,
            file = %file.local_addr()?,
            "receiver listening"
        );
        self.message_listener = Some(message);
        self.file_listener = Some(file);
        Ok(())
    }

    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (Some(message_listener), Some(file_listener)) =
            (self.message_listener, self.file_listener)
        else {
            bail!("receive handler was not set up");
        };
        let spool = Arc::new(RelaySpool::new(&self.config.relay_path));
        let relay_path = Arc::new(self.config.relay_path);
        let temp_path = Arc::new(self.config.temp_path);
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = message_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = self.relay.clone();
                        let spool = spool.clone();
                        let cancel = cancel.child_token();
                        tracker.spawn(async move {
                            if let Err(e) = handle_message_conn(stream, relay, spool, cancel).await {
                                tracing::debug!(%peer, err = %e, "endpoint disconnected");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(err = %e, "message port accept failed"),
                },
                accepted = file_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay_path = relay_path.clone();
                        let temp_path = temp_path.clone();
                        let cancel = cancel.child_token();
                        tracker.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = handle_file_conn(stream, &relay_path, &temp_path) => {
                                    if let Err(e) = result {
                                        tracing::warn!(%peer, err = %e, "file upload failed");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => tracing::warn!(err = %e, "file port accept failed"),
                },
            }
        }

        drop(message_listener);
        drop(file_listener);
        tracker.close();
        tracker.wait().await;
        tracing::info!("receiver stopped");
        Ok(())
    }
}

async fn handle_message_conn(
    stream: TcpStream,
    relay: Arc<RelayDirectory>,
    spool: Arc<RelaySpool>,
    cancel: CancellationToken,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    let mut registered: Option<(String, u64)> = None;

    let session = async {
        loop {
            tokio::select! {
                line = reader.next() => {
                    let Some(line) = line else { break };
                    let line = line?;
                    let (reply, queued) = match serde_json::from_str::<InboundFrame>(&line) {
                        Ok(InboundFrame::Hello { nickname }) => {
                            if registered.is_some() {
                                (error_frame("already introduced"), Vec::new())
                            } else if let Err(e) = validate_nickname(&nickname) {
                                (error_frame(&e.to_string()), Vec::new())
                            } else {
                                let (id, queued) =
                                    spool.connect(&relay, &nickname, outbound_tx.clone()).await;
                                tracing::info!(%nickname, "endpoint connected");
                                registered = Some((nickname, id));
                                let welcome = OutboundFrame::Welcome {
                                    version: env!("CARGO_PKG_VERSION").to_string(),
                                };
                                (welcome, queued)
                            }
                        }
                        Ok(InboundFrame::Message { to, body }) => match &registered {
                            None => (error_frame("say hello first"), Vec::new()),
                            Some((from, _)) => match relay_message(&relay, &spool, from, &to, body).await {
                                Ok(delivered) => (OutboundFrame::Ack { delivered }, Vec::new()),
                                Err(e) => (error_frame(&e.to_string()), Vec::new()),
                            },
                        },
                        Err(e) => (error_frame(&format!("invalid frame: {e}")), Vec::new()),
                    };
                    writer.send(serde_json::to_string(&reply)?).await?;
                    for line in queued {
                        writer.send(line).await?;
                    }
                }
                Some(outbound) = outbound_rx.recv() => {
                    writer.send(outbound).await?;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    // Writes to an endpoint that stopped reading block, so the whole
    // connection races the token rather than each read.
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = session => result,
    };

    if let Some((nickname, id)) = registered {
        relay.disconnect(&nickname, id).await;
        tracing::info!(%nickname, "endpoint disconnected");
    }
    result
}

/// Forward a message to a connected endpoint, or spool it. Returns whether it
/// was handed to a live connection.
async fn relay_message(
    relay: &RelayDirectory,
    spool: &RelaySpool,
    from: &str,
    to: &str,
    body: String,
) -> Result<bool> {
    let line = serde_json::to_string(&OutboundFrame::Message {
        from: from.to_string(),
        body,
    })?;
    spool.deliver(relay, to, line).await
}

fn error_frame(message: &str) -> OutboundFrame {
    OutboundFrame::Error {
        message: message.to_string(),
    }
}

/// Only bare file names are accepted; anything path-like is rejected.
fn validate_file_name(name: &str) -> Result<()> {
    let is_bare = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
    if !is_bare || name.starts_with('.') {
        bail!("invalid file name: {name}");
    }
    Ok(())
}

async fn handle_file_conn(stream: TcpStream, relay_path: &Path, temp_path: &Path) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut header_line = String::new();
    (&mut reader)
        .take(MAX_LINE_BYTES as u64)
        .read_line(&mut header_line)
        .await
        .context("failed to read file header")?;
    let header: FileHeader =
        serde_json::from_str(header_line.trim_end()).context("invalid file header")?;

    validate_nickname(&header.to)?;
    validate_file_name(&header.name)?;
    if header.size > MAX_FILE_BYTES {
        bail!("file too large: {} bytes", header.size);
    }

    let staged = temp_path.join(format!("{}.part", uuid::Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&staged)
        .await
        .with_context(|| format!("failed to create {}", staged.display()))?;
    let copied = tokio::io::copy(&mut (&mut reader).take(header.size), &mut file).await?;
    file.flush().await?;
    drop(file);

    if copied != header.size {
        tokio::fs::remove_file(&staged).await.ok();
        bail!("upload truncated: {copied} of {} bytes", header.size);
    }

    let dest_dir = relay_path.join(&header.to);
    tokio::fs::create_dir_all(&dest_dir).await?;
    let dest = dest_dir.join(&header.name);
    tokio::fs::rename(&staged, &dest)
        .await
        .with_context(|| format!("failed to move upload to {}", dest.display()))?;
    tracing::info!(to = %header.to, name = %header.name, bytes = copied, "file stored for relay");

    let ack = serde_json::to_string(&OutboundFrame::Stored { bytes: copied })?;
    reader.get_mut().write_all(format!("{ack}\n").as_bytes()).await?;
    Ok(())
}
