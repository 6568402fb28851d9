//! Client side of the graph backend: registration and session login.

use crate::user_data::{UserData, VertexRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default graph backend address, overridable with `INCO_GRAPH_URL`.
pub const DEFAULT_GRAPH_URL: &str = "http://localhost:8080";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Every way a graph call can fail. Precondition variants are raised before
/// any request leaves the node.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("key set not set")]
    KeySetMissing,

    #[error("role not set")]
    RoleMissing,

    #[error("token not set, log in first")]
    TokenMissing,

    #[error("user data not set: {0}")]
    UserDataMissing(&'static str),

    #[error("graph returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub nickname: String,
    pub token: String,
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginGrant {
    pub token: String,
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, user: &UserData) -> Result<Registration, GraphError>;
    async fn unregister(&self, user: &UserData) -> Result<(), GraphError>;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, user: &UserData) -> Result<LoginGrant, GraphError>;
    async fn logoff(&self, user: &UserData) -> Result<(), GraphError>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    public_key_b64: &'a str,
    signature_b64: String,
    role: VertexRole,
    message_port: u32,
    file_port: u32,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    nickname: &'a str,
    signature_b64: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// HTTP/JSON client for the graph backend.
#[derive(Clone)]
pub struct GraphClient {
    base_url: String,
    http: reqwest::Client,
}

impl GraphClient {
    pub fn new(base_url: &str) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("inco-node/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Map non-2xx responses to [`GraphError::Backend`], preferring the JSON
/// `message` field when the backend sends one.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GraphError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.message)
        .unwrap_or(text);
    Err(GraphError::Backend {
        status: status.as_u16(),
        message,
    })
}

fn require_nickname(user: &UserData) -> Result<&str, GraphError> {
    user.nickname
        .as_deref()
        .ok_or(GraphError::UserDataMissing("nickname"))
}

fn require_token(user: &UserData) -> Result<&str, GraphError> {
    user.token.as_deref().ok_or(GraphError::TokenMissing)
}

fn sign(user: &UserData, payload: &[u8]) -> Result<String, GraphError> {
    let key_set = user.key_set.as_ref().ok_or(GraphError::KeySetMissing)?;
    key_set
        .sign(payload)
        .map_err(|e| GraphError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

#[async_trait]
impl Registrar for GraphClient {
    async fn register(&self, user: &UserData) -> Result<Registration, GraphError> {
        let key_set = user.key_set.as_ref().ok_or(GraphError::KeySetMissing)?;
        let role = user.role.ok_or(GraphError::RoleMissing)?;
        let message_port = user
            .message_port
            .ok_or(GraphError::UserDataMissing("message port"))?;
        let file_port = user
            .file_port
            .ok_or(GraphError::UserDataMissing("file port"))?;

        let body = RegisterRequest {
            public_key_b64: &key_set.public_key_b64,
            signature_b64: sign(user, key_set.public_key_b64.as_bytes())?,
            role,
            message_port,
            file_port,
        };
        let resp = self
            .http
            .post(self.url("/vertices"))
            .json(&body)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn unregister(&self, user: &UserData) -> Result<(), GraphError> {
        let nickname = require_nickname(user)?;
        let token = require_token(user)?;
        let resp = self
            .http
            .delete(self.url(&format!("/vertices/{nickname}")))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for GraphClient {
    async fn login(&self, user: &UserData) -> Result<LoginGrant, GraphError> {
        let nickname = require_nickname(user)?;
        let body = LoginRequest {
            nickname,
            signature_b64: sign(user, nickname.as_bytes())?,
        };
        let resp = self
            .http
            .post(self.url("/sessions"))
            .json(&body)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn logoff(&self, user: &UserData) -> Result<(), GraphError> {
        let token = require_token(user)?;
        let resp = self
            .http
            .delete(self.url("/sessions"))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response and hand back the raw request.
    async fn one_shot_server(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn configured_user() -> UserData {
        UserData {
            key_set: Some(KeySet::generate()),
            role: Some(VertexRole::Node),
            message_port: Some(1312),
            file_port: Some(1337),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_requires_key_set() {
        let client = GraphClient::new("http://127.0.0.1:9").unwrap();
        let user = UserData {
            key_set: None,
            ..configured_user()
        };
        let err = client.register(&user).await.unwrap_err();
        assert!(matches!(err, GraphError::KeySetMissing));
    }

    #[tokio::test]
    async fn register_requires_role() {
        let client = GraphClient::new("http://127.0.0.1:9").unwrap();
        let user = UserData {
            role: None,
            ..configured_user()
        };
        let err = client.register(&user).await.unwrap_err();
        assert!(matches!(err, GraphError::RoleMissing));
    }

    #[tokio::test]
    async fn unregister_requires_token() {
        let client = GraphClient::new("http://127.0.0.1:9").unwrap();
        let user = UserData {
            nickname: Some("alice".into()),
            ..configured_user()
        };
        let err = client.unregister(&user).await.unwrap_err();
        assert!(matches!(err, GraphError::TokenMissing));
    }

    #[tokio::test]
    async fn login_requires_nickname() {
        let client = GraphClient::new("http://127.0.0.1:9").unwrap();
        let err = client.login(&configured_user()).await.unwrap_err();
        assert!(matches!(err, GraphError::UserDataMissing("nickname")));
    }

    #[tokio::test]
    async fn register_posts_public_key_and_ports() {
        let (url, server) =
            one_shot_server("200 OK", r#"{"nickname":"alice","token":"t-1"}"#).await;
        let client = GraphClient::new(&url).unwrap();
        let user = configured_user();

        let registration = client.register(&user).await.unwrap();
        assert_eq!(registration.nickname, "alice");
        assert_eq!(registration.token, "t-1");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /vertices "));
        assert!(request.contains("\"role\":\"NODE\""));
        assert!(request.contains("\"message_port\":1312"));
        let public_key = &user.key_set.as_ref().unwrap().public_key_b64;
        assert!(request.contains(public_key.as_str()));
    }

    #[tokio::test]
    async fn backend_error_carries_status_and_message() {
        let (url, server) =
            one_shot_server("409 Conflict", r#"{"message":"already registered"}"#).await;
        let client = GraphClient::new(&url).unwrap();

        let err = client.register(&configured_user()).await.unwrap_err();
        match err {
            GraphError::Backend { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "already registered");
            }
            other => panic!("expected Backend, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn logoff_sends_bearer_token() {
        let (url, server) = one_shot_server("204 No Content", "").await;
        let client = GraphClient::new(&url).unwrap();
        let user = UserData {
            nickname: Some("alice".into()),
            token: Some("t-1".into()),
            ..configured_user()
        };

        client.logoff(&user).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE /sessions "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer t-1"));
    }
}
