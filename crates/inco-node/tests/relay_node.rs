//! A node with the real receiver, driven through the command loop.

use inco_mesh::receiver::{ReceiveHandler, ReceiverConfig};
use inco_mesh::user_data::UserData;
use inco_node::commands::CommandLoop;
use inco_node::session::PortChoice;
use inco_node::testing::Harness;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn relay_lists_endpoint_and_shutdown_closes_it() {
    let tmp = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.work_dir = tmp.path().to_path_buf();

    let (reader, mut operator) = tokio::io::duplex(256);
    let mut commands = CommandLoop::new(reader, h.session(UserData::default()), h.console.clone());

    let (message_port, file_port) = (free_port(), free_port());
    commands.session_mut().configure(PortChoice {
        message: Some(u32::from(message_port)),
        file: Some(u32::from(file_port)),
    });
    let user = commands.session().user_data().clone();
    let message_addr = SocketAddr::from(([127, 0, 0, 1], message_port));
    let config = ReceiverConfig {
        message_addr,
        file_addr: SocketAddr::from(([127, 0, 0, 1], file_port)),
        relay_path: user.relay_path.clone().unwrap(),
        temp_path: user.temp_path.clone().unwrap(),
    };
    let handler = ReceiveHandler::new(config, h.relay.clone());
    commands.session_mut().start_listener(handler).await.unwrap();
    assert!(tmp.path().join("Relay").is_dir());

    let stream = TcpStream::connect(message_addr).await.unwrap();
    let (r, mut w) = stream.into_split();
    let mut endpoint = BufReader::new(r).lines();
    w.write_all(b"{\"type\":\"hello\",\"nickname\":\"bob\"}\n")
        .await
        .unwrap();
    let welcome = endpoint.next_line().await.unwrap().unwrap();
    assert!(welcome.contains("\"welcome\""));

    let running = tokio::spawn(commands.run());
    operator.write_all(b"/relay\n/shutdown\n").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    let lines = h.lines();
    assert!(lines.contains(&"- bob".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("INFO: Node stopped."));

    // The receiver closed the endpoint's connection on its way out.
    let closed = tokio::time::timeout(Duration::from_secs(5), endpoint.next_line())
        .await
        .unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));
    assert!(h.relay.connected_nicknames().await.is_empty());
}
