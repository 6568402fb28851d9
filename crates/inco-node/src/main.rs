use anyhow::{Context, Result};
use clap::Parser;
use inco_mesh::graph::{DEFAULT_GRAPH_URL, GraphClient};
use inco_mesh::receiver::{ReceiveHandler, ReceiverConfig};
use inco_mesh::relay::RelayDirectory;
use inco_mesh::user_data::JsonUserDataStore;
use inco_node::VERSION;
use inco_node::banner::banner;
use inco_node::commands::CommandLoop;
use inco_node::console::Console;
use inco_node::session::{Collaborators, NodeSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser, Debug)]
#[command(author, version, about = "inco relay node")]
struct Args {
    /// State directory for the node's user data (default: ~/.local/state/inco).
    #[arg(long, env = "INCO_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Directory holding the Relay, Endpoint and Temp folders (default: current directory).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Graph backend base URL.
    #[arg(long, env = "INCO_GRAPH_URL", default_value = DEFAULT_GRAPH_URL)]
    graph_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inco_node=info,inco_mesh=info".into()),
        )
        .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(false)
        .init();

    let args = Args::parse();

    let store = JsonUserDataStore::open(args.state_dir.as_deref())
        .context("failed to open user data store")?;
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to determine working directory")?,
    };

    let console = Console::stdout();
    console.print_raw(&banner(VERSION));
    console.print_line("INFO: Starting Initialize...");

    let graph =
        Arc::new(GraphClient::new(&args.graph_url).context("failed to build graph client")?);
    let relay = Arc::new(RelayDirectory::new());
    let collaborators = Collaborators {
        store: Arc::new(store),
        registrar: graph.clone(),
        authenticator: graph,
        relay: relay.clone(),
    };

    let session = NodeSession::load(collaborators, console.clone(), work_dir);
    let mut commands = CommandLoop::new(tokio::io::stdin(), session, console.clone());
    commands.configure_session().await;
    console.print_line("INFO: Initialized config.");

    let nickname = commands.session().nickname().unwrap_or("not registered");
    console.print_line(format!("Nickname: {nickname}"));

    console.print_line("INFO: Initializing receive service...");
    match ReceiverConfig::from_user_data(commands.session().user_data()) {
        Ok(config) => {
            let handler = ReceiveHandler::new(config, relay);
            match commands.session_mut().start_listener(handler).await {
                Ok(()) => console.print_line("INFO: Initialized receive service."),
                Err(e) => tracing::error!(err = ?e, "receive service not started"),
            }
        }
        Err(e) => tracing::error!(err = ?e, "receive service not started"),
    }
    console.print_line("INFO: Done Initializing.");
    console.print_line("/help for available commands");

    commands
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(err = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("inco-node shut down");
    // A blocked stdin read would otherwise keep the runtime alive.
    std::process::exit(0)
}
