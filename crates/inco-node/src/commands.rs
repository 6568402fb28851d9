use crate::VERSION;
use crate::banner::banner;
use crate::console::Console;
use crate::session::{NodeSession, PortChoice, STANDARD_FILE_PORT, STANDARD_MESSAGE_PORT};
use futures_util::StreamExt;
use std::future::Future;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest operator input line accepted.
const MAX_INPUT_BYTES: usize = 1024;

const INVALID_COMMAND: &str = "!Invalid Command! /help for available commands";

/// Commands `/help <topic>` can explain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Unregister,
    Register,
    Login,
    Logout,
    Nickname,
    MessagePort,
    FilePort,
    Relay,
    Shutdown,
    Version,
}

impl Topic {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "unregister" => Self::Unregister,
            "register" => Self::Register,
            "login" => Self::Login,
            "logout" => Self::Logout,
            "nickname" => Self::Nickname,
            "messageport" => Self::MessagePort,
            "fileport" => Self::FilePort,
            "relay" => Self::Relay,
            "shutdown" => Self::Shutdown,
            "version" => Self::Version,
            _ => return None,
        })
    }

    pub fn explanation(self) -> &'static [&'static str] {
        match self {
            Self::Unregister => &[
                "Unregister: Removes this node from the graph and with it from the network.",
            ],
            Self::Register => &[
                "Register: Adds this node to the graph and with it to the network.",
                "The first start of the node asks for the ports it should use.",
            ],
            Self::Login => &[
                "Login: Marks this node online at the graph.",
                "A freshly registered node is online already.",
            ],
            Self::Logout => &["Logout: Marks this node offline at the graph."],
            Self::Nickname => &["Shows the nickname the graph gave this node."],
            Self::MessagePort => &["Shows the port this node receives messages on."],
            Self::FilePort => &["Shows the port this node receives files on."],
            Self::Relay => &["Shows the endpoints currently using this node as their relay."],
            Self::Shutdown => &[
                "Logs out, stops the receiver and exits. Open transfers are waited for.",
            ],
            Self::Version => &["Shows the version of the node software."],
        }
    }
}

/// One line of operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    HelpTopic(Topic),
    Unregister,
    Register,
    Login,
    Logout,
    Nickname,
    MessagePort,
    FilePort,
    Relay,
    Shutdown,
    Inco,
    Version,
    Invalid,
}

impl Command {
    /// Case-insensitive exact match; surrounding whitespace is significant.
    pub fn parse(input: &str) -> Self {
        let input = input.to_lowercase();
        match input.as_str() {
            "/help" => Self::Help,
            "/unregister" => Self::Unregister,
            "/register" => Self::Register,
            "/login" => Self::Login,
            "/logout" => Self::Logout,
            "/nickname" => Self::Nickname,
            "/messageport" => Self::MessagePort,
            "/fileport" => Self::FilePort,
            "/relay" => Self::Relay,
            "/shutdown" => Self::Shutdown,
            "/inco" => Self::Inco,
            "/version" => Self::Version,
            other => other
                .strip_prefix("/help ")
                .and_then(Topic::parse)
                .map_or(Self::Invalid, Self::HelpTopic),
        }
    }
}

/// Answer to a port prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortInput {
    Standard,
    Port(u32),
    Invalid,
}

/// Empty input selects the standard port; otherwise exactly 4 or 5 digits.
pub fn parse_port_input(input: &str) -> PortInput {
    if input.is_empty() {
        return PortInput::Standard;
    }
    if !(4..=5).contains(&input.len()) || !input.bytes().all(|b| b.is_ascii_digit()) {
        return PortInput::Invalid;
    }
    input.parse().map_or(PortInput::Invalid, PortInput::Port)
}

enum Input {
    Line(String),
    TooLong,
    Closed,
}

async fn next_input<R: AsyncRead + Unpin>(input: &mut FramedRead<R, LinesCodec>) -> Input {
    match input.next().await {
        Some(Ok(line)) => Input::Line(line),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Input::TooLong,
        Some(Err(LinesCodecError::Io(e))) => {
            tracing::warn!(err = %e, "failed to read input");
            Input::Closed
        }
        None => Input::Closed,
    }
}

/// Reads operator commands line by line and drives the session.
pub struct CommandLoop<R> {
    input: FramedRead<R, LinesCodec>,
    session: NodeSession,
    console: Console,
}

impl<R: AsyncRead + Unpin> CommandLoop<R> {
    pub fn new(reader: R, session: NodeSession, console: Console) -> Self {
        Self {
            input: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_INPUT_BYTES)),
            session,
            console,
        }
    }

    pub fn session(&self) -> &NodeSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut NodeSession {
        &mut self.session
    }

    /// Prompt until the operator enters a valid port or accepts the standard
    /// one. End of input also selects the standard port.
    pub async fn ask_port(&mut self, standard_port: u32, usage: &str) -> u32 {
        loop {
            self.console.print_line(format!(
                "Which port should be used to receive {usage}? \
                 (Press enter without a value if you want to use the standard port: {standard_port}): "
            ));
            let answer = match next_input(&mut self.input).await {
                Input::Line(line) => parse_port_input(&line),
                Input::TooLong => PortInput::Invalid,
                Input::Closed => PortInput::Standard,
            };
            match answer {
                PortInput::Standard => return standard_port,
                PortInput::Port(port) => return port,
                PortInput::Invalid => self.console.print_line("Input not valid, try again"),
            }
        }
    }

    /// Configure the session, prompting for ports only when it needs them.
    pub async fn configure_session(&mut self) {
        let mut ports = PortChoice::default();
        if self.session.needs_ports() {
            ports.message = Some(self.ask_port(STANDARD_MESSAGE_PORT, "messages").await);
            ports.file = Some(self.ask_port(STANDARD_FILE_PORT, "files").await);
        }
        self.session.configure(ports);
    }

    /// Process commands until `/shutdown` or end of input, then shut down.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await;
    }

    /// Like [`CommandLoop::run`], but `interrupt` completing also shuts down.
    pub async fn run_until(mut self, interrupt: impl Future<Output = ()>) {
        tokio::pin!(interrupt);
        loop {
            self.console.print_line("Ready for input...");
            let input = tokio::select! {
                input = next_input(&mut self.input) => input,
                () = &mut interrupt => {
                    self.console.print_line("INFO: Interrupted.");
                    break;
                }
            };
            let command = match input {
                Input::Line(line) => Command::parse(&line),
                Input::TooLong => Command::Invalid,
                Input::Closed => {
                    self.console.print_line("INFO: Input closed.");
                    break;
                }
            };
            if command == Command::Shutdown {
                break;
            }
            self.dispatch(command).await;
        }
        self.session.shutdown().await;
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Help => self.print_help(),
            Command::HelpTopic(topic) => {
                for line in topic.explanation() {
                    self.console.print_line(line);
                }
            }
            Command::Unregister => self.session.unregister().await,
            Command::Register => {
                self.configure_session().await;
                self.session.register().await;
            }
            Command::Login => self.session.login().await,
            Command::Logout => self.session.logout().await,
            Command::Nickname => {
                let nickname = self.session.nickname().unwrap_or("not registered");
                self.console.print_line(format!("Nickname: {nickname}"));
            }
            Command::MessagePort => {
                let port = display_port(self.session.message_port());
                self.console.print_line(format!("Message port: {port}"));
            }
            Command::FilePort => {
                let port = display_port(self.session.file_port());
                self.console.print_line(format!("File port: {port}"));
            }
            Command::Relay => {
                let nicknames = self.session.connected_nicknames().await;
                if nicknames.is_empty() {
                    self.console.print_line("No connected endpoints.");
                }
                for nickname in nicknames {
                    self.console.print_line(format!("- {nickname}"));
                }
            }
            Command::Inco => self.console.print_raw(&banner(VERSION)),
            Command::Version => self.console.print_line(format!("Node version: {VERSION}")),
            // Handled by the loop.
            Command::Shutdown => {}
            Command::Invalid => self.console.print_line(INVALID_COMMAND),
        }
    }

    fn print_help(&self) {
        self.console.print_line("Available Commands:");
        for command in [
            "/unregister",
            "/register",
            "/logout",
            "/login",
            "/messageport",
            "/fileport",
            "/nickname",
            "/relay",
            "/shutdown",
            "/version",
            "/inco",
            "/help",
            "/help <command>",
        ] {
            self.console.print_line(format!("- {command}"));
        }
    }
}

fn display_port(port: Option<u32>) -> String {
    port.map_or_else(|| "not set".to_string(), |p| p.to_string())
}
