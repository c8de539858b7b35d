//! The command surface a host exposes: `host`, `connect`, `disconnect`,
//! `quit`.

use std::sync::Arc;

use crate::client::SyncClient;
use crate::config::HostConfig;
use crate::error::{Result, SyncError};
use crate::platform::Platform;
use crate::transport::Connector;
use crate::view::{EditorView, Severity};

const USAGE: &str = "usage: host [port] [name] | connect <address> [port] [name] | disconnect | quit";

/// A parsed command. Missing arguments are filled in from [`HostConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Host {
        port: Option<u16>,
        name: Option<String>,
    },
    Connect {
        address: Option<String>,
        port: Option<u16>,
        name: Option<String>,
    },
    Disconnect,
    Quit,
}

fn parse_port(raw: &str) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(SyncError::InvalidArguments(format!("invalid port `{raw}`"))),
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let parsed = match (command, args.as_slice()) {
            ("host", [rest @ ..]) if rest.len() <= 2 => Command::Host {
                port: rest.first().map(|p| parse_port(p)).transpose()?,
                name: rest.get(1).map(|n| n.to_string()),
            },
            ("connect", [rest @ ..]) if rest.len() <= 3 => Command::Connect {
                address: rest.first().map(|a| a.to_string()),
                port: rest.get(1).map(|p| parse_port(p)).transpose()?,
                name: rest.get(2).map(|n| n.to_string()),
            },
            ("disconnect", []) => Command::Disconnect,
            ("quit", []) => Command::Quit,
            _ => return Err(SyncError::InvalidArguments(USAGE.to_string())),
        };
        Ok(parsed)
    }
}

/// Whether the host should keep reading commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Composition point: owns the client and runs commands against it.
pub struct Controller<V, C, P> {
    client: SyncClient<V, C>,
    platform: P,
    config: HostConfig,
}

impl<V, C, P> Controller<V, C, P>
where
    V: EditorView,
    C: Connector,
    P: Platform,
{
    pub fn new(view: Arc<V>, connector: C, platform: P, config: HostConfig) -> Self {
        let client = SyncClient::new(view, connector, config.client_config());
        Self {
            client,
            platform,
            config,
        }
    }

    pub fn client(&self) -> &SyncClient<V, C> {
        &self.client
    }

    /// Parse and run one line. Blank lines are ignored.
    pub async fn execute_line(&mut self, line: &str) -> Flow {
        if line.trim().is_empty() {
            return Flow::Continue;
        }
        match Command::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                self.client.view().notify(&e.to_string(), Severity::Error);
                Flow::Continue
            }
        }
    }

    /// Run a command. Failures are shown on the view, never returned.
    pub async fn execute(&mut self, command: Command) -> Flow {
        match self.run(command).await {
            Ok(flow) => flow,
            Err(e) => {
                log::debug!("Command failed: {e}");
                self.client.view().notify(&e.to_string(), Severity::Error);
                Flow::Continue
            }
        }
    }

    async fn run(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Host { port, name } => {
                if self.client.is_connected().await {
                    return Err(SyncError::AlreadyConnected);
                }
                let port = port.or(self.config.default_port).filter(|p| *p != 0);
                let name = name.or_else(|| self.config.default_name.clone());
                let (Some(port), Some(name)) = (port, name) else {
                    return Err(SyncError::InvalidArguments(
                        "usage: host <port> <name>".to_string(),
                    ));
                };

                self.platform.spawn_server(port).await?;
                self.client.view().notify(
                    &format!("{} is hosting on port {port}", self.platform.application_name()),
                    Severity::Info,
                );
                self.client
                    .connect(Some("localhost"), Some(port), Some(&name))
                    .await?;
            }
            Command::Connect {
                address,
                port,
                name,
            } => {
                let address = address.or_else(|| self.config.default_address.clone());
                let port = port.or(self.config.default_port);
                let name = name.or_else(|| self.config.default_name.clone());
                self.client
                    .connect(address.as_deref(), port, name.as_deref())
                    .await?;
            }
            Command::Disconnect => self.client.disconnect().await?,
            Command::Quit => {
                if self.client.is_connected().await {
                    if let Err(e) = self.client.disconnect().await {
                        log::warn!("Disconnect on quit failed: {e}");
                    }
                }
                self.client.view().quit();
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }
}
