//! Process bootstrap: how a host starts a server for the `host` command.

use std::future::Future;

use crate::error::Result;
use crate::server::{ServerConfig, SyncServer};

/// Host-provided capabilities outside the editor surface.
pub trait Platform: Send + Sync + 'static {
    /// Name shown in notifications.
    fn application_name(&self) -> &str;

    /// Start a server listening on `port`. Resolves once it accepts
    /// connections, not when it stops.
    fn spawn_server(&self, port: u16) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the server as a task in the current tokio runtime.
///
/// The server stops by itself once the last user leaves.
#[derive(Debug, Clone)]
pub struct InProcessPlatform {
    name: String,
    palette_size: usize,
}

impl InProcessPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            palette_size: ServerConfig::default().palette_size,
        }
    }

    pub fn with_palette_size(mut self, palette_size: usize) -> Self {
        self.palette_size = palette_size;
        self
    }
}

impl Default for InProcessPlatform {
    fn default() -> Self {
        Self::new("tandem")
    }
}

impl Platform for InProcessPlatform {
    fn application_name(&self) -> &str {
        &self.name
    }

    fn spawn_server(&self, port: u16) -> impl Future<Output = Result<()>> + Send {
        let config = ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            palette_size: self.palette_size,
            exit_when_empty: true,
            ..ServerConfig::default()
        };
        async move {
            let server = SyncServer::bind(config).await?;
            let addr = server.local_addr()?;
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    log::error!("Server on {addr} stopped: {e}");
                }
            });
            log::info!("Hosting on {addr}");
            Ok(())
        }
    }
}
