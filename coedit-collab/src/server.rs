//! WebSocket sync server for the shared document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── session A ──┐
//! Client B ──┼── TcpListener ──┼── session B ──┼── DocumentHub
//! Client C ──┘                 └── session C ──┘   (document, registry,
//!                                                   broadcast dispatcher)
//! ```
//!
//! The accept loop spawns one session task per connection. The hub task
//! is spawned when the server starts serving and lives as long as any
//! session or [`HubHandle`] does.

use chrono::Utc;
use tokio::net::TcpListener;

use crate::document::{SharedDocument, INITIAL_CONTENT};
use crate::error::ServerError;
use crate::hub::{DocumentHub, HubHandle};
use crate::session::run_session;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before fan-out starts dropping
    pub outbound_capacity: usize,
    /// Commands buffered in the hub mailbox
    pub mailbox_capacity: usize,
    /// Document content at startup
    pub initial_content: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            outbound_capacity: 256,
            mailbox_capacity: 1024,
            initial_content: INITIAL_CONTENT.to_string(),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: DocumentHub,
    handle: HubHandle,
}

impl SyncServer {
    /// Create a new sync server. The document is stamped with the
    /// current time.
    pub fn new(config: ServerConfig) -> Self {
        let document = SharedDocument::new(config.initial_content.clone(), Utc::now());
        let (hub, handle) = DocumentHub::new(document, config.mailbox_capacity);
        Self { config, hub, handle }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Handle for inspecting the document, roster and statistics.
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// Per-connection failures are logged and never stop the loop.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let Self {
            config,
            hub,
            handle,
        } = self;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        tokio::spawn(hub.run());

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = handle.clone();
            let outbound_capacity = config.outbound_capacity;
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, addr, hub, outbound_capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}
