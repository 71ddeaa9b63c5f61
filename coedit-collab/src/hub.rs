//! The document hub: single owner of all shared server state.
//!
//! ```text
//!  session A ──┐                       ┌─► outbound A ─► socket A
//!  session B ──┼── HubCommand mailbox ─┤
//!  session C ──┘   (one at a time)     ├─► outbound B ─► socket B
//!                        │             └─► outbound C ─► socket C
//!                        ▼
//!        SharedDocument + ConnectionRegistry + BroadcastDispatcher
//! ```
//!
//! Sessions never touch the document or the registry directly. Every
//! mutation is a command processed to completion before the next one is
//! read, so edits are applied in mailbox arrival order and no locks are
//! needed around the document.

use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{BroadcastDispatcher, BroadcastStats};
use crate::conflict::{self, Verdict, CONFLICT_DETAILS};
use crate::document::{DocumentSnapshot, SharedDocument};
use crate::error::ServerError;
use crate::protocol::Edit;
use crate::registry::{ConnectionId, ConnectionRegistry, Frame};

/// Why a session discarded an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not valid JSON, missing `type`, or bad fields
    Malformed,
    /// Valid frame of a type the server does not handle
    UnknownType,
}

/// Commands accepted by the hub mailbox.
#[derive(Debug)]
pub enum HubCommand {
    /// A WebSocket handshake completed.
    Connect {
        outbound: mpsc::Sender<Frame>,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// An edit arrived on an open connection.
    Edit { from: ConnectionId, edit: Edit },
    /// A frame was dropped by the session.
    Discard {
        from: ConnectionId,
        reason: DiscardReason,
    },
    /// The transport closed.
    Disconnect { id: ConnectionId },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    Roster {
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Stats { reply: oneshot::Sender<HubStats> },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub edits_accepted: u64,
    pub edits_rejected: u64,
    pub malformed_messages: u64,
    pub unknown_messages: u64,
    pub broadcast: BroadcastStats,
}

/// Owns the document, the registry and the dispatcher.
///
/// The synchronous methods are the hub's operations; [`DocumentHub::run`]
/// drives them from the mailbox.
pub struct DocumentHub {
    document: SharedDocument,
    registry: ConnectionRegistry,
    dispatcher: BroadcastDispatcher,
    stats: HubStats,
    mailbox: mpsc::Receiver<HubCommand>,
}

impl DocumentHub {
    /// Create a hub and the handle used to reach it.
    ///
    /// A zero `mailbox_capacity` is treated as 1.
    pub fn new(document: SharedDocument, mailbox_capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let hub = Self {
            document,
            registry: ConnectionRegistry::new(),
            dispatcher: BroadcastDispatcher::new(),
            stats: HubStats::default(),
            mailbox: rx,
        };
        (hub, HubHandle { tx })
    }

    /// Process commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.mailbox.recv().await {
            self.handle(cmd);
        }
        log::info!("Document hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect { outbound, reply } => {
                let id = self.connect(outbound);
                if reply.send(id).is_err() {
                    // Session vanished before learning its id.
                    self.disconnect(id);
                }
            }
            HubCommand::Edit { from, edit } => {
                self.submit_edit(from, edit);
            }
            HubCommand::Discard { from, reason } => self.discard(from, reason),
            HubCommand::Disconnect { id } => self.disconnect(id),
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HubCommand::Roster { reply } => {
                let _ = reply.send(self.roster());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Register a connection, send it the current document, then announce
    /// the new roster to everyone.
    pub fn connect(&mut self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        let id = self.registry.register(outbound);
        self.stats.total_connections += 1;
        self.stats.active_connections = self.registry.len() as u64;

        let initial = self.document.current().initial_state();
        if let Err(e) = self.dispatcher.send_to(&self.registry, id, &initial) {
            log::error!("Failed to send initial state to {id}: {e}");
        }
        self.announce_roster();

        log::info!("Connection {id} registered ({} live)", self.registry.len());
        id
    }

    /// Run conflict detection for an edit and relay the outcome.
    pub fn submit_edit(&mut self, from: ConnectionId, edit: Edit) -> Verdict {
        log::debug!(
            "Edit from {from} (user {}) stamped {}",
            edit.user_id,
            edit.timestamp
        );
        let verdict = conflict::apply(edit, &mut self.document);
        match &verdict {
            Verdict::Accept => {
                self.stats.edits_accepted += 1;
                let result = self.dispatcher.broadcast_update(
                    &self.registry,
                    from,
                    self.document.content(),
                );
                if let Err(e) = result {
                    log::error!("Failed to broadcast update from {from}: {e}");
                }
            }
            Verdict::Reject { current_content } => {
                self.stats.edits_rejected += 1;
                log::info!("Rejected stale edit from {from}");
                let result = self.dispatcher.send_conflict(
                    &self.registry,
                    from,
                    CONFLICT_DETAILS,
                    current_content,
                );
                if let Err(e) = result {
                    log::error!("Failed to send conflict notice to {from}: {e}");
                }
            }
        }
        verdict
    }

    pub fn discard(&mut self, from: ConnectionId, reason: DiscardReason) {
        log::trace!("Discarded frame from {from}: {reason:?}");
        match reason {
            DiscardReason::Malformed => self.stats.malformed_messages += 1,
            DiscardReason::UnknownType => self.stats.unknown_messages += 1,
        }
    }

    /// Tear down a connection and announce the shrunken roster.
    /// Repeated calls for the same id are no-ops.
    pub fn disconnect(&mut self, id: ConnectionId) {
        if !self.registry.mark_closing(id) {
            return;
        }
        self.registry.unregister(id);
        self.stats.active_connections = self.registry.len() as u64;
        self.announce_roster();
        log::info!("Connection {id} unregistered ({} live)", self.registry.len());
    }

    fn announce_roster(&mut self) {
        if let Err(e) = self.dispatcher.broadcast_participant_list(&self.registry) {
            log::error!("Failed to broadcast participant list: {e}");
        }
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.document.current()
    }

    pub fn roster(&self) -> Vec<ConnectionId> {
        self.registry.list_ids()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            broadcast: self.dispatcher.stats(),
            ..self.stats.clone()
        }
    }
}

/// Cloneable handle to a running [`DocumentHub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), ServerError> {
        self.tx.send(cmd).await.map_err(|_| ServerError::HubUnavailable)
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(cmd(reply)).await?;
        rx.await.map_err(|_| ServerError::HubUnavailable)
    }

    /// Register a connection whose frames should go to `outbound`.
    pub async fn connect(&self, outbound: mpsc::Sender<Frame>) -> Result<ConnectionId, ServerError> {
        self.request(|reply| HubCommand::Connect { outbound, reply }).await
    }

    pub async fn submit_edit(&self, from: ConnectionId, edit: Edit) -> Result<(), ServerError> {
        self.send(HubCommand::Edit { from, edit }).await
    }

    pub async fn discard(&self, from: ConnectionId, reason: DiscardReason) -> Result<(), ServerError> {
        self.send(HubCommand::Discard { from, reason }).await
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.send(HubCommand::Disconnect { id }).await
    }

    /// Current document content and timestamp.
    pub async fn snapshot(&self) -> Result<DocumentSnapshot, ServerError> {
        self.request(|reply| HubCommand::Snapshot { reply }).await
    }

    /// Live membership in registration order.
    pub async fn roster(&self) -> Result<Vec<ConnectionId>, ServerError> {
        self.request(|reply| HubCommand::Roster { reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, ServerError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }
}
