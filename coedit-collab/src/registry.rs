//! Live connection registry.
//!
//! The registry is the only place that holds a connection's outbound
//! channel. Everything else addresses connections by [`ConnectionId`] and
//! goes through the registry to reach them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A pre-encoded text frame, shared between all recipients of a fan-out.
pub type Frame = Arc<str>;

/// Opaque participant identifier assigned when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Random 128-bit token; unique for any practical process lifetime.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, WebSocket handshake in progress
    Connecting,
    /// Registered and receiving traffic
    Open,
    /// Close observed, teardown in progress
    Closing,
    /// Removed from the registry
    Closed,
}

/// A registered connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    state: ConnectionState,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether frames can currently be delivered to this connection.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && !self.outbound.is_closed()
    }

    pub fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound
    }
}

/// Ordered set of live connections.
///
/// Membership is kept in registration order so rosters are stable.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the `Open` state and return its fresh id.
    pub fn register(&mut self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.push(Connection {
            id,
            outbound,
            state: ConnectionState::Open,
        });
        id
    }

    /// Move a connection to `Closing` so fan-out skips it.
    ///
    /// Returns `false` if the id is not registered.
    pub fn mark_closing(&mut self, id: ConnectionId) -> bool {
        match self.connections.iter_mut().find(|c| c.id == id) {
            Some(conn) => {
                conn.state = ConnectionState::Closing;
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Absent ids are ignored.
    ///
    /// Returns whether anything was removed.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != id);
        self.connections.len() != before
    }

    /// Membership snapshot in registration order.
    pub fn list_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.id).collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
