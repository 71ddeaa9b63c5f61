//! # coedit-collab: Real-time shared-document sync
//!
//! Many clients edit one shared text document over WebSocket. Every edit
//! carries the whole document plus a client timestamp; the server keeps the
//! newest accepted state and rejects edits stamped before it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ClientLink  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ one session task
//!        ▼                                   ▼ per connection
//! ┌─────────────┐                     ┌─────────────┐
//! │EditorSurface│                     │ DocumentHub │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴──────────┐
//!                                  │ BroadcastDispatcher│
//!                                  │ (fan-out)          │
//!                                  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`registry`]: live connections in registration order
//! - [`document`]: the shared document and its last-accepted timestamp
//! - [`conflict`]: last-writer-wins staleness check
//! - [`broadcast`]: fan-out with per-connection backpressure
//! - [`hub`]: actor owning document, registry and dispatcher
//! - [`session`]: per-connection read/write loop
//! - [`server`]: WebSocket accept loop
//! - [`surface`]: editor surface and identity seams for the client
//! - [`client`]: client link with outbound queue and reconnection

pub mod broadcast;
pub mod client;
pub mod conflict;
pub mod document;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod surface;

// Re-exports for convenience
pub use broadcast::{BroadcastDispatcher, BroadcastStats};
pub use client::{
    ClientLink, LinkConfig, LinkEvent, LinkState, Notice, NoticeLevel, OutboundQueue,
    ReconnectPolicy, SendOutcome,
};
pub use conflict::Verdict;
pub use document::{DocumentSnapshot, SharedDocument};
pub use error::{LinkError, ServerError};
pub use hub::{DocumentHub, HubHandle, HubStats};
pub use protocol::{ClientMessage, Edit, ProtocolError, ServerMessage, Timestamp};
pub use registry::{ConnectionId, ConnectionRegistry, ConnectionState};
pub use server::{ServerConfig, SyncServer};
pub use surface::{AnonymousIdentity, EditorSurface, IdentityProvider, SharedBuffer};
