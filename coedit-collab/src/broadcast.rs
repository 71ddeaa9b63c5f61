//! Fan-out of server frames to registered connections.
//!
//! Each message is encoded once and the resulting [`Frame`] is shared by
//! every recipient. Delivery is a non-blocking `try_send` into the
//! connection's bounded outbound channel:
//! - connection not `Open`, or its channel closed → skipped silently
//! - channel full → frame dropped for that peer only (backpressure)
//!
//! Neither case is an error for the broadcast itself.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, Frame};

/// Delivery counters for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_skipped: u64,
    pub messages_dropped: u64,
}

/// Sends document updates, conflict notices and rosters to the right
/// audience. Holds no connection state of its own; every call is given the
/// registry to deliver through.
#[derive(Debug, Default)]
pub struct BroadcastDispatcher {
    stats: BroadcastStats,
}

impl BroadcastDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `updateDocument` to every open connection except the author.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast_update(
        &mut self,
        registry: &ConnectionRegistry,
        exclude: ConnectionId,
        content: &str,
    ) -> Result<usize, ProtocolError> {
        let msg = ServerMessage::UpdateDocument {
            content: content.to_owned(),
        };
        self.fan_out(registry, &msg, Some(exclude))
    }

    /// `conflictDetected` to exactly one connection.
    pub fn send_conflict(
        &mut self,
        registry: &ConnectionRegistry,
        to: ConnectionId,
        details: &str,
        authoritative_content: &str,
    ) -> Result<bool, ProtocolError> {
        let msg = ServerMessage::ConflictDetected {
            details: details.to_owned(),
            current_content: authoritative_content.to_owned(),
        };
        self.send_to(registry, to, &msg)
    }

    /// `userListUpdate` with the full membership to every open connection.
    pub fn broadcast_participant_list(
        &mut self,
        registry: &ConnectionRegistry,
    ) -> Result<usize, ProtocolError> {
        let msg = ServerMessage::UserListUpdate {
            users: registry.list_ids(),
        };
        self.fan_out(registry, &msg, None)
    }

    /// Deliver one message to a single connection.
    ///
    /// Unknown ids count as skipped, like closed peers.
    pub fn send_to(
        &mut self,
        registry: &ConnectionRegistry,
        to: ConnectionId,
        msg: &ServerMessage,
    ) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::from(msg.encode()?);
        match registry.get(to) {
            Some(conn) => Ok(self.deliver(conn, &frame)),
            None => {
                log::debug!("Skipping {} for unregistered connection {to}", msg.kind());
                self.stats.messages_skipped += 1;
                Ok(false)
            }
        }
    }

    fn fan_out(
        &mut self,
        registry: &ConnectionRegistry,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(msg.encode()?);
        let mut delivered = 0;
        for conn in registry.iter() {
            if Some(conn.id()) == exclude {
                continue;
            }
            if self.deliver(conn, &frame) {
                delivered += 1;
            }
        }
        log::trace!("Fanned out {} to {delivered} connections", msg.kind());
        Ok(delivered)
    }

    fn deliver(&mut self, conn: &Connection, frame: &Frame) -> bool {
        if !conn.is_open() {
            self.stats.messages_skipped += 1;
            return false;
        }
        match conn.outbound().try_send(frame.clone()) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for {}, dropping frame", conn.id());
                self.stats.messages_dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.messages_skipped += 1;
                false
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn decode(frame: &Frame) -> ServerMessage {
        ServerMessage::decode(frame).unwrap()
    }

    fn registry_with(n: usize) -> (ConnectionRegistry, Vec<(ConnectionId, mpsc::Receiver<Frame>)>) {
        let mut registry = ConnectionRegistry::new();
        let peers = (0..n)
            .map(|_| {
                let (tx, rx) = mpsc::channel(16);
                (registry.register(tx), rx)
            })
            .collect();
        (registry, peers)
    }

    #[test]
    fn test_update_skips_author() {
        let (registry, mut peers) = registry_with(3);
        let author = peers[0].0;
        let mut dispatcher = BroadcastDispatcher::new();

        let count = dispatcher.broadcast_update(&registry, author, "hello").unwrap();
        assert_eq!(count, 2);

        assert!(peers[0].1.try_recv().is_err());
        for (_, rx) in peers.iter_mut().skip(1) {
            assert_eq!(
                decode(&rx.try_recv().unwrap()),
                ServerMessage::UpdateDocument {
                    content: "hello".to_string()
                }
            );
        }
    }

    #[test]
    fn test_conflict_reaches_only_target() {
        let (registry, mut peers) = registry_with(3);
        let stale = peers[1].0;
        let mut dispatcher = BroadcastDispatcher::new();

        assert!(dispatcher.send_conflict(&registry, stale, "stale", "hello").unwrap());

        assert!(peers[0].1.try_recv().is_err());
        assert!(peers[2].1.try_recv().is_err());
        match decode(&peers[1].1.try_recv().unwrap()) {
            ServerMessage::ConflictDetected { details, current_content } => {
                assert_eq!(details, "stale");
                assert_eq!(current_content, "hello");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_participant_list_matches_registry() {
        let (registry, mut peers) = registry_with(3);
        let mut dispatcher = BroadcastDispatcher::new();

        assert_eq!(dispatcher.broadcast_participant_list(&registry).unwrap(), 3);

        let expected = registry.list_ids();
        for (_, rx) in peers.iter_mut() {
            assert_eq!(
                decode(&rx.try_recv().unwrap()),
                ServerMessage::UserListUpdate {
                    users: expected.clone()
                }
            );
        }
    }

    #[test]
    fn test_closed_and_closing_peers_are_skipped() {
        let (mut registry, mut peers) = registry_with(3);
        let closing = peers[0].0;
        registry.mark_closing(closing);
        let (_, gone) = peers.remove(1);
        drop(gone);

        let mut dispatcher = BroadcastDispatcher::new();
        let count = dispatcher.broadcast_participant_list(&registry).unwrap();

        assert_eq!(count, 1);
        let stats = dispatcher.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_skipped, 2);
        assert!(peers[0].1.try_recv().is_err());
        assert!(peers[1].1.try_recv().is_ok());
    }

    #[test]
    fn test_full_outbound_drops_for_that_peer_only() {
        let mut registry = ConnectionRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        let slow = registry.register(slow_tx);
        registry.register(fast_tx);

        let mut dispatcher = BroadcastDispatcher::new();
        let author = ConnectionId::generate();
        dispatcher.broadcast_update(&registry, author, "one").unwrap();
        dispatcher.broadcast_update(&registry, author, "two").unwrap();

        assert_eq!(dispatcher.stats().messages_dropped, 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
        assert!(registry.contains(slow));
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let (registry, _peers) = registry_with(1);
        let mut dispatcher = BroadcastDispatcher::new();
        let sent = dispatcher
            .send_conflict(&registry, ConnectionId::generate(), "x", "y")
            .unwrap();
        assert!(!sent);
        assert_eq!(dispatcher.stats().messages_skipped, 1);
    }

    #[test]
    fn test_frame_is_shared_between_recipients() {
        let (registry, mut peers) = registry_with(2);
        let mut dispatcher = BroadcastDispatcher::new();
        dispatcher.broadcast_participant_list(&registry).unwrap();

        let a = peers[0].1.try_recv().unwrap();
        let b = peers[1].1.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
