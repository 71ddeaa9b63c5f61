//! Per-connection session loop.
//!
//! A failed handshake never registers the connection. While open, the loop
//! multiplexes two sources:
//! - inbound WebSocket frames, parsed and forwarded to the hub
//! - outbound frames the hub queued for this connection

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ServerError;
use crate::hub::{DiscardReason, HubHandle};
use crate::protocol::{ClientMessage, ProtocolError};
use crate::registry::{ConnectionId, Frame};

/// Serve one accepted TCP stream until either side closes it.
///
/// A zero `outbound_capacity` is treated as 1.
pub async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    outbound_capacity: usize,
) -> Result<(), ServerError> {
    log::debug!("{addr}: WebSocket handshake");
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("{addr}: handshake failed: {e}");
            return Err(e.into());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(outbound_capacity.max(1));
    let id = hub.connect(out_tx).await?;
    log::info!("Connection {id} open from {addr}");

    let outcome = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch(&hub, id, text.as_str()).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::warn!("Connection {id}: ignoring {}-byte binary frame", data.len());
                        if let Err(e) = hub.discard(id, DiscardReason::Malformed).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {id} closed by peer");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error on {id}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                            log::warn!("Send to {id} failed: {e}");
                            break Ok(());
                        }
                    }
                    // Hub dropped our outbound channel: it is shutting down.
                    None => break Err(ServerError::HubUnavailable),
                }
            }
        }
    };

    let _ = ws_sender.close().await;
    hub.disconnect(id).await?;
    log::debug!("Connection {id} torn down");
    outcome
}

/// Parse one text frame and hand it to the hub.
async fn dispatch(hub: &HubHandle, id: ConnectionId, raw: &str) -> Result<(), ServerError> {
    match ClientMessage::decode(raw) {
        Ok(ClientMessage::Edit(edit)) => hub.submit_edit(id, edit).await,
        Err(ProtocolError::UnknownType(kind)) => {
            log::warn!("Unknown message type {kind:?} from {id}");
            hub.discard(id, DiscardReason::UnknownType).await
        }
        Err(e) => {
            log::warn!("Dropping malformed message from {id}: {e}");
            hub.discard(id, DiscardReason::Malformed).await
        }
    }
}
