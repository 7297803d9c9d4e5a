//! Peer session lifecycle. Handles a single connected client from upgrade
//! through disconnect.
//!
//! Inbound frames are read only to notice when the client goes away; their
//! content is never forwarded anywhere.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::sink::WsPeerSink;
use crate::registry::{ConnectionRegistry, PeerId, PeerSink};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The client sent a Close frame.
    CloseFrame,
    /// The inbound stream ended without a Close frame.
    StreamEnded,
    /// Reading failed (network error, protocol violation).
    ReadError(String),
    /// The server is shutting down.
    Shutdown,
    /// The id was already registered to another session; nothing was held.
    DuplicateId,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloseFrame => f.write_str("close frame"),
            Self::StreamEnded => f.write_str("stream ended"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::Shutdown => f.write_str("server shutdown"),
            Self::DuplicateId => f.write_str("duplicate peer id"),
        }
    }
}

/// Keeps a peer registered for as long as it is alive.
///
/// `release` deregisters and closes the peer. If the session task is
/// dropped first (aborted or cancelled), `Drop` schedules the same cleanup
/// on the current runtime.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: PeerId,
    released: bool,
}

impl Registration {
    async fn register(
        registry: Arc<ConnectionRegistry>,
        id: PeerId,
        sink: Box<dyn PeerSink>,
    ) -> Option<Self> {
        if !registry.add(id, sink).await {
            return None;
        }
        Some(Self {
            registry,
            id,
            released: false,
        })
    }

    async fn release(mut self) {
        deregister(&self.registry, self.id).await;
        self.released = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let _ = handle.spawn(async move { deregister(&registry, id).await });
        }
    }
}

async fn deregister(registry: &ConnectionRegistry, id: PeerId) {
    if let Some(mut sink) = registry.remove(&id).await {
        sink.close().await;
    }
}

/// Run a session for a freshly upgraded socket.
pub async fn run_peer_session(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    let (ws_tx, ws_rx) = socket.split();
    let _ = hold_peer(
        PeerId::new(),
        Box::new(WsPeerSink::new(ws_tx)),
        ws_rx,
        registry,
        shutdown,
    )
    .await;
}

/// Register `sink` under `peer_id`, wait for the inbound side to fail or
/// close, then deregister and close.
#[instrument(skip_all, fields(peer_id = %peer_id))]
pub async fn hold_peer<R, E>(
    peer_id: PeerId,
    sink: Box<dyn PeerSink>,
    mut inbound: R,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) -> Disconnect
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let Some(registration) = Registration::register(registry, peer_id, sink).await else {
        warn!("peer id already registered, dropping connection");
        return Disconnect::DuplicateId;
    };
    info!("client connected");

    let reason = tokio::select! {
        () = shutdown.cancelled() => Disconnect::Shutdown,
        reason = wait_for_disconnect(&mut inbound) => reason,
    };

    registration.release().await;
    info!(%reason, "client disconnected");
    reason
}

/// Drain inbound frames until the first Close frame, read error, or end of
/// stream.
pub async fn wait_for_disconnect<R, E>(inbound: &mut R) -> Disconnect
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Close(_)) => return Disconnect::CloseFrame,
            Ok(_) => debug!("ignoring inbound frame"),
            Err(e) => return Disconnect::ReadError(e.to_string()),
        }
    }
    Disconnect::StreamEnded
}
