//! Connection registry: the set of live peers and the broadcast fan-out.
//!
//! Every access, whether a mutation or a broadcast, runs under one
//! `tokio::sync::Mutex`. A broadcast holds the lock across all of its
//! writes, so no peer is added or removed mid-broadcast and a failing peer
//! is evicted before the next one is written to.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::PeerError;
use crate::payload::Payload;

/// Identity of one peer connection.
///
/// Two upgrades from the same client get two distinct ids; the registry never
/// deduplicates by client address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer_{}", self.0)
    }
}

/// Outbound half of a peer connection.
#[async_trait]
pub trait PeerSink: Send {
    /// Write `payload` as a single text frame.
    async fn send_text(&mut self, payload: &Payload) -> Result<(), PeerError>;

    /// Close the connection. Errors are swallowed; the peer is gone either way.
    async fn close(&mut self);
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that accepted the write.
    pub delivered: usize,
    /// Peers removed because their write failed.
    pub evicted: Vec<PeerId>,
}

/// Lock-serialized set of live peer connections.
pub struct ConnectionRegistry {
    peers: Mutex<HashMap<PeerId, Box<dyn PeerSink>>>,
    /// Mirrors `peers.len()`; only written while `peers` is locked.
    members: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            members: AtomicUsize::new(0),
        }
    }

    /// Register a peer.
    ///
    /// Returns `false` and leaves the existing entry untouched if `id` is
    /// already registered.
    pub async fn add(&self, id: PeerId, sink: Box<dyn PeerSink>) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&id) {
            debug!(peer_id = %id, "peer already registered");
            return false;
        }
        let _ = peers.insert(id, sink);
        self.members.store(peers.len(), Ordering::Release);
        debug!(peer_id = %id, members = peers.len(), "peer registered");
        true
    }

    /// Deregister a peer and hand its outbound half back to the caller.
    ///
    /// Does not close the connection. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &PeerId) -> Option<Box<dyn PeerSink>> {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(id);
        self.members.store(peers.len(), Ordering::Release);
        if removed.is_some() {
            debug!(peer_id = %id, members = peers.len(), "peer deregistered");
        }
        removed
    }

    /// Write `payload` to every registered peer.
    ///
    /// A peer whose write fails is removed and closed before the next peer is
    /// attempted. Failures never propagate past the failing peer.
    pub async fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let mut peers = self.peers.lock().await;
        let mut report = BroadcastReport::default();
        if peers.is_empty() {
            return report;
        }

        let recipients: Vec<PeerId> = peers.keys().copied().collect();
        for id in &recipients {
            let Some(sink) = peers.get_mut(id) else {
                continue;
            };
            match sink.send_text(payload).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer_id = %id, error = %e, "write failed, evicting peer");
                    let removed = peers.remove(id);
                    self.members.store(peers.len(), Ordering::Release);
                    if let Some(mut sink) = removed {
                        sink.close().await;
                    }
                    report.evicted.push(*id);
                }
            }
        }

        debug!(
            recipients = recipients.len(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            len = payload.len(),
            "broadcast payload"
        );
        report
    }

    /// Remove and close every peer.
    pub async fn close_all(&self) -> usize {
        let mut peers = self.peers.lock().await;
        let count = peers.len();
        self.members.store(0, Ordering::Release);
        for (_, mut sink) in peers.drain() {
            sink.close().await;
        }
        count
    }

    /// Member count without taking the lock.
    ///
    /// Never waits on an in-flight broadcast, so it may lag a mutation that
    /// is still holding the lock.
    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::Acquire)
    }

    /// Number of registered peers.
    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Whether no peers are registered.
    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &PeerId) -> bool {
        self.peers.lock().await.contains_key(id)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
