//! Broadcast loop: drains the subscription source and fans each payload out
//! through the registry.
//!
//! The loop pulls one message, broadcasts it to every peer (including any
//! evictions), and only then pulls the next. A source failure stops the loop
//! for good; the server keeps accepting connections but nothing more is sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::SourceError;
use crate::payload::Payload;
use crate::registry::ConnectionRegistry;
use crate::source::SubscriptionSource;

/// Totals for one run of the broadcast loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Messages taken from the source and broadcast.
    pub messages: u64,
    /// Successful per-peer writes.
    pub deliveries: u64,
    /// Peers evicted after a failed write.
    pub evictions: u64,
}

/// Live counters shared between the loop and the health endpoint.
#[derive(Debug, Default)]
pub struct LoopCounters {
    running: AtomicBool,
    messages: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

impl LoopCounters {
    /// Fresh, stopped counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Messages broadcast so far.
    pub fn messages_broadcast(&self) -> u64 {
        self.messages.load(Ordering::Acquire)
    }

    /// Point-in-time copy of the totals.
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages: self.messages.load(Ordering::Acquire),
            deliveries: self.deliveries.load(Ordering::Acquire),
            evictions: self.evictions.load(Ordering::Acquire),
        }
    }
}

/// Single worker that forwards every source message to every peer.
pub struct BroadcastLoop<S> {
    source: S,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<LoopCounters>,
}

impl<S: SubscriptionSource> BroadcastLoop<S> {
    /// Create a loop over `source` broadcasting through `registry`.
    pub fn new(source: S, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            source,
            registry,
            counters: Arc::new(LoopCounters::new()),
        }
    }

    /// Report into externally owned counters.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<LoopCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Counters this loop reports into.
    pub fn counters(&self) -> Arc<LoopCounters> {
        self.counters.clone()
    }

    /// Run until the source closes, the source fails, or `shutdown` fires.
    ///
    /// Returns the totals on a clean stop and the source error otherwise. A
    /// broadcast already in progress always finishes before shutdown is
    /// observed.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<BroadcastStats, SourceError> {
        let source = self.source.describe();
        self.counters.running.store(true, Ordering::Release);
        info!(source = %source, "broadcast loop started");

        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(source = %source, "shutdown requested, broadcast loop stopping");
                    break Ok(());
                }
                next = self.source.next_message() => next,
            };

            match next {
                Ok(Some(payload)) => dispatch(&self.registry, &self.counters, &payload).await,
                Ok(None) => {
                    warn!(source = %source, "subscription closed, no further broadcasts");
                    break Ok(());
                }
                Err(e) => {
                    error!(source = %source, error = %e, "subscription failed, no further broadcasts");
                    break Err(e);
                }
            }
        };

        self.counters.running.store(false, Ordering::Release);
        let stats = self.counters.snapshot();
        info!(
            source = %source,
            messages = stats.messages,
            deliveries = stats.deliveries,
            evictions = stats.evictions,
            "broadcast loop stopped"
        );
        outcome.map(|()| stats)
    }
}

/// Broadcast one payload and fold the outcome into `counters`.
///
/// Takes the fields rather than `&self`: the loop future must be `Send` even
/// when the source is not `Sync`.
async fn dispatch(registry: &ConnectionRegistry, counters: &LoopCounters, payload: &Payload) {
    let report = registry.broadcast(payload).await;
    let _ = counters.messages.fetch_add(1, Ordering::AcqRel);
    let _ = counters
        .deliveries
        .fetch_add(report.delivered as u64, Ordering::AcqRel);
    let _ = counters
        .evictions
        .fetch_add(report.evicted.len() as u64, Ordering::AcqRel);
}
