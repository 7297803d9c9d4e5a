//! # relay-server
//!
//! Pub/sub to `WebSocket` broadcast relay.
//!
//! - Connection registry: the lock-serialized set of live peers
//! - `WebSocket` acceptor: upgrade, register, wait for disconnect, deregister
//! - Broadcast loop: drains the subscription source in order and fans each
//!   payload out to every registered peer, evicting peers whose write fails
//! - Subscription sources: Redis pub/sub, in-process channel, any `Stream`
//! - HTTP surface: upgrade path, `/health`, graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod errors;
pub mod health;
pub mod payload;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod source;
pub mod websocket;

pub use broadcast::{BroadcastLoop, BroadcastStats, LoopCounters};
pub use config::RelayConfig;
pub use errors::{ConfigError, PeerError, RelayError, SourceError, UpgradeError};
pub use payload::Payload;
pub use registry::{BroadcastReport, ConnectionRegistry, PeerId, PeerSink};
pub use server::RelayServer;
pub use source::{ChannelSource, StreamSource, SubscriptionSource};

#[cfg(feature = "redis")]
pub use source::RedisSource;
