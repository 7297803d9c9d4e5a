//! `WebSocket` acceptor: upgrade handling, per-peer session lifecycle, and the
//! socket-backed outbound sink.

pub mod session;
pub mod sink;
pub mod upgrade;
