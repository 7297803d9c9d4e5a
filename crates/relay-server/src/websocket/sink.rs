//! Outbound half of an upgraded `WebSocket`.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;

use crate::errors::PeerError;
use crate::payload::Payload;
use crate::registry::PeerSink;

/// Write half of a split `WebSocket`, held by the registry.
pub struct WsPeerSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsPeerSink {
    /// Wrap the write half of a socket.
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PeerSink for WsPeerSink {
    async fn send_text(&mut self, payload: &Payload) -> Result<(), PeerError> {
        self.inner
            .send(Message::Text(payload.as_str().into()))
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        // The peer may already have closed its side; either way we're done.
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = self.inner.close().await;
    }
}
