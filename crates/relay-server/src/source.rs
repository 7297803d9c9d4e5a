//! Subscription sources: ordered payload streams that drive broadcasts.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::errors::SourceError;
use crate::payload::Payload;

/// An ordered sequence of payloads from a pub/sub channel.
///
/// `next_message` must be cancel-safe: the broadcast loop races it against
/// the shutdown token.
#[async_trait]
pub trait SubscriptionSource: Send {
    /// Wait for the next payload. `Ok(None)` means the source has closed.
    async fn next_message(&mut self) -> Result<Option<Payload>, SourceError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// In-process source fed through a `tokio::sync::mpsc` channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Payload>,
    name: String,
}

impl ChannelSource {
    /// Wrap an existing receiver.
    pub fn new(rx: mpsc::Receiver<Payload>, name: impl Into<String>) -> Self {
        Self {
            rx,
            name: name.into(),
        }
    }
}

/// Create a bounded in-process source and its publishing half.
pub fn channel(capacity: usize, name: impl Into<String>) -> (mpsc::Sender<Payload>, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ChannelSource::new(rx, name))
}

#[async_trait]
impl SubscriptionSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<Payload>, SourceError> {
        Ok(self.rx.recv().await)
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }
}

/// Adapts any stream of payload results into a source.
pub struct StreamSource<S> {
    inner: S,
    name: String,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = Result<Payload, SourceError>> + Send + Unpin,
{
    /// Wrap `inner`.
    pub fn new(inner: S, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<S> SubscriptionSource for StreamSource<S>
where
    S: Stream<Item = Result<Payload, SourceError>> + Send + Unpin,
{
    async fn next_message(&mut self) -> Result<Option<Payload>, SourceError> {
        self.inner.next().await.transpose()
    }

    fn describe(&self) -> String {
        format!("stream:{}", self.name)
    }
}

#[cfg(feature = "redis")]
type MessageStream<T> = std::pin::Pin<Box<dyn Stream<Item = T> + Send>>;

/// Redis pub/sub subscription on a single channel.
///
/// The message stream ends when the connection drops; there is no
/// reconnect.
#[cfg(feature = "redis")]
pub struct RedisSource {
    messages: MessageStream<redis::Msg>,
    channel: String,
}

#[cfg(feature = "redis")]
impl RedisSource {
    /// Connect to `url` and subscribe to `channel`.
    ///
    /// `url` may also be a bare `host:port`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self, SourceError> {
        let subscribe_err = |e: redis::RedisError| SourceError::Subscribe {
            channel: channel.to_owned(),
            message: e.to_string(),
        };
        let client = redis::Client::open(crate::config::redis_connection_url(url))
            .map_err(subscribe_err)?;
        let mut pubsub = client.get_async_pubsub().await.map_err(subscribe_err)?;
        pubsub.subscribe(channel).await.map_err(subscribe_err)?;
        tracing::info!(channel, "subscribed to redis channel");

        Ok(Self {
            messages: Box::pin(pubsub.into_on_message()),
            channel: channel.to_owned(),
        })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl SubscriptionSource for RedisSource {
    async fn next_message(&mut self) -> Result<Option<Payload>, SourceError> {
        Ok(self
            .messages
            .next()
            .await
            .map(|msg| Payload::from_bytes(msg.get_payload_bytes())))
    }

    fn describe(&self) -> String {
        format!("redis:{}", self.channel)
    }
}
