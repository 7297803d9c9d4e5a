//! Broadcast payload.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

/// One message from the subscription source, forwarded verbatim as a text
/// frame. Cloning is cheap; every peer shares the same buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<str>);

impl Payload {
    /// Build a payload from raw source bytes.
    ///
    /// Text frames must carry UTF-8, so invalid sequences are replaced with
    /// U+FFFD and a warning is logged.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self(Arc::from(text)),
            Err(e) => {
                warn!(len = bytes.len(), error = %e, "non-UTF-8 payload, replacing invalid bytes");
                Self(Arc::from(String::from_utf8_lossy(bytes).as_ref()))
            }
        }
    }

    /// The payload text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(Arc::from(text))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(Arc::from(text))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
