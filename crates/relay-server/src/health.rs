//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the broadcast loop runs, `"degraded"` once it has stopped.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current registered peer count.
    pub connections: usize,
    /// Whether the broadcast loop is running.
    pub broadcasting: bool,
    /// Messages broadcast since startup.
    pub messages_broadcast: u64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    broadcasting: bool,
    messages_broadcast: u64,
) -> HealthResponse {
    HealthResponse {
        status: if broadcasting { "ok" } else { "degraded" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        broadcasting,
        messages_broadcast,
    }
}
