//! `GET <ws_path>` upgrade handler.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::session::run_peer_session;
use crate::errors::UpgradeError;
use crate::server::AppState;

/// Upgrade the request and hand the socket to a peer session.
///
/// A request that cannot be upgraded is logged and answered with the
/// rejection; the registry is never touched.
pub async fn ws_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            let err = UpgradeError::from(rejection);
            warn!(error = %err, "websocket upgrade rejected");
            return err.into_response();
        }
    };

    let registry = state.registry.clone();
    let shutdown = state.shutdown.token();
    upgrade
        .on_failed_upgrade(|e| {
            let err = UpgradeError::Failed(e);
            warn!(error = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| run_peer_session(socket, registry, shutdown))
}
