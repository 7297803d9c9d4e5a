//! `RelayServer`: Axum HTTP + `WebSocket` server owning the registry and the
//! broadcast loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broadcast::{BroadcastLoop, LoopCounters};
use crate::config::{HEALTH_PATH, RelayConfig};
use crate::errors::RelayError;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::source::SubscriptionSource;
use crate::websocket::upgrade::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live peer connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Broadcast loop counters.
    pub counters: Arc<LoopCounters>,
    /// When the server started.
    pub start_time: Instant,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    counters: Arc<LoopCounters>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server with an empty registry.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            counters: Arc::new(LoopCounters::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            counters: self.counters.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route(HEALTH_PATH, get(health_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the listener and start serving in the background.
    ///
    /// Returns the bound address (useful with port `0`). The config is
    /// validated first.
    pub async fn listen(&self) -> Result<SocketAddr, RelayError> {
        self.config.validate()?;
        let host = self.config.host.as_str();
        let port = self.config.port;
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| RelayError::bind(format!("{host}:{port}"), e))?;
        let addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });
        self.shutdown.track("http", handle);

        info!(%addr, ws_path = %self.config.ws_path, "relay listening");
        Ok(addr)
    }

    /// Start the broadcast loop over `source`.
    ///
    /// The loop stops for good when the source closes or fails.
    pub fn spawn_broadcast<S>(&self, source: S)
    where
        S: SubscriptionSource + 'static,
    {
        let broadcast = BroadcastLoop::new(source, self.registry.clone())
            .with_counters(self.counters.clone());
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            // The loop logs its own outcome.
            let _ = broadcast.run(token).await;
        });
        self.shutdown.track("broadcast", handle);
    }

    /// Stop serving, stop the broadcast loop, and close every peer.
    pub async fn shutdown(&self) {
        let report = self
            .shutdown
            .shutdown_and_wait(self.config.shutdown_timeout())
            .await;
        let closed = self.registry.close_all().await;
        info!(
            stopped = ?report.stopped,
            aborted = ?report.aborted,
            closed,
            "relay stopped"
        );
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the broadcast loop counters.
    pub fn counters(&self) -> &Arc<LoopCounters> {
        &self.counters
    }

    /// Get the shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// GET /health
///
/// Reads only atomics, so it answers even while a broadcast is stuck on a
/// slow peer.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.member_count(),
        state.counters.is_running(),
        state.counters.messages_broadcast(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use std::pin::Pin;
    use std::time::Duration;

    use futures::{FutureExt, Stream};

    use crate::errors::SourceError;
    use crate::payload::Payload;
    use crate::registry::PeerId;
    use crate::registry::test_support::{StalledSink, sink};
    use crate::source::{StreamSource, channel};

    fn make_server() -> RelayServer {
        RelayServer::new(RelayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..RelayConfig::default()
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["messages_broadcast"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_is_degraded_without_broadcast_loop() {
        let server = make_server();
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["broadcasting"], false);
    }

    #[tokio::test]
    async fn health_is_ok_while_loop_runs() {
        let server = make_server();
        let (tx, source) = channel(4, "test");
        server.spawn_broadcast(source);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !server.counters().is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "ok");
        drop(tx);
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_rejected() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn custom_ws_path_is_routed() {
        let server = RelayServer::new(RelayConfig {
            ws_path: "/stream".into(),
            ..RelayConfig::default()
        });
        let app = server.router();

        let req = Request::builder().uri("/stream").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_assigns_port() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().await;
        assert!(server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = make_server();
        let addr = first.listen().await.unwrap();

        let second = RelayServer::new(RelayConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            ..RelayConfig::default()
        });
        let err = second.listen().await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn listen_rejects_invalid_config() {
        let server = RelayServer::new(RelayConfig {
            port: 0,
            channel: String::new(),
            ..RelayConfig::default()
        });
        let err = server.listen().await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn spawn_broadcast_accepts_send_only_source() {
        // A boxed `dyn Stream + Send` is not `Sync`, like the Redis source.
        type BoxedPayloads = Pin<Box<dyn Stream<Item = Result<Payload, SourceError>> + Send>>;

        let server = make_server();
        let (s, mut probe) = sink();
        let _ = server.registry().add(PeerId::new(), s).await;

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let stream: BoxedPayloads = Box::pin(rx);
        server.spawn_broadcast(StreamSource::new(stream, "boxed"));
        tx.unbounded_send(Ok(Payload::from("via boxed stream"))).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.counters().messages_broadcast() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(probe.drain(), vec!["via boxed stream"]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn health_answers_while_broadcast_is_stalled() {
        let server = make_server();
        let _ = server
            .registry()
            .add(PeerId::new(), Box::new(StalledSink))
            .await;
        let (tx, source) = channel(4, "test");
        server.spawn_broadcast(source);
        tx.send(Payload::from("stuck")).await.unwrap();

        // Wait until the broadcast holds the registry lock.
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.registry().contains(&PeerId::new()).now_or_never().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (status, body) = tokio::time::timeout(
            Duration::from_secs(5),
            get_json(server.router(), "/health"),
        )
        .await
        .expect("health blocked on the registry lock");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 1);
        assert_eq!(body["status"], "ok");

        // The stalled loop ignores cancellation, so keep the timeout short.
        let _ = server
            .shutdown_coordinator()
            .shutdown_and_wait(Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn shutdown_stops_broadcast_loop() {
        let server = make_server();
        let (tx, source) = channel(4, "test");
        server.spawn_broadcast(source);
        tx.send(Payload::from("x")).await.unwrap();

        server.shutdown().await;
        assert!(!server.counters().is_running());
    }
}
