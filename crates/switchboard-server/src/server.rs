//! `SwitchboardServer`: axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use switchboard_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::upgrade::{SessionHooks, ws_handler};
use crate::websocket::connection::ConnectionOptions;
use crate::websocket::registry::Registry;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server settings.
    pub settings: Arc<ServerSettings>,
    /// Options every accepted connection is built with.
    pub options: ConnectionOptions,
    /// Live connections, when the registry is enabled.
    pub registry: Option<Registry>,
    /// Application callbacks.
    pub hooks: Arc<dyn SessionHooks>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Reserved connection slots.
    pub active: Arc<AtomicUsize>,
    /// Prometheus handle backing `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The switchboard server.
pub struct SwitchboardServer {
    state: AppState,
}

impl SwitchboardServer {
    /// Create a server. Settings are expected to be validated.
    pub fn new(settings: ServerSettings, hooks: impl SessionHooks) -> Self {
        let options = ConnectionOptions::from(&settings);
        let registry = settings.registry_enabled.then(Registry::new);
        Self {
            state: AppState {
                settings: Arc::new(settings),
                options,
                registry,
                hooks: Arc::new(hooks),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                active: Arc::new(AtomicUsize::new(0)),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router: `/health`, `/metrics` and the WebSocket endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.state.settings.endpoint, get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve in a background task.
    ///
    /// Returns the bound address (useful with port 0) and the serve task,
    /// which ends once shutdown has been signalled and every registered
    /// connection has closed.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.settings.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();
        let registry = self.state.registry.clone();

        info!(%addr, endpoint = %self.state.settings.endpoint, "switchboard listening");
        let handle = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
            if let Some(registry) = registry {
                registry.close_all().await;
            }
            info!("switchboard stopped");
        });
        Ok((addr, handle))
    }

    /// Live connections, when the registry is enabled.
    pub fn registry(&self) -> Option<&Registry> {
        self.state.registry.as_ref()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.state.settings
    }

    /// Reserved connection slots, including upgrades in progress.
    pub fn connection_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.active.load(Ordering::SeqCst);
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, header};
    use switchboard_settings::EncryptionSettings;
    use tower::ServiceExt;

    use super::*;
    use crate::upgrade::{Admission, DefaultHooks, Rejection, UpgradeRequest};

    fn make_server(settings: ServerSettings) -> SwitchboardServer {
        SwitchboardServer::new(settings, DefaultHooks)
    }

    fn upgrade_request(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    async fn body_text(resp: Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server(ServerSettings::default()).router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let app = make_server(ServerSettings::default()).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders_text() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let app = make_server(ServerSettings::default()).with_metrics(handle).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server(ServerSettings::default()).router();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let settings = ServerSettings {
            allowed_origins: vec!["https://good.test".into()],
            ..ServerSettings::default()
        };
        let app = make_server(settings).router();
        let req = upgrade_request("/ws")
            .header(header::ORIGIN, "https://evil.test")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn full_server_is_unavailable() {
        let server = make_server(ServerSettings {
            max_connections: 1,
            ..ServerSettings::default()
        });
        server.state.active.store(1, Ordering::SeqCst);
        let req = upgrade_request("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn encryption_requires_public_key() {
        let settings = ServerSettings {
            encryption: Some(EncryptionSettings::default()),
            ..ServerSettings::default()
        };
        let server = make_server(settings);
        let req = upgrade_request("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("rsa_public_key_pem_b64"));
        // the reserved slot was released
        assert_eq!(server.connection_count(), 0);
    }

    struct DenyAll;

    #[async_trait]
    impl SessionHooks for DenyAll {
        async fn admit(&self, _request: &UpgradeRequest) -> Result<Admission, Rejection> {
            Err(Rejection::unauthorized("no token"))
        }
    }

    #[tokio::test]
    async fn admission_hook_can_reject() {
        let app = SwitchboardServer::new(ServerSettings::default(), DenyAll).router();
        let req = upgrade_request("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(resp).await, "no token");
    }

    #[tokio::test]
    async fn custom_endpoint_is_routed() {
        let server = make_server(ServerSettings {
            endpoint: "/live".into(),
            allowed_origins: vec!["https://good.test".into()],
            ..ServerSettings::default()
        });
        let req = upgrade_request("/live").body(Body::empty()).unwrap();
        // reaches the upgrade handler, which refuses the missing origin
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn registry_follows_settings() {
        assert!(make_server(ServerSettings::default()).registry().is_some());
        let server = make_server(ServerSettings {
            registry_enabled: false,
            ..ServerSettings::default()
        });
        assert!(server.registry().is_none());
        assert!(!server.shutdown().is_shutting_down());
    }
}
