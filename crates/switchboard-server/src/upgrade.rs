//! HTTP upgrade: admission checks run before the WebSocket handshake.
//!
//! Order: origin allow-list (403), connection limit (503), client key when
//! encryption is configured (400), application [`SessionHooks::admit`], then
//! the handshake itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts, Query, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::metrics::WS_REJECTED_TOTAL;
use crate::server::AppState;
use crate::websocket::connection::Connection;
use crate::websocket::session::{Session, run_session};

/// Header or query parameter carrying the client's base64 PEM public key.
pub const PUBLIC_KEY_PARAM: &str = "rsa_public_key_pem_b64";

/// What the application sees of an upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    headers: HeaderMap,
    uri: Uri,
    query: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
    client_public_key_pem: Option<String>,
}

impl UpgradeRequest {
    /// Build from request parts.
    pub fn new(headers: HeaderMap, uri: Uri, remote_addr: Option<SocketAddr>) -> Self {
        let query = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        Self {
            headers,
            uri,
            query,
            remote_addr,
            client_public_key_pem: None,
        }
    }

    /// All request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// A query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The `Origin` header.
    pub fn origin(&self) -> Option<&str> {
        self.header(header::ORIGIN.as_str())
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Decoded client public key, present when encryption is configured.
    pub fn client_public_key_pem(&self) -> Option<&str> {
        self.client_public_key_pem.as_deref()
    }

    fn read_public_key(&self) -> Result<String, Rejection> {
        let encoded = self
            .header(PUBLIC_KEY_PARAM)
            .or_else(|| self.query(PUBLIC_KEY_PARAM))
            .ok_or_else(|| Rejection::bad_request(format!("missing {PUBLIC_KEY_PARAM}")))?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| Rejection::bad_request(format!("{PUBLIC_KEY_PARAM} is not valid base64")))?;
        String::from_utf8(decoded)
            .map_err(|_| Rejection::bad_request(format!("{PUBLIC_KEY_PARAM} is not a UTF-8 PEM")))
    }
}

/// Accepted upgrade: optional id and initial attributes.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    /// Connection id; a fresh one is generated when `None`.
    pub id: Option<String>,
    /// Attributes set before the connection is registered.
    pub attributes: HashMap<String, Value>,
}

impl Admission {
    /// Use `id` instead of a generated one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Start with attribute `key` set.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Refused upgrade, answered as a plain HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Response status.
    pub status: StatusCode,
    /// Response body.
    pub body: String,
}

impl Rejection {
    /// Reject with `status` and `body`.
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 400.
    pub fn bad_request(body: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, body)
    }

    /// 401.
    pub fn unauthorized(body: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, body)
    }

    /// 403.
    pub fn forbidden(body: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, body)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

/// Application callbacks around each accepted connection.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// Decide whether to upgrade. Runs before the handshake.
    async fn admit(&self, _request: &UpgradeRequest) -> Result<Admission, Rejection> {
        Ok(Admission::default())
    }

    /// Set up a new connection: register handlers, write a greeting.
    ///
    /// Runs after registration and before the first read.
    async fn on_connection(&self, _conn: &Connection) {}
}

/// Hooks that admit everyone and register nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

#[async_trait]
impl SessionHooks for DefaultHooks {}

/// One reserved connection slot, released on drop.
pub(crate) struct SlotGuard {
    active: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: active.clone(),
            })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reject(reason: &'static str, rejection: Rejection) -> Response {
    counter!(WS_REJECTED_TOTAL, "reason" => reason).increment(1);
    debug!(reason, status = %rejection.status, "upgrade rejected");
    rejection.into_response()
}

/// GET on the configured endpoint.
pub(crate) async fn ws_handler(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let mut upgrade = UpgradeRequest::new(parts.headers.clone(), parts.uri.clone(), remote_addr);

    if !state.settings.origin_allowed(upgrade.origin()) {
        return reject("origin", Rejection::forbidden("origin not allowed"));
    }

    let Some(slot) = SlotGuard::acquire(&state.active, state.settings.max_connections) else {
        warn!(limit = state.settings.max_connections, "connection limit reached");
        return reject(
            "capacity",
            Rejection::new(StatusCode::SERVICE_UNAVAILABLE, "connection limit reached"),
        );
    };

    if state.settings.encryption.is_some() {
        match upgrade.read_public_key() {
            Ok(pem) => upgrade.client_public_key_pem = Some(pem),
            Err(rejection) => return reject("public_key", rejection),
        }
    }

    let admission = match state.hooks.admit(&upgrade).await {
        Ok(admission) => admission,
        Err(rejection) => return reject("hook", rejection),
    };

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            counter!(WS_REJECTED_TOTAL, "reason" => "handshake").increment(1);
            return rejection.into_response();
        }
    };

    let session = Session {
        state: state.clone(),
        admission,
        remote_addr,
        slot,
    };
    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| state.shutdown.track(run_session(socket, session)))
}
