//! Connection actor handle.
//!
//! A [`Connection`] is a cheap clonable handle to one duplex session. It owns
//! three tasks: the writer (spawned at construction), and the read loop and
//! heartbeat (spawned by [`Connection::process_updates`]).
//!
//! Close protocol: `Open → Closing → Closed`. The first closer wins the
//! `Open → Closing` transition and then, in order, deregisters the connection,
//! spawns the close callback, drops all handlers, and signals the writer,
//! which closes the transport and fires the closed-signal. Later closers only
//! wait for that signal.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use switchboard_core::{
    BoxError, ConnectionError, ConnectionId, OutboundMessage, ServerUpdate, Update, UpdateError,
};
use switchboard_settings::ServerSettings;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::SendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{
    Dispatch, HandlerTable, Middleware, RawHandler, TypeMiddleware, TypedHandler, UpdateHandler,
};
use super::heartbeat::{probe_interval, run_heartbeat};
use super::reader::run_reader;
use super::registry::{Registry, WeakRegistry};
use super::writer::{Payload, WriterHandle, spawn_writer};
use crate::metrics::{WS_UNHANDLED_DROPPED_TOTAL, WS_UPDATE_ERRORS_TOTAL};
use crate::transport::{CloseFrame, FrameSource, Transport};

/// Per-connection tuning.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Heartbeat period and read deadline. `None` disables both.
    pub keepalive: Option<Duration>,
    /// Capacity of the unhandled-update stream.
    pub unhandled_buffer: usize,
    /// Capacity of the error-report stream.
    pub error_buffer: usize,
    /// Upper bound for closing the transport.
    pub close_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keepalive: None,
            unhandled_buffer: 64,
            error_buffer: 64,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ServerSettings> for ConnectionOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            keepalive: settings.keepalive(),
            unhandled_buffer: settings.unhandled_buffer,
            error_buffer: settings.error_buffer,
            close_timeout: settings.close_timeout(),
        }
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting reads and writes.
    Open,
    /// Close in progress.
    Closing,
    /// Terminal.
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Why a connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The application called [`Connection::close`].
    Local,
    /// Forced out through the registry.
    Evicted,
    /// Another connection registered under the same id.
    Replaced,
    /// The server is shutting down.
    Shutdown,
    /// The peer sent a close frame.
    ClosedByPeer(Option<CloseFrame>),
    /// No frame arrived within the keepalive window.
    ReadTimeout,
    /// The transport failed.
    Transport(String),
    /// The inbound stream ended without a close frame.
    StreamEnded,
}

impl CloseReason {
    /// Short metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Evicted => "evicted",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
            Self::ClosedByPeer(_) => "peer",
            Self::ReadTimeout => "read_timeout",
            Self::Transport(_) => "transport",
            Self::StreamEnded => "stream_ended",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Evicted => f.write_str("evicted"),
            Self::Replaced => f.write_str("replaced by a newer connection"),
            Self::Shutdown => f.write_str("server shutdown"),
            Self::ClosedByPeer(Some(frame)) => write!(f, "closed by peer: {frame}"),
            Self::ClosedByPeer(None) => f.write_str("closed by peer"),
            Self::ReadTimeout => f.write_str("read deadline exceeded"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::StreamEnded => f.write_str("stream ended"),
        }
    }
}

/// State shared between the handle and the writer task.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    pub(crate) shutdown: CancellationToken,
    pub(crate) closed: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Win the `Open → Closing` transition. Only one caller ever gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::SeqCst);
    }
}

type CloseCallback = Box<dyn FnOnce(CloseReason) -> BoxFuture<'static, ()> + Send>;

/// Close callback slot. Taken exactly once, by the winning closer.
enum CloseHook {
    Armed(Option<CloseCallback>),
    Fired,
}

struct Inner {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    keepalive: Option<Duration>,
    writer: WriterHandle,
    lifecycle: Arc<Lifecycle>,
    handlers: HandlerTable,
    attributes: RwLock<HashMap<String, Value>>,
    errors: broadcast::Sender<UpdateError>,
    unhandled: broadcast::Sender<Update>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    close_reason: OnceLock<CloseReason>,
    on_close: Mutex<CloseHook>,
    registry: Mutex<Option<WeakRegistry>>,
    last_activity: Mutex<Instant>,
}

/// Handle to one live duplex session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap `transport` and start the writer task.
    ///
    /// Must be called within a Tokio runtime. Inbound frames are not read
    /// until [`process_updates`](Self::process_updates) runs.
    pub fn new(id: ConnectionId, transport: Transport, options: ConnectionOptions) -> Self {
        let Transport {
            sink,
            source,
            remote_addr,
        } = transport;
        let lifecycle = Arc::new(Lifecycle::new());
        let writer = spawn_writer(id.clone(), sink, lifecycle.clone(), options.close_timeout);
        let (errors, _) = broadcast::channel(options.error_buffer.max(1));
        let (unhandled, _) = broadcast::channel(options.unhandled_buffer.max(1));

        Self {
            inner: Arc::new(Inner {
                id,
                remote_addr,
                connected_at: Utc::now(),
                keepalive: options.keepalive.filter(|k| !k.is_zero()),
                writer,
                lifecycle,
                handlers: HandlerTable::default(),
                attributes: RwLock::new(HashMap::new()),
                errors,
                unhandled,
                source: Mutex::new(Some(source)),
                close_reason: OnceLock::new(),
                on_close: Mutex::new(CloseHook::Armed(None)),
                registry: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    // ── Identity and state ──────────────────────────────────────────

    /// Connection id, immutable for the connection's lifetime.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// When the connection was created.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Keepalive window, `None` when disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        self.inner.keepalive
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// Whether the connection is still `Open`.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the connection closed, once closing has begun.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    /// Time since the last inbound frame (or creation).
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.lifecycle.shutdown.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Run the read loop (and heartbeat, when enabled) until the connection closes.
    ///
    /// Register handlers before calling this so the first frame finds them.
    /// Fails with [`ConnectionError::AlreadyProcessing`] on a second call.
    pub async fn process_updates(&self) -> Result<CloseReason, ConnectionError> {
        let source = self
            .inner
            .source
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyProcessing)?;

        if self.is_open() {
            let conn = self.clone();
            let _ = tokio::spawn(async move {
                if let Some(reason) = run_reader(&conn, source).await {
                    conn.close_with(reason).await;
                }
            });

            if let Some(keepalive) = self.inner.keepalive {
                let writer = self.inner.writer.clone();
                let cancel = self.shutdown_token();
                let id = self.id().clone();
                let _ = tokio::spawn(async move {
                    let result = run_heartbeat(writer, probe_interval(keepalive), cancel).await;
                    debug!(connection_id = %id, ?result, "heartbeat stopped");
                });
            }
        }

        self.closed().await;
        Ok(self.close_reason().unwrap_or(CloseReason::Local))
    }

    /// Resolve once the connection is `Closed`.
    pub async fn closed(&self) {
        self.inner.lifecycle.closed.cancelled().await;
    }

    /// Close the connection. Idempotent; returns once it is `Closed`.
    pub async fn close(&self) {
        self.close_with(CloseReason::Local).await;
    }

    pub(crate) async fn close_with(&self, reason: CloseReason) {
        if !self.inner.lifecycle.begin_close() {
            self.closed().await;
            return;
        }
        self.finish_close(reason).await;
    }

    /// Everything after the `Open → Closing` transition.
    async fn finish_close(&self, reason: CloseReason) {
        let _ = self.inner.close_reason.set(reason.clone());
        info!(connection_id = %self.id(), %reason, "closing connection");

        let registry = self.inner.registry.lock().take();
        if let Some(registry) = registry.and_then(|r| r.upgrade()) {
            let _ = registry.remove_if_same(self);
        }

        let hook = std::mem::replace(&mut *self.inner.on_close.lock(), CloseHook::Fired);
        if let CloseHook::Armed(Some(callback)) = hook {
            let _ = tokio::spawn(callback(reason));
        }

        // handler closures may hold clones of this handle
        self.inner.handlers.seal();

        self.inner.lifecycle.shutdown.cancel();
        self.closed().await;
    }

    /// Run `callback` on its own task once the connection starts closing.
    ///
    /// Replaces any earlier callback that has not run yet. Registered after
    /// the close protocol has taken the callback, it runs as soon as the
    /// connection is `Closed`.
    pub fn on_close<F, Fut>(&self, callback: F)
    where
        F: FnOnce(CloseReason) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: CloseCallback =
            Box::new(move |reason: CloseReason| -> BoxFuture<'static, ()> { Box::pin(callback(reason)) });

        let mut hook = self.inner.on_close.lock();
        if let CloseHook::Armed(slot) = &mut *hook {
            *slot = Some(callback);
            return;
        }
        drop(hook);

        let conn = self.clone();
        let _ = tokio::spawn(async move {
            conn.closed().await;
            let reason = conn.close_reason().unwrap_or(CloseReason::Local);
            callback(reason).await;
        });
    }

    /// The registry this connection is registered in, while it is.
    pub fn registry(&self) -> Option<Registry> {
        self.inner.registry.lock().as_ref().and_then(WeakRegistry::upgrade)
    }

    pub(crate) fn link_registry(&self, registry: WeakRegistry) {
        *self.inner.registry.lock() = Some(registry);
    }

    pub(crate) fn unlink_registry(&self) {
        *self.inner.registry.lock() = None;
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Write one message and wait for the writer's outcome.
    ///
    /// Transport failures are returned here and do not close the
    /// connection. After close every write fails with
    /// [`ConnectionError::Closed`].
    pub async fn write(&self, message: impl Into<OutboundMessage>) -> Result<(), ConnectionError> {
        self.inner.writer.submit(Payload::Message(message.into())).await
    }

    /// Write a text frame.
    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.write(OutboundMessage::Text(text.into())).await
    }

    /// Write a binary frame.
    pub async fn write_binary(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.write(OutboundMessage::Binary(data.into())).await
    }

    /// Write UTF-8 bytes as a text frame.
    pub async fn write_binary_text(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.write(OutboundMessage::BinaryAsText(data.into())).await
    }

    /// Write `value` as JSON, without an envelope.
    pub async fn write_json<T>(&self, value: T) -> Result<(), ConnectionError>
    where
        T: Serialize + Send + 'static,
    {
        self.write(OutboundMessage::json(value)).await
    }

    /// Write a `{type, data}` envelope.
    pub async fn write_update<T>(
        &self,
        update_type: impl Into<String>,
        data: T,
    ) -> Result<(), ConnectionError>
    where
        T: Serialize + Send + 'static,
    {
        self.write(OutboundMessage::update(update_type, data)).await
    }

    /// Write a `{type, data, extra}` envelope.
    pub async fn write_update_with_extra<T>(
        &self,
        update_type: impl Into<String>,
        data: T,
        extra: impl Into<String>,
    ) -> Result<(), ConnectionError>
    where
        T: Serialize + Send + 'static,
    {
        let update = ServerUpdate::new(update_type, data).with_extra(extra);
        self.write(OutboundMessage::json(update)).await
    }

    // ── Handlers and middleware ─────────────────────────────────────

    /// Bind an async function to `update_type`, decoding `data` into `T`.
    ///
    /// Use [`EmptyInput`](switchboard_core::EmptyInput) for handlers that take
    /// no payload. Re-registering a type replaces the previous handler.
    pub fn handle_update<T, F, Fut, E>(&self, update_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.register_handler(update_type, Arc::new(TypedHandler::new(handler)));
    }

    /// Bind a prepared handler to `update_type`.
    pub fn register_handler(&self, update_type: impl Into<String>, handler: Arc<dyn UpdateHandler>) {
        let update_type = update_type.into();
        if !self.inner.handlers.set_typed(update_type.clone(), handler) {
            debug!(connection_id = %self.id(), update_type, "handler registered after close, ignored");
        }
    }

    /// Unbind `update_type`. Returns whether a handler was registered.
    pub fn remove_handler(&self, update_type: &str) -> bool {
        self.inner.handlers.remove_typed(update_type)
    }

    /// Whether a handler is bound to `update_type`.
    pub fn has_handler(&self, update_type: &str) -> bool {
        self.inner.handlers.has_typed(update_type)
    }

    /// Receive every inbound frame verbatim, bypassing envelope decoding.
    pub fn handle_raw_update<F, Fut, E>(&self, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let raw: RawHandler = Arc::new(move |frame: Bytes| -> BoxFuture<'static, Result<(), BoxError>> {
            let fut = handler(frame);
            Box::pin(async move { fut.await.map_err(Into::into) })
        });
        let _ = self.inner.handlers.set_raw(Some(raw));
    }

    /// Remove the raw handler, restoring typed dispatch.
    pub fn clear_raw_handler(&self) {
        let _ = self.inner.handlers.set_raw(None);
    }

    /// Inspect every frame before decoding. An error drops and reports the frame.
    pub fn set_middleware<F, E>(&self, middleware: F)
    where
        F: Fn(&[u8]) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let middleware: Middleware = Arc::new(move |frame: &[u8]| -> Result<(), BoxError> {
            middleware(frame).map_err(Into::into)
        });
        let _ = self.inner.handlers.set_middleware(Some(middleware));
    }

    /// Remove the pre-decode middleware.
    pub fn clear_middleware(&self) {
        let _ = self.inner.handlers.set_middleware(None);
    }

    /// Inspect the update type and undecoded payload before the typed
    /// handler runs. An error drops and reports the frame.
    pub fn set_update_type_middleware<F, E>(&self, middleware: F)
    where
        F: Fn(&str, Option<&Value>) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let middleware: TypeMiddleware = Arc::new(
            move |update_type: &str, data: Option<&Value>| -> Result<(), BoxError> {
                middleware(update_type, data).map_err(Into::into)
            },
        );
        let _ = self.inner.handlers.set_type_middleware(Some(middleware));
    }

    /// Remove the type middleware.
    pub fn clear_update_type_middleware(&self) {
        let _ = self.inner.handlers.set_type_middleware(None);
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Subscribe to non-fatal per-frame errors and the fatal error that ended
    /// the read loop.
    ///
    /// Slow subscribers lose the oldest reports; nothing ever blocks on them.
    pub fn errors(&self) -> broadcast::Receiver<UpdateError> {
        self.inner.errors.subscribe()
    }

    /// Subscribe to envelopes no typed handler claimed.
    ///
    /// With no subscriber such frames are dropped. Slow subscribers lose the
    /// oldest updates.
    pub fn unhandled_updates(&self) -> broadcast::Receiver<Update> {
        self.inner.unhandled.subscribe()
    }

    pub(crate) async fn dispatch(&self, frame: Bytes) {
        match self.inner.handlers.dispatch(&frame).await {
            Ok(Dispatch::Handled) => {}
            Ok(Dispatch::Unhandled(update)) => self.publish_unhandled(update),
            Err(error) => self.report(frame, error),
        }
    }

    fn publish_unhandled(&self, update: Update) {
        if let Err(SendError(update)) = self.inner.unhandled.send(update) {
            counter!(WS_UNHANDLED_DROPPED_TOTAL).increment(1);
            debug!(
                connection_id = %self.id(),
                update_type = %update.update_type,
                "unhandled update dropped, no subscriber"
            );
        }
    }

    pub(crate) fn report(&self, frame: Bytes, error: ConnectionError) {
        let category = error.category();
        counter!(WS_UPDATE_ERRORS_TOTAL, "category" => category.to_string()).increment(1);
        if matches!(error, ConnectionError::ClosedByPeer) {
            debug!(connection_id = %self.id(), "peer ended the connection");
        } else {
            warn!(connection_id = %self.id(), %category, error = %error, "update error");
        }
        let _ = self.inner.errors.send(UpdateError::new(frame, error));
    }

    // ── Attributes ──────────────────────────────────────────────────

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.attributes.write().insert(key.into(), value.into())
    }

    /// Current value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.inner.attributes.read().get(key).cloned()
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.inner.attributes.write().remove(key)
    }

    /// Snapshot of all attributes.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.inner.attributes.read().clone()
    }

    /// Whether attribute `key` equals `value`.
    pub fn has_attribute(&self, key: &str, value: &Value) -> bool {
        self.inner.attributes.read().get(key) == Some(value)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("remote_addr", &self.inner.remote_addr)
            .finish_non_exhaustive()
    }
}
