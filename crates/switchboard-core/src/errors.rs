//! Error taxonomy for connections.
//!
//! Every [`ConnectionError`] belongs to one [`ErrorCategory`], which decides
//! how it propagates:
//!
//! - [`ErrorCategory::Transport`]: terminates the connection
//! - [`ErrorCategory::Protocol`] and [`ErrorCategory::Application`]: the frame
//!   is dropped, an [`UpdateError`] is published on the connection's error
//!   channel, and the connection stays open
//! - [`ErrorCategory::WritePath`]: returned only to the caller of that write
//! - [`ErrorCategory::Lifecycle`]: misuse of a connection that is closed or
//!   already running

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Boxed error returned by application handlers and middleware.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was already closed.
    #[error("transport already closed")]
    Closed,
    /// WebSocket protocol or library error.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Read or write failure at the transport layer.
    Transport,
    /// Malformed envelope or empty update type.
    Protocol,
    /// Middleware veto or handler failure.
    Application,
    /// Encoding failure of a specific outbound message.
    WritePath,
    /// Operation on a connection in the wrong state.
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Application => "application",
            Self::WritePath => "write_path",
            Self::Lifecycle => "lifecycle",
        };
        f.write_str(s)
    }
}

/// Errors raised by a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closed (or closed while the operation was pending).
    #[error("connection closed")]
    Closed,

    /// `process_updates` was called more than once.
    #[error("updates are already being processed for this connection")]
    AlreadyProcessing,

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No frame arrived within the keepalive window.
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    /// The peer sent a close frame or ended the stream.
    #[error("connection closed by peer")]
    ClosedByPeer,

    /// An outbound JSON payload could not be encoded.
    #[error("failed to encode outbound message: {0}")]
    Encode(#[source] serde_json::Error),

    /// An outbound binary-as-text payload is not valid UTF-8.
    #[error("payload is not valid UTF-8 text: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),

    /// An inbound frame is not a valid envelope, or its payload does not
    /// match the handler's input shape.
    #[error("failed to decode update: {0}")]
    Decode(#[source] serde_json::Error),

    /// An inbound envelope has no `type`.
    #[error("empty update type")]
    EmptyUpdateType,

    /// Middleware rejected the frame.
    #[error("middleware rejected update: {0}")]
    Middleware(#[source] BoxError),

    /// A handler returned an error.
    #[error("handler for '{update_type}' failed: {source}")]
    Handler {
        /// Update type the handler is registered for (empty for the raw handler).
        update_type: String,
        /// The handler's error.
        #[source]
        source: BoxError,
    },
}

impl ConnectionError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::ReadTimeout(_) | Self::ClosedByPeer => {
                ErrorCategory::Transport
            }
            Self::Decode(_) | Self::EmptyUpdateType => ErrorCategory::Protocol,
            Self::Middleware(_) | Self::Handler { .. } => ErrorCategory::Application,
            Self::Encode(_) | Self::InvalidText(_) => ErrorCategory::WritePath,
            Self::Closed | Self::AlreadyProcessing => ErrorCategory::Lifecycle,
        }
    }

    /// Whether this error terminates the connection when seen by the read loop.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    /// Wrap a middleware error.
    pub fn middleware(err: impl Into<BoxError>) -> Self {
        Self::Middleware(err.into())
    }

    /// Wrap a handler error.
    pub fn handler(update_type: impl Into<String>, err: impl Into<BoxError>) -> Self {
        Self::Handler {
            update_type: update_type.into(),
            source: err.into(),
        }
    }
}

/// A non-fatal per-frame error, as published on a connection's error channel.
#[derive(Clone, Debug)]
pub struct UpdateError {
    /// The inbound frame that caused the error (empty for transport errors).
    pub frame: Bytes,
    /// The error.
    pub error: Arc<ConnectionError>,
}

impl UpdateError {
    /// Create a report for `frame`.
    pub fn new(frame: Bytes, error: ConnectionError) -> Self {
        Self {
            frame,
            error: Arc::new(error),
        }
    }

    /// Classification of the wrapped error.
    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} byte frame)", self.error, self.frame.len())
    }
}
