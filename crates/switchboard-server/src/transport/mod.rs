//! Frame-level transport seam.
//!
//! A [`Transport`] is a split duplex: the [`FrameSink`] is owned by the
//! connection's writer task and the [`FrameSource`] by its read loop, so the
//! underlying socket is never written from two tasks.

pub mod axum;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod tungstenite;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use switchboard_core::{OutboundFrame, TransportError};

/// Close frame payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// One transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data frame.
    Text(String),
    /// Binary data frame.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness acknowledgment.
    Pong(Bytes),
    /// Close handshake.
    Close(Option<CloseFrame>),
}

impl From<OutboundFrame> for Frame {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Text(text) => Self::Text(text),
            OutboundFrame::Binary(data) => Self::Binary(data),
        }
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the transport. Unblocks the peer's reads.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame, `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// A split transport handed to a connection.
pub struct Transport {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub source: Box<dyn FrameSource>,
    /// Peer address, when known.
    pub remote_addr: Option<SocketAddr>,
}

impl Transport {
    /// Assemble a transport from its halves.
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
            remote_addr: None,
        }
    }

    /// Attach the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
