//! In-memory transport for exercising connections without sockets.
//!
//! [`pair`] returns the transport to hand to a connection and a
//! [`MemoryPeer`] that plays the remote side: it injects inbound frames and
//! errors, observes outbound frames, and can force writes to fail or stall.
//! Built for tests and the `test-util` feature only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use switchboard_core::TransportError;
use tokio::sync::mpsc;

use super::{Frame, FrameSink, FrameSource, Transport};

#[derive(Default)]
struct PeerState {
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    closed: AtomicBool,
}

/// Create a connected transport/peer pair.
pub fn pair() -> (Transport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(PeerState::default());

    let transport = Transport::new(
        MemorySink {
            tx: Some(outbound_tx),
            state: state.clone(),
        },
        MemorySource { rx: inbound_rx },
    );
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        state,
    };
    (transport, peer)
}

/// Remote end of an in-memory transport.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    state: Arc<PeerState>,
}

impl MemoryPeer {
    /// Deliver a frame to the connection. Returns `false` if the reader is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Deliver a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Deliver a binary frame.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(Frame::Binary(data.into()))
    }

    /// Make the connection's next read fail.
    pub fn send_error(&self, err: TransportError) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Err(err)).is_ok())
    }

    /// End the inbound stream, as if the peer vanished.
    pub fn end_stream(&mut self) {
        self.inbound = None;
    }

    /// Force subsequent writes by the connection to fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes by the connection hang until it is closed.
    pub fn stall_writes(&self, stall: bool) {
        self.state.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Whether the connection closed its end.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Next frame written by the connection, `None` once it closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next written frame, if one is already available.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Next written data frame as text, skipping pings.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Binary(data) => return Some(String::from_utf8_lossy(&data).into_owned()),
                _ => {}
            }
        }
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    state: Arc<PeerState>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocket("injected write failure".into()));
        }
        if self.state.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut transport, mut peer) = pair();

        assert!(peer.send_text("in"));
        let inbound = transport.source.recv().await.unwrap().unwrap();
        assert_eq!(inbound, Frame::Text("in".into()));

        transport.sink.send(Frame::Text("out".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("out".into())));
    }

    #[tokio::test]
    async fn injected_failures() {
        let (mut transport, mut peer) = pair();

        peer.fail_writes(true);
        assert!(transport.sink.send(Frame::Text("x".into())).await.is_err());

        assert!(peer.send_error(TransportError::Closed));
        assert!(transport.source.recv().await.unwrap().is_err());

        peer.end_stream();
        assert!(transport.source.recv().await.is_none());
    }

    #[tokio::test]
    async fn stalled_writes_never_complete() {
        let (mut transport, mut peer) = pair();
        peer.stall_writes(true);
        let send = transport.sink.send(Frame::Text("stuck".into()));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), send)
                .await
                .is_err()
        );
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_ends_outbound_stream() {
        let (mut transport, mut peer) = pair();
        transport.sink.close().await.unwrap();
        assert!(peer.is_closed());
        assert_eq!(peer.recv().await, None);
        assert!(transport.sink.send(Frame::Text("late".into())).await.is_err());
    }
}
