//! Transport adapter for server-side axum WebSockets.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use switchboard_core::TransportError;

use super::{CloseFrame, Frame, FrameSink, FrameSource, Transport};

/// Wrap an upgraded axum socket.
pub fn from_axum(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(AxumSink { inner: sink }, AxumSource { inner: stream }).with_remote_addr(remote_addr)
}

struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

struct AxumSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(to_message(frame)).await.map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(ws_error)
    }
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        let next = self.inner.next().await?;
        Some(next.map(from_message).map_err(ws_error))
    }
}

fn ws_error(err: axum::Error) -> TransportError {
    TransportError::WebSocket(err.to_string())
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => Frame::Close(close.map(|c| CloseFrame {
            code: c.code,
            reason: c.reason.as_str().to_owned(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn text_and_close_convert_both_ways() {
        let close = Frame::Close(Some(CloseFrame {
            code: 1000,
            reason: "done".into(),
        }));
        assert_eq!(from_message(to_message(close.clone())), close);
        assert_eq!(
            from_message(to_message(Frame::Text("hello".into()))),
            Frame::Text("hello".into())
        );
    }

    #[test]
    fn ping_keeps_payload() {
        let ping = Frame::Ping(Bytes::from_static(b"p"));
        assert!(matches!(to_message(ping), Message::Ping(p) if p.as_ref() == b"p"));
    }
}
