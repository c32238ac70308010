//! Inbound read loop.

use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use switchboard_core::ConnectionError;
use tracing::{debug, instrument, trace};

use super::connection::{CloseReason, Connection};
use crate::metrics::WS_FRAMES_RECEIVED_TOTAL;
use crate::transport::{Frame, FrameSource};

/// Read frames until the connection shuts down or the transport gives up.
///
/// Returns the reason to close with, or `None` when the loop stopped because
/// the connection was already closing.
#[instrument(skip_all, fields(connection_id = %conn.id()))]
pub(crate) async fn run_reader(
    conn: &Connection,
    mut source: Box<dyn FrameSource>,
) -> Option<CloseReason> {
    let shutdown = conn.shutdown_token();
    let deadline = conn.keepalive();

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => return None,
            next = read_frame(source.as_mut(), deadline) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("inbound stream ended");
                return Some(CloseReason::StreamEnded);
            }
            Err(e) => {
                let reason = match e {
                    ConnectionError::ReadTimeout(_) => CloseReason::ReadTimeout,
                    ref other => CloseReason::Transport(other.to_string()),
                };
                conn.report(Bytes::new(), e);
                return Some(reason);
            }
        };

        conn.touch();
        counter!(WS_FRAMES_RECEIVED_TOTAL).increment(1);

        match frame {
            Frame::Text(text) => conn.dispatch(Bytes::from(text)).await,
            Frame::Binary(data) => conn.dispatch(data).await,
            Frame::Ping(_) | Frame::Pong(_) => trace!("liveness frame"),
            Frame::Close(close) => {
                conn.report(Bytes::new(), ConnectionError::ClosedByPeer);
                return Some(CloseReason::ClosedByPeer(close));
            }
        }
    }
}

async fn read_frame(
    source: &mut dyn FrameSource,
    deadline: Option<Duration>,
) -> Result<Option<Frame>, ConnectionError> {
    let next = match deadline {
        Some(window) => tokio::time::timeout(window, source.recv())
            .await
            .map_err(|_| ConnectionError::ReadTimeout(window))?,
        None => source.recv().await,
    };
    next.transpose().map_err(ConnectionError::from)
}
