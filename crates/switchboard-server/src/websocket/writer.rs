//! Serializing writer task.
//!
//! Every outbound frame of a connection, including heartbeat pings, goes
//! through one FIFO queue drained by a single task that owns the sink. Each
//! request carries a oneshot slot that receives exactly one outcome.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use switchboard_core::{ConnectionError, ConnectionId, OutboundMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::connection::Lifecycle;
use crate::metrics::WS_WRITE_FAILURES_TOTAL;
use crate::transport::{Frame, FrameSink};

/// Outcome delivered to the submitter of a write.
pub(crate) type WriteResult = Result<(), ConnectionError>;

/// What to put on the wire.
pub(crate) enum Payload {
    Message(OutboundMessage),
    Ping,
}

struct WriteRequest {
    payload: Payload,
    done: oneshot::Sender<WriteResult>,
}

/// Submission side of the outbound queue.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl WriterHandle {
    /// Enqueue `payload` and wait for the writer's verdict on it.
    pub(crate) async fn submit(&self, payload: Payload) -> WriteResult {
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(WriteRequest { payload, done })
            .map_err(|_| ConnectionError::Closed)?;
        // a dropped slot means the writer shut down before reaching this request
        outcome.await.unwrap_or(Err(ConnectionError::Closed))
    }
}

/// Spawn the writer task for a connection.
pub(crate) fn spawn_writer(
    id: ConnectionId,
    sink: Box<dyn FrameSink>,
    lifecycle: Arc<Lifecycle>,
    close_timeout: Duration,
) -> WriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tokio::spawn(run_writer(id, sink, rx, lifecycle, close_timeout));
    WriterHandle { tx }
}

async fn run_writer(
    id: ConnectionId,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    lifecycle: Arc<Lifecycle>,
    close_timeout: Duration,
) {
    // fires the closed-signal however this task ends
    let _closed = lifecycle.closed.clone().drop_guard();

    loop {
        let request = tokio::select! {
            biased;
            () = lifecycle.shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                // every handle is gone
                None => break,
            },
        };

        let result = tokio::select! {
            result = write_one(sink.as_mut(), request.payload) => result,
            () = lifecycle.shutdown.cancelled() => Err(ConnectionError::Closed),
        };
        if let Err(e) = &result {
            counter!(WS_WRITE_FAILURES_TOTAL).increment(1);
            debug!(connection_id = %id, error = %e, "write failed");
        }
        let _ = request.done.send(result);
    }

    rx.close();
    while let Ok(request) = rx.try_recv() {
        let _ = request.done.send(Err(ConnectionError::Closed));
    }

    match tokio::time::timeout(close_timeout, sink.close()).await {
        Ok(Ok(())) => debug!(connection_id = %id, "transport closed"),
        Ok(Err(e)) => debug!(connection_id = %id, error = %e, "transport close failed"),
        Err(_) => warn!(connection_id = %id, ?close_timeout, "transport close timed out"),
    }
    lifecycle.mark_closed();
}

async fn write_one(sink: &mut dyn FrameSink, payload: Payload) -> WriteResult {
    let frame = match payload {
        Payload::Message(message) => Frame::from(message.encode()?),
        Payload::Ping => Frame::Ping(Bytes::new()),
    };
    sink.send(frame).await?;
    Ok(())
}
