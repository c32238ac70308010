//! Heartbeat liveness probes.
//!
//! The probe side only sends pings. Detection of a dead peer is the read
//! loop's job: every inbound frame, pongs included, restarts its deadline.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::writer::{Payload, WriterHandle};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The connection shut down.
    Cancelled,
    /// A ping could not be written.
    ProbeFailed,
}

/// Probe interval for a given keepalive window.
///
/// Pinging twice per window leaves the pong a full half-window to arrive
/// before the read deadline expires.
pub fn probe_interval(keepalive: Duration) -> Duration {
    (keepalive / 2).max(Duration::from_millis(1))
}

/// Send a ping through the writer every `interval` until cancelled.
pub(crate) async fn run_heartbeat(
    writer: WriterHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if writer.submit(Payload::Ping).await.is_err() {
                    return HeartbeatResult::ProbeFailed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
