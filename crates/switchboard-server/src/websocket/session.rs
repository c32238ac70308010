//! Server-side session: one upgraded socket from registration to close.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::ws::WebSocket;
use metrics::{counter, gauge, histogram};
use switchboard_core::ConnectionId;
use tracing::{Span, field, info, instrument, warn};

use super::connection::{CloseReason, Connection};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;
use crate::transport::axum::from_axum;
use crate::upgrade::{Admission, SlotGuard};

/// Everything an accepted upgrade carries into its session.
pub(crate) struct Session {
    pub(crate) state: AppState,
    pub(crate) admission: Admission,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) slot: SlotGuard,
}

/// Run one connection until it closes.
///
/// 1. Builds the connection and applies the admitted attributes
/// 2. Registers it, closing any connection it displaces
/// 3. Closes it when the server shuts down
/// 4. Hands it to [`SessionHooks::on_connection`](crate::SessionHooks::on_connection)
/// 5. Processes updates until close
#[instrument(skip_all, fields(connection_id = field::Empty))]
pub(crate) async fn run_session(socket: WebSocket, session: Session) {
    let Session {
        state,
        admission,
        remote_addr,
        slot: _slot,
    } = session;
    let Admission { id, attributes } = admission;

    let id = ConnectionId::from_supplied(id);
    let _ = Span::current().record("connection_id", field::display(&id));
    let conn = Connection::new(id, from_axum(socket, remote_addr), state.options.clone());
    for (key, value) in attributes {
        let _ = conn.set_attribute(key, value);
    }

    let started = Instant::now();
    info!(?remote_addr, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if let Some(registry) = &state.registry {
        match registry.insert(&conn) {
            Ok(Some(displaced)) => {
                info!("replacing connection with the same id");
                let _ = tokio::spawn(async move { displaced.close_with(CloseReason::Replaced).await });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "connection not registered"),
        }
    }

    let token = state.shutdown.token();
    let watcher = conn.clone();
    let _ = tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => watcher.close_with(CloseReason::Shutdown).await,
            () = watcher.closed() => {}
        }
    });

    state.hooks.on_connection(&conn).await;

    let reason = match conn.process_updates().await {
        Ok(reason) => reason,
        Err(e) => {
            // the setup hook already started processing
            warn!(error = %e, "update processing not started");
            conn.closed().await;
            conn.close_reason().unwrap_or(CloseReason::Local)
        }
    };

    let elapsed = started.elapsed();
    info!(%reason, duration_secs = elapsed.as_secs_f64(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.label()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(elapsed.as_secs_f64());
}
