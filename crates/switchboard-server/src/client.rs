//! Outbound dialer.
//!
//! Dialed connections run on the same actor as accepted ones: handlers,
//! writes, heartbeats and close callbacks behave identically.

use switchboard_core::ConnectionId;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::debug;

use crate::transport::tungstenite::from_tungstenite;
use crate::websocket::connection::{Connection, ConnectionOptions};

/// Dialer errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request could not be built or the handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Dial `request` and wrap the socket in a connection with a fresh id.
///
/// Register handlers, then call
/// [`process_updates`](Connection::process_updates) to start reading.
pub async fn connect<R>(request: R, options: ConnectionOptions) -> Result<Connection, ClientError>
where
    R: IntoClientRequest + Unpin,
{
    connect_with_id(request, ConnectionId::new(), options).await
}

/// Dial `request` under a caller-chosen id.
pub async fn connect_with_id<R>(
    request: R,
    id: ConnectionId,
    options: ConnectionOptions,
) -> Result<Connection, ClientError>
where
    R: IntoClientRequest + Unpin,
{
    let (stream, response) = connect_async(request).await?;
    let remote_addr = match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };
    debug!(connection_id = %id, status = %response.status(), ?remote_addr, "dialed");
    Ok(Connection::new(id, from_tungstenite(stream, remote_addr), options))
}
