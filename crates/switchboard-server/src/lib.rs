//! # switchboard-server
//!
//! Per-connection actors over WebSocket transports, plus the server that
//! accepts them.
//!
//! - Connection actor: serializing writer, read loop, heartbeat, typed dispatch
//!   with middleware, and an idempotent close protocol
//! - Registry of live connections with attribute lookup
//! - Axum HTTP server: upgrade endpoint, `/health`, `/metrics`
//! - Outbound dialer that wraps client connections in the same actor
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod client;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod upgrade;
pub mod websocket;

pub use server::SwitchboardServer;
pub use upgrade::{Admission, DefaultHooks, Rejection, SessionHooks, UpgradeRequest};
pub use websocket::connection::{CloseReason, Connection, ConnectionOptions, ConnectionState};
pub use websocket::handler::UpdateHandler;
pub use websocket::registry::Registry;
