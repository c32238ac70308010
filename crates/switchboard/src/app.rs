//! Demo chat application.
//!
//! - `PING` → `PONG`
//! - `JOIN {room}` sets the `room` attribute and answers `JOINED`
//! - `SAY {text}` fans `SAID {from, text}` out to everyone in the sender's room
//!
//! Every client is greeted with a `client_id` update carrying its id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchboard_core::{ConnectionError, EmptyInput};
use switchboard_server::websocket::registry::fan_out;
use switchboard_server::{Admission, Connection, Rejection, SessionHooks, UpgradeRequest};
use tracing::debug;

/// Attribute holding the client's room.
const ROOM: &str = "room";

#[derive(Debug, Deserialize)]
struct Join {
    room: String,
}

#[derive(Debug, Deserialize)]
struct Say {
    text: String,
}

#[derive(Debug, Serialize)]
struct Said {
    from: String,
    text: String,
}

/// Session hooks for the demo.
pub struct ChatHooks;

#[async_trait]
impl SessionHooks for ChatHooks {
    async fn admit(&self, request: &UpgradeRequest) -> Result<Admission, Rejection> {
        let admission = Admission::default();
        Ok(match request.query(ROOM) {
            Some(room) if !room.is_empty() => admission.with_attribute(ROOM, room),
            _ => admission,
        })
    }

    async fn on_connection(&self, conn: &Connection) {
        register(conn);
        if let Err(e) = conn.write_update("client_id", conn.id().as_str().to_owned()).await {
            debug!(connection_id = %conn.id(), error = %e, "greeting not delivered");
        }
    }
}

fn register(conn: &Connection) {
    let this = conn.clone();
    conn.handle_update("PING", move |_: EmptyInput| {
        let this = this.clone();
        async move { this.write_update("PONG", ()).await }
    });

    let this = conn.clone();
    conn.handle_update("JOIN", move |join: Join| {
        let this = this.clone();
        async move {
            let _ = this.set_attribute(ROOM, join.room.clone());
            this.write_update("JOINED", join.room).await
        }
    });

    let this = conn.clone();
    conn.handle_update("SAY", move |say: Say| {
        let this = this.clone();
        async move { say_to_room(&this, say.text).await }
    });
}

async fn say_to_room(conn: &Connection, text: String) -> Result<(), ConnectionError> {
    let Some(room) = conn.attribute(ROOM) else {
        return conn.write_update("ERROR", "join a room first").await;
    };
    let Some(registry) = conn.registry() else {
        return conn.write_update("SAID", Said { from: conn.id().to_string(), text }).await;
    };
    let members = registry.find_by_attribute(ROOM, &room);
    let deliveries = fan_out(&members, "SAID", Said { from: conn.id().to_string(), text }).await?;
    let delivered = deliveries.iter().filter(|(_, result)| result.is_ok()).count();
    debug!(connection_id = %conn.id(), room = %room, delivered, "message relayed");
    Ok(())
}
