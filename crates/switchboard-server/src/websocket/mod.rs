//! Connection actor, dispatch, and the registry of live connections.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub(crate) mod reader;
pub(crate) mod session;
pub(crate) mod writer;
