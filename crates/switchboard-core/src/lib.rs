//! # switchboard-core
//!
//! Shared vocabulary for the switchboard connection layer:
//!
//! - **Connection IDs**: [`ConnectionId`] newtype, UUID v7 by default
//! - **Envelope**: [`Update`] (inbound `{type, data, extra}`) and [`ServerUpdate`] (outbound)
//! - **Outbound messages**: [`OutboundMessage`] with text, binary, binary-as-text and JSON variants
//! - **Errors**: [`ConnectionError`] taxonomy, [`UpdateError`] reports, [`TransportError`]
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;
pub mod update;

pub use errors::{BoxError, ConnectionError, ErrorCategory, TransportError, UpdateError};
pub use ids::ConnectionId;
pub use message::{FrameKind, JsonPayload, OutboundFrame, OutboundMessage};
pub use update::{EmptyInput, ServerUpdate, Update};
