//! Cardforge Protocol
//!
//! Shared types for communication between the Cardforge server and clients.
//! Server events are serialized as JSON over WebSocket; the inbound side of
//! the channel carries plain UTF-8 text prompts, so only server messages
//! and card records live here.

use uuid::Uuid;

pub mod server;
pub mod types;

pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique session ID.
///
/// Session IDs double as keys into the process-wide artifact store, so they
/// must be unguessable.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
