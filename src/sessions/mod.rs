//! Live SSH sessions: the in-memory registry, the lifecycle manager, and
//! the event frames fanned out to chat peers.

use serde::Serialize;

pub mod manager;
pub mod registry;

pub use manager::SessionManager;
pub use registry::{LiveSession, SessionRegistry};

/// Frames broadcast to every WebSocket peer of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Message {
        role: &'static str,
        text: String,
    },
    Status {
        status: &'static str,
    },
    SessionClosed {
        reason: String,
        message: String,
    },
}

/// Termination-reason tags recorded on the lease and surfaced to peers.
pub mod reason {
    pub const USER_REQUEST: &str = "user_request";
    pub const CREDIT_EXHAUSTED: &str = "credit_exhausted";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    pub const KEY_REVOKED: &str = "key_revoked";
    pub const STALE_RECONCILED: &str = "stale_reconciled";
    pub const LAUNCH_FAILED: &str = "launch_failed";
    pub const SHUTDOWN: &str = "shutdown";
}
