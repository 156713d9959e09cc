use thiserror::Error;

use super::status::SessionState;

/// Failures surfaced by [`SessionController`](super::SessionController) operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("another session transition is in progress")]
    Busy,

    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("microphone is held by {owner}")]
    MicrophoneBusy { owner: String },

    #[error("not logged in")]
    NotAuthenticated,

    #[error("insufficient balance ({balance_ms} ms), please top up")]
    InsufficientBalance { balance_ms: f64 },

    #[error("gateway URL is empty, check the backend configuration")]
    MissingGateway,

    #[error("billing service error: {0}")]
    Billing(String),

    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("session controller is not running")]
    ControllerGone,
}
