//! HTTP API server for local control (editor plugin or UI)
//!
//! This module provides a REST API over the voice note session:
//! - POST /session/{start,pause,resume,stop} - Lifecycle commands
//! - GET /session/status - Status snapshot
//! - GET /transcript - Buffer contents and the live draft span
//! - GET /account/balance, POST /account/redeem - Billing
//! - POST /account/login, POST /account/logout - Account switching
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ActionResponse, BalanceResponse, ErrorResponse, TranscriptResponse};
pub use routes::create_router;
pub use state::AppState;
