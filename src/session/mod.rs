//! Voice note session management
//!
//! This module provides the `SessionController` that orchestrates:
//! - Account checks (token, balance, gateway URL)
//! - Microphone ownership and audio capture
//! - The gateway connection and its reconnect/keepalive timers
//! - Writing transcript text into the host buffer
//! - Status and event reflection for a UI

mod config;
mod controller;
mod error;
mod status;
mod timer;

pub use config::SessionConfig;
pub use controller::{SessionController, SessionDeps};
pub use error::SessionError;
pub use status::{EndingReason, NoticeLevel, SessionEvent, SessionState, SessionStatus};
pub use timer::{TimerHandle, Timers};
