use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::transcript::DraftSpan;
use crate::transport::LinkState;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Ending,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// What an in-flight ending resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndingReason {
    #[default]
    None,
    Pause,
    Stop,
}

/// Snapshot for UI reflection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,

    pub state: SessionState,

    pub ending: EndingReason,

    /// Connection state of the current segment, if one is open
    pub link: Option<LinkState>,

    /// Consecutive reconnect attempts since the last `ready`
    pub reconnect_attempts: u32,

    /// When the session was first started (survives pause/resume)
    pub started_at: Option<DateTime<Utc>>,

    /// Milliseconds since `started_at`, filled in when read
    pub elapsed_ms: Option<i64>,

    pub draft: Option<DraftSpan>,

    /// Current microphone holder, which may be another feature
    pub mic_owner: Option<String>,
}

impl SessionStatus {
    /// Running or paused, i.e. account changes must wait
    pub fn is_active(&self) -> bool {
        self.state != SessionState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Ok,
    Error,
}

/// Broadcast to subscribers as the session progresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Notice { level: NoticeLevel, message: String },
    StateChanged { state: SessionState },
    Transcript { text: String, is_final: bool },
    Billing { fields: serde_json::Value },
    /// The audio source ran dry (file replay finished)
    CaptureEnded,
}

impl SessionEvent {
    pub fn ok(message: impl Into<String>) -> Self {
        SessionEvent::Notice {
            level: NoticeLevel::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SessionEvent::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
