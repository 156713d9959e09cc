use super::state::AppState;
use crate::billing::BillingStatus;
use crate::session::{SessionError, SessionStatus};
use crate::transcript::{DraftSpan, TextBuffer};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptResponse {
    pub text: String,
    pub cursor: usize,
    pub draft: Option<DraftSpan>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance_ms: f64,
    /// Display string, e.g. "12.5"
    pub balance_min: String,
    pub pay_url: Option<String>,
}

impl From<BillingStatus> for BalanceResponse {
    fn from(status: BillingStatus) -> Self {
        Self {
            balance_ms: status.balance_ms,
            balance_min: status.display_minutes(),
            pay_url: status.pay_url().map(str::to_string),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Session errors rendered as JSON with a matching status code
pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            SessionError::AlreadyActive
            | SessionError::Busy
            | SessionError::InvalidState { .. }
            | SessionError::MicrophoneBusy { .. } => StatusCode::CONFLICT,
            SessionError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            SessionError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            SessionError::MissingGateway | SessionError::Billing(_) => StatusCode::BAD_GATEWAY,
            SessionError::Capture(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
        };
        warn!("Request failed: {}", self.0);

        (
            code,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn action(state: &AppState, message: &str) -> Json<ActionResponse> {
    Json(ActionResponse {
        status: state.controller.status(),
        message: message.to_string(),
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/start
pub async fn start_session(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    info!("HTTP start requested");
    state.controller.start().await?;
    Ok(action(&state, "Voice note started"))
}

/// POST /session/pause
pub async fn pause_session(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.controller.pause().await?;
    Ok(action(&state, "Pausing"))
}

/// POST /session/resume
pub async fn resume_session(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.controller.resume().await?;
    Ok(action(&state, "Voice note resumed"))
}

/// POST /session/stop
pub async fn stop_session(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.controller.stop().await?;
    Ok(action(&state, "Stopping"))
}

/// GET /session/status
pub async fn get_status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.controller.status())
}

/// GET /transcript
pub async fn get_transcript(State(state): State<AppState>) -> Json<TranscriptResponse> {
    let draft = state.controller.status().draft;
    let buffer = state.buffer.lock().await;
    Json(TranscriptResponse {
        text: buffer.text().to_string(),
        cursor: buffer.cursor_position(),
        draft,
    })
}

/// GET /account/balance
pub async fn get_balance(
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let status = state.controller.balance().await?;
    Ok(Json(status.into()))
}

/// POST /account/redeem
pub async fn redeem(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> Response {
    if req.code.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Redeem code is empty".to_string(),
            }),
        )
            .into_response();
    }

    match state.controller.redeem(&req.code).await {
        Ok(status) => Json(BalanceResponse::from(status)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// POST /account/login
/// Forget the cached token and log in again
pub async fn switch_account(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.controller.switch_account().await?;
    Ok(action(&state, "Logged in"))
}

/// POST /account/logout
pub async fn logout(State(state): State<AppState>) -> Result<Json<ActionResponse>, ApiError> {
    state.controller.logout().await?;
    Ok(action(&state, "Logged out"))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
