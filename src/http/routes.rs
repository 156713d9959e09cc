use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Session control
        .route("/session/start", post(handlers::start_session))
        .route("/session/pause", post(handlers::pause_session))
        .route("/session/resume", post(handlers::resume_session))
        .route("/session/stop", post(handlers::stop_session))
        .route("/session/status", get(handlers::get_status))
        .route("/transcript", get(handlers::get_transcript))
        // Account
        .route("/account/balance", get(handlers::get_balance))
        .route("/account/redeem", post(handlers::redeem))
        .route("/account/login", post(handlers::switch_account))
        .route("/account/logout", post(handlers::logout))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
