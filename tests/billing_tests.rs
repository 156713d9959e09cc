// Integration tests for the billing/auth HTTP client
//
// A small axum app on a loopback port stands in for the billing service.

use anyhow::Result;
use asr_note::billing::{
    AuthProvider, BillingApi, Credentials, HttpBillingClient, LoginMode, StaticLogin, TokenAuth,
    TokenStore,
};
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type CallLog = Arc<Mutex<Vec<String>>>;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "invalid token"})),
    )
        .into_response()
}

async fn me(State(log): State<CallLog>, headers: HeaderMap) -> Response {
    log.lock().unwrap().push("me".to_string());
    match bearer(&headers) {
        Some("good") => Json(json!({"username": "alice"})).into_response(),
        _ => unauthorized(),
    }
}

async fn login(State(log): State<CallLog>, Json(body): Json<Value>) -> Response {
    log.lock().unwrap().push("login".to_string());
    if body["username"] == "alice" && body["password"] == "secret1" {
        Json(json!({"token": "good"})).into_response()
    } else {
        (StatusCode::BAD_REQUEST, "wrong username or password").into_response()
    }
}

async fn register(State(log): State<CallLog>, Json(body): Json<Value>) -> Response {
    log.lock().unwrap().push(format!("register:{}", body["username"].as_str().unwrap_or("")));
    Json(json!({"token": "good"})).into_response()
}

async fn logout(State(log): State<CallLog>, headers: HeaderMap) -> Response {
    log.lock()
        .unwrap()
        .push(format!("logout:{}", bearer(&headers).unwrap_or("")));
    // Not JSON on purpose
    "bye".into_response()
}

async fn status(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some("good") => Json(json!({
            "billing": {
                "balance_ms": 90000,
                "balance_min": "1.5",
                "ws": {"url": "wss://gw.test/asr"},
                "pay": {"url": "https://pay.test"}
            }
        }))
        .into_response(),
        Some("spent") => Json(json!({
            "billing": {"balance_ms": null, "ws": {"url": "wss://gw.test/asr"}}
        }))
        .into_response(),
        _ => unauthorized(),
    }
}

async fn redeem(
    State(log): State<CallLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if bearer(&headers) != Some("good") {
        return unauthorized();
    }
    let code = body["token"].as_str().unwrap_or("").to_string();
    log.lock().unwrap().push(format!("redeem:{}", code));
    if code == "TOPUP-60" {
        Json(json!({"balance_ms": 150000, "ws": {"url": "wss://gw.test/asr"}})).into_response()
    } else {
        (StatusCode::BAD_REQUEST, Json(json!({"detail": "invalid code"}))).into_response()
    }
}

/// Returns the base URL (with a trailing slash) and the call log
async fn spawn_backend() -> Result<(String, CallLog)> {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    let api = Router::new()
        .route("/api/auth/me/", get(me))
        .route("/api/auth/login/", post(login))
        .route("/api/auth/register/", post(register))
        .route("/api/auth/logout/", post(logout))
        .route("/api/billing/status/", get(status))
        .route("/api/billing/redeem/", post(redeem))
        .with_state(Arc::clone(&log));
    let app = Router::new().nest("/asr", api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok((format!("http://{}/asr/", addr), log))
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn test_status_unwraps_billing_envelope() -> Result<()> {
    let (base, _) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);
    assert!(!client.base_url().ends_with('/'));

    let status = client.status("good").await?;
    assert_eq!(status.balance_ms, 90000.0);
    assert_eq!(status.display_minutes(), "1.5");
    assert_eq!(status.gateway_url(), Some("wss://gw.test/asr"));
    assert_eq!(status.pay_url(), Some("https://pay.test"));

    Ok(())
}

#[tokio::test]
async fn test_null_balance_is_empty_not_malformed() -> Result<()> {
    let (base, _) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);

    let status = client.status("spent").await?;
    assert_eq!(status.balance_ms, 0.0);
    assert_eq!(status.gateway_url(), Some("wss://gw.test/asr"));

    Ok(())
}

#[tokio::test]
async fn test_error_status_carries_code_and_body() -> Result<()> {
    let (base, _) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);

    let err = client.status("expired").await.unwrap_err().to_string();
    assert!(err.contains("HTTP 401"), "got {}", err);
    assert!(err.contains("invalid token"), "got {}", err);

    Ok(())
}

#[tokio::test]
async fn test_login_and_register() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);

    assert_eq!(client.login("alice", "secret1").await?, "good");
    let err = client.login("alice", "nope").await.unwrap_err().to_string();
    assert!(err.contains("HTTP 400"));
    assert!(err.contains("wrong username or password"));

    assert_eq!(client.register("bob", "secret2").await?, "good");
    assert_eq!(calls(&log), vec!["login", "login", "register:bob"]);

    Ok(())
}

#[tokio::test]
async fn test_redeem_sends_code_as_token_field() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);

    let status = client.redeem("good", "TOPUP-60").await?;
    assert_eq!(status.balance_ms, 150000.0);
    assert_eq!(status.display_minutes(), "2.5");

    assert!(client.redeem("good", "USED").await.is_err());
    assert_eq!(calls(&log), vec!["redeem:TOPUP-60", "redeem:USED"]);

    Ok(())
}

#[tokio::test]
async fn test_logout_accepts_non_json_response() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let client = HttpBillingClient::new(&base);

    client.logout("good").await?;
    assert_eq!(calls(&log), vec!["logout:good"]);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_service_is_an_error() {
    let client = HttpBillingClient::new("http://127.0.0.1:1/asr");
    assert!(client.status("good").await.is_err());
}

fn auth(base: &str, store: TokenStore, creds: Option<Credentials>) -> TokenAuth {
    let api: Arc<dyn BillingApi> = Arc::new(HttpBillingClient::new(base));
    TokenAuth::new(api, store, Box::new(StaticLogin::new(creds)))
}

#[tokio::test]
async fn test_valid_cached_token_is_reused() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let auth = auth(&base, TokenStore::in_memory(Some("good".to_string())), None);

    assert_eq!(auth.ensure_token().await?, Some("good".to_string()));
    assert_eq!(calls(&log), vec!["me"]);

    Ok(())
}

#[tokio::test]
async fn test_stale_token_replaced_by_login() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let dir = TempDir::new()?;
    let path = dir.path().join("account.json");
    std::fs::write(&path, r#"{"token": "stale", "username": "alice"}"#)?;

    let auth = auth(
        &base,
        TokenStore::load(&path)?,
        Some(Credentials::new(LoginMode::Login, "alice", "secret1")),
    );

    assert_eq!(auth.ensure_token().await?, Some("good".to_string()));
    assert_eq!(calls(&log), vec!["me", "login"]);

    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(saved["token"], "good");
    assert_eq!(saved["username"], "alice");

    Ok(())
}

#[tokio::test]
async fn test_invalid_credentials_rejected_locally() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let auth = auth(
        &base,
        TokenStore::in_memory(None),
        Some(Credentials::new(LoginMode::Login, "al", "secret1")),
    );

    let err = auth.ensure_token().await.unwrap_err().to_string();
    assert!(err.contains("3-32"));
    assert!(calls(&log).is_empty(), "nothing should reach the service");

    Ok(())
}

#[tokio::test]
async fn test_no_token_and_no_credentials() -> Result<()> {
    let (base, _) = spawn_backend().await?;
    let auth = auth(&base, TokenStore::in_memory(None), None);

    assert_eq!(auth.ensure_token().await?, None);

    Ok(())
}

#[tokio::test]
async fn test_switch_account_logs_in_again() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let auth = auth(
        &base,
        TokenStore::in_memory(Some("good".to_string())),
        Some(Credentials::new(LoginMode::Register, "carol", "secret3")),
    );

    assert_eq!(auth.switch_account().await?, Some("good".to_string()));
    assert_eq!(calls(&log), vec!["register:carol"]);

    Ok(())
}

#[tokio::test]
async fn test_logout_forgets_account() -> Result<()> {
    let (base, log) = spawn_backend().await?;
    let dir = TempDir::new()?;
    let path = dir.path().join("nested").join("account.json");

    let auth = auth(
        &base,
        TokenStore::load(&path)?,
        Some(Credentials::new(LoginMode::Login, "alice", "secret1")),
    );
    auth.ensure_token().await?;
    assert!(path.exists(), "login persists the account");

    auth.logout().await?;
    assert_eq!(auth.cached_token().await, None);
    assert_eq!(calls(&log), vec!["login", "logout:good"]);

    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(saved["token"], "");

    Ok(())
}
