use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Default billing/auth service
pub const DEFAULT_BACKEND_URL: &str = "https://flymd.llingfei.com/asr";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub url: String,
}

/// Account balance plus the endpoints attached to it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingStatus {
    /// Null, missing or non-numeric reads as an empty balance
    #[serde(deserialize_with = "lenient_ms")]
    pub balance_ms: f64,
    /// Server-formatted minutes, preferred for display when present
    pub balance_min: Option<String>,
    /// Recognition gateway
    pub ws: Option<Endpoint>,
    /// Top-up page
    pub pay: Option<Endpoint>,
}

fn lenient_ms<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(if ms.is_finite() { ms } else { 0.0 })
}

impl BillingStatus {
    /// Gateway URL, if the service handed out a non-empty one
    pub fn gateway_url(&self) -> Option<&str> {
        self.ws
            .as_ref()
            .map(|e| e.url.trim())
            .filter(|url| !url.is_empty())
    }

    pub fn pay_url(&self) -> Option<&str> {
        self.pay
            .as_ref()
            .map(|e| e.url.trim())
            .filter(|url| !url.is_empty())
    }

    pub fn display_minutes(&self) -> String {
        match self.balance_min.as_deref().map(str::trim) {
            Some(min) if !min.is_empty() => min.to_string(),
            _ => format_balance_minutes(self.balance_ms),
        }
    }
}

/// Minutes with two decimals, trailing zeros trimmed ("1.5", "2", "0.25")
pub fn format_balance_minutes(balance_ms: f64) -> String {
    let minutes = if balance_ms.is_finite() {
        balance_ms / 60_000.0
    } else {
        0.0
    };
    let fixed = format!("{:.2}", minutes);
    fixed
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Status responses come either bare or wrapped as `{"billing": {...}}`
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusEnvelope {
    Wrapped { billing: BillingStatus },
    Bare(BillingStatus),
}

impl StatusEnvelope {
    fn into_status(self) -> BillingStatus {
        match self {
            StatusEnvelope::Wrapped { billing } => billing,
            StatusEnvelope::Bare(status) => status,
        }
    }
}

pub fn parse_status(value: Value) -> Result<BillingStatus> {
    let envelope: StatusEnvelope =
        serde_json::from_value(value).context("Malformed billing status")?;
    Ok(envelope.into_status())
}

/// Account and balance operations against the billing service
#[async_trait::async_trait]
pub trait BillingApi: Send + Sync {
    /// Verify a token; errors when it is no longer valid
    async fn me(&self, token: &str) -> Result<Value>;

    /// Returns a fresh session token
    async fn login(&self, username: &str, password: &str) -> Result<String>;

    async fn register(&self, username: &str, password: &str) -> Result<String>;

    async fn logout(&self, token: &str) -> Result<()>;

    async fn status(&self, token: &str) -> Result<BillingStatus>;

    /// Apply a top-up code; the response carries the new balance
    async fn redeem(&self, token: &str, code: &str) -> Result<BillingStatus>;
}

/// reqwest client for the billing/auth HTTP API
#[derive(Debug, Clone)]
pub struct HttpBillingClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBillingClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.http.request(method.clone(), &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if method != reqwest::Method::GET {
            request = request.json(&body.unwrap_or_else(|| json!({})));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = if text.is_empty() { "unknown" } else { &text };
            bail!("HTTP {}: {}", status.as_u16(), detail);
        }

        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text })))
    }

    async fn authenticate(&self, path: &str, username: &str, password: &str) -> Result<String> {
        let resp = self
            .call(
                reqwest::Method::POST,
                path,
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await?;

        let token = resp
            .get("token")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if token.is_empty() {
            bail!("Authentication response carried no token");
        }
        Ok(token.to_string())
    }
}

#[async_trait::async_trait]
impl BillingApi for HttpBillingClient {
    async fn me(&self, token: &str) -> Result<Value> {
        self.call(reqwest::Method::GET, "/api/auth/me/", Some(token), None)
            .await
    }

    async fn login(&self, username: &str, password: &str) -> Result<String> {
        self.authenticate("/api/auth/login/", username, password)
            .await
    }

    async fn register(&self, username: &str, password: &str) -> Result<String> {
        self.authenticate("/api/auth/register/", username, password)
            .await
    }

    async fn logout(&self, token: &str) -> Result<()> {
        self.call(reqwest::Method::POST, "/api/auth/logout/", Some(token), None)
            .await?;
        Ok(())
    }

    async fn status(&self, token: &str) -> Result<BillingStatus> {
        let value = self
            .call(reqwest::Method::GET, "/api/billing/status/", Some(token), None)
            .await?;
        parse_status(value)
    }

    async fn redeem(&self, token: &str, code: &str) -> Result<BillingStatus> {
        let value = self
            .call(
                reqwest::Method::POST,
                "/api/billing/redeem/",
                Some(token),
                Some(json!({ "token": code })),
            )
            .await?;
        parse_status(value)
    }
}
