use serde::{Deserialize, Serialize};
use tracing::debug;

/// Client metadata sent with the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub platform: String,
    pub ver: String,
    pub device: String,
    /// Present on reconnect attempts only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectInfo>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            platform: "desktop".to_string(),
            ver: env!("CARGO_PKG_VERSION").to_string(),
            device: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            reconnect: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectInfo {
    pub tries: u32,
    pub reason: String,
}

/// Recognizer options forwarded to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerOptions {
    pub language: String,
}

/// Control messages sent to the gateway as JSON text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Start {
        token: String,
        hold_ms: u64,
        client: ClientInfo,
        #[serde(rename = "volc")]
        recognizer: RecognizerOptions,
    },
    Ping {
        ts: i64,
    },
    Stop,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Messages received from the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ready,
    Pong,
    Partial {
        #[serde(default)]
        text: String,
    },
    Final {
        #[serde(default)]
        text: String,
    },
    Billing {
        #[serde(flatten)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
    End,
    Error {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame; anything that is not a tagged JSON object is dropped
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!("Ignoring unparseable gateway frame: {}", e);
                None
            }
        }
    }
}
