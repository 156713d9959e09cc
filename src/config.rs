use anyhow::{Context, Result};
use serde::Deserialize;

use crate::billing::DEFAULT_BACKEND_URL;
use crate::session::SessionConfig;
use crate::transport::{ClientInfo, TransportSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub transport: TransportSettings,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Billing/auth service base URL
    pub backend_url: String,
    /// Microphone owner id
    pub owner: String,
    /// Where the account token is kept between runs
    pub account_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_ms: u32,
    pub block_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Config {
    /// Load defaults, then `path` if given (TOML, extension optional), then
    /// `ASR_NOTE__SECTION__KEY` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let transport = TransportSettings::default();

        let mut builder = config::Config::builder()
            .set_default("service.name", "asr-note")?
            .set_default("service.backend_url", DEFAULT_BACKEND_URL)?
            .set_default("service.owner", "asr-note")?
            .set_default("audio.sample_rate", 16000)?
            .set_default("audio.chunk_ms", 200)?
            .set_default("audio.block_size", 4096)?
            .set_default(
                "transport.keepalive_interval_ms",
                transport.keepalive_interval_ms as i64,
            )?
            .set_default("transport.pong_timeout_ms", transport.pong_timeout_ms as i64)?
            .set_default("transport.reconnect_base_ms", transport.reconnect_base_ms as i64)?
            .set_default("transport.reconnect_cap_ms", transport.reconnect_cap_ms as i64)?
            .set_default(
                "transport.max_reconnect_attempts",
                transport.max_reconnect_attempts as i64,
            )?
            .set_default("transport.stop_grace_ms", transport.stop_grace_ms as i64)?
            .set_default("transport.hold_ms", transport.hold_ms as i64)?
            .set_default("transport.language", transport.language)?
            .set_default("http.bind", "127.0.0.1")?
            .set_default("http.port", 7788)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("ASR_NOTE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        Ok(settings.try_deserialize()?)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            owner: self.service.owner.clone(),
            sample_rate: self.audio.sample_rate,
            chunk_ms: self.audio.chunk_ms,
            block_size: self.audio.block_size,
            realtime: true,
            transport: self.transport.clone(),
            client: ClientInfo::default(),
        }
    }
}
