use serde::{Deserialize, Serialize};

use crate::audio::{chunk_bytes, AudioBackendConfig, TARGET_SAMPLE_RATE};
use crate::transport::{ClientInfo, TransportSettings};

/// Configuration for a transcription session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Microphone owner id this feature registers under
    pub owner: String,

    /// Wire sample rate (the gateway expects 16kHz)
    pub sample_rate: u32,

    /// Duration of each audio chunk sent to the gateway
    /// Default: 200 ms, i.e. 6400 bytes at 16kHz mono 16-bit
    pub chunk_ms: u32,

    /// Samples per capture block
    pub block_size: usize,

    /// Replay file sources at wall-clock speed
    pub realtime: bool,

    pub transport: TransportSettings,

    /// Metadata sent in the handshake
    pub client: ClientInfo,
}

impl SessionConfig {
    pub fn chunk_bytes(&self) -> usize {
        chunk_bytes(self.sample_rate, self.chunk_ms)
    }

    pub fn backend_config(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            block_size: self.block_size,
            realtime: self.realtime,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            owner: "asr-note".to_string(),
            sample_rate: TARGET_SAMPLE_RATE,
            chunk_ms: 200,
            block_size: 4096,
            realtime: true,
            transport: TransportSettings::default(),
            client: ClientInfo::default(),
        }
    }
}
