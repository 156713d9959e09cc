use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One hardware capture block, already reduced to its first channel
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Channel-0 samples in [-1, 1] (out-of-range values are clamped later)
    pub samples: Vec<f32>,
    /// Native sample rate of the device in Hz
    pub sample_rate: u32,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp_ms,
        }
    }

    /// Duration covered by this frame at its native rate
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Samples per delivered frame (the hardware block size)
    pub block_size: usize,
    /// Replay file sources at wall-clock speed
    pub realtime: bool,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            realtime: true,
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal default input device (feature `cpal-audio`)
/// - File: replay a WAV file (for demos and testing)
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames. The channel
    /// closes when the source is exhausted or the backend is stopped.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Creates a fresh backend for every capture segment
pub trait AudioBackendFactory: Send + Sync {
    fn create(&self, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>>;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default input device (requires the `cpal-audio` feature)
    Microphone,
    /// WAV file input
    File(PathBuf),
}

/// Factory over the built-in sources
pub struct DefaultBackendFactory {
    source: AudioSource,
}

impl DefaultBackendFactory {
    pub fn new(source: AudioSource) -> Self {
        Self { source }
    }
}

impl AudioBackendFactory for DefaultBackendFactory {
    fn create(&self, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        match &self.source {
            AudioSource::Microphone => {
                #[cfg(feature = "cpal-audio")]
                {
                    let backend = super::microphone::CpalBackend::new(config)?;
                    Ok(Box::new(backend))
                }

                #[cfg(not(feature = "cpal-audio"))]
                {
                    let _ = config;
                    anyhow::bail!("Microphone capture requires the `cpal-audio` feature")
                }
            }

            AudioSource::File(path) => Ok(Box::new(super::file::FileBackend::new(path, config))),
        }
    }
}
