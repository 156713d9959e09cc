use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};

/// A WAV file decoded to channel-0 float samples
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read audio samples")?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()
                    .context("Failed to read audio samples")?
            }
        };

        // Keep the first channel only, like the live capture path
        let samples: Vec<f32> = interleaved.iter().step_by(channels).copied().collect();
        let duration_seconds = samples.len() as f64 / spec.sample_rate.max(1) as f64;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Split into capture-sized frames
    pub fn frames(&self, block_size: usize) -> Vec<AudioFrame> {
        let block_size = block_size.max(1);
        self.samples
            .chunks(block_size)
            .enumerate()
            .map(|(i, block)| {
                let timestamp_ms =
                    (i * block_size) as u64 * 1000 / self.sample_rate.max(1) as u64;
                AudioFrame::new(block.to_vec(), self.sample_rate, timestamp_ms)
            })
            .collect()
    }
}

/// Replays a WAV file as if it were a microphone
pub struct FileBackend {
    path: PathBuf,
    config: AudioBackendConfig,
    capturing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>, config: AudioBackendConfig) -> Self {
        Self {
            path: path.into(),
            config,
            capturing: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        let file = AudioFile::open(&self.path)?;
        let frames = file.frames(self.config.block_size);
        let realtime = self.config.realtime;
        let capturing = Arc::clone(&self.capturing);
        let (tx, rx) = mpsc::channel(32);

        capturing.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(async move {
            for frame in frames {
                if !capturing.load(Ordering::SeqCst) {
                    break;
                }
                let pace = Duration::from_millis(frame.duration_ms());
                if tx.send(frame).await.is_err() {
                    break;
                }
                if realtime {
                    tokio::time::sleep(pace).await;
                }
            }
            capturing.store(false, Ordering::SeqCst);
            debug!("File replay finished");
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "file"
    }
}
