//! Microphone capture on the default input device via cpal

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};

/// cpal streams are not `Send`; the stream is only touched behind the mutex
/// from start/stop.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Collects channel 0 of interleaved device data into fixed-size blocks
struct BlockAssembler {
    channels: usize,
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    started: Instant,
    tx: mpsc::Sender<AudioFrame>,
}

impl BlockAssembler {
    fn push(&mut self, interleaved: impl Iterator<Item = f32>) {
        for sample in interleaved.step_by(self.channels) {
            self.pending.push(sample);
            if self.pending.len() == self.block_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                let frame = AudioFrame::new(
                    samples,
                    self.sample_rate,
                    self.started.elapsed().as_millis() as u64,
                );
                if self.tx.try_send(frame).is_err() {
                    warn!("Capture consumer is behind, dropping a block");
                }
            }
        }
    }
}

pub struct CpalBackend {
    config: AudioBackendConfig,
    device: cpal::Device,
    stream: Mutex<Option<SendableStream>>,
    capturing: Arc<AtomicBool>,
}

impl CpalBackend {
    pub fn new(config: AudioBackendConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No default input device"))?;

        Ok(Self {
            config,
            device,
            stream: Mutex::new(None),
            capturing: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait::async_trait]
impl AudioBackend for CpalBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        let supported = self
            .device
            .default_input_config()
            .context("Failed to query default input config")?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels().max(1) as usize;
        let stream_config = supported.config();
        let (tx, rx) = mpsc::channel(64);

        let mut assembler = BlockAssembler {
            channels,
            block_size: self.config.block_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(self.config.block_size),
            started: Instant::now(),
            tx,
        };

        let err_callback = |err| error!("Audio stream error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.push(data.iter().copied());
                },
                err_callback,
                None,
            ),
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    assembler.push(data.iter().map(|&s| s as f32 / 32768.0));
                },
                err_callback,
                None,
            ),
            other => return Err(anyhow!("Unsupported sample format: {:?}", other)),
        }
        .context("Failed to build input stream")?;

        stream.play().context("Failed to start input stream")?;
        info!(
            "Microphone capture started: {}Hz, {} channels",
            sample_rate, channels
        );

        if let Ok(mut slot) = self.stream.lock() {
            *slot = Some(SendableStream(stream));
        }
        self.capturing.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Ok(mut slot) = self.stream.lock() {
            // Dropping the stream stops the device callback
            slot.take();
        }
        self.capturing.store(false, Ordering::SeqCst);
        info!("Microphone capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "microphone"
    }
}
