pub mod backend;
pub mod chunk;
pub mod file;
pub mod mic;
pub mod pcm;

#[cfg(feature = "cpal-audio")]
pub mod microphone;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource,
    DefaultBackendFactory,
};
pub use chunk::{chunk_bytes, ChunkQueue};
pub use file::{AudioFile, FileBackend};
pub use mic::{MicArbiter, MicError, MicLease};
pub use pcm::{CapturePipeline, TARGET_SAMPLE_RATE};
