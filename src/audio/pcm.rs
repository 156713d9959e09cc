//! Float capture blocks to 16-bit PCM at the gateway rate
//!
//! The resampler is plain linear interpolation between neighbouring samples
//! and the quantizer scales negative values by 32768 and non-negative values
//! by 32767. Both must stay bit-exact with what the gateway was tuned on.

use super::backend::AudioFrame;

/// Sample rate the gateway expects
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Quantize one sample, clamping to [-1, 1] first
#[inline]
pub fn quantize(sample: f64) -> i16 {
    let v = sample.clamp(-1.0, 1.0);
    if v < 0.0 {
        (v * 32768.0) as i16
    } else {
        (v * 32767.0) as i16
    }
}

/// Quantize a block without resampling
pub fn float_to_i16(src: &[f32]) -> Vec<i16> {
    src.iter().map(|&s| quantize(s as f64)).collect()
}

/// Resample `src` from `src_rate` to `target_rate` and quantize
///
/// A zero rate is treated as already being at the target rate.
pub fn resample_to_i16(src: &[f32], src_rate: u32, target_rate: u32) -> Vec<i16> {
    let in_rate = if src_rate == 0 { target_rate } else { src_rate };
    if in_rate == target_rate {
        return float_to_i16(src);
    }
    if src.is_empty() {
        return Vec::new();
    }

    let ratio = in_rate as f64 / target_rate as f64;
    let out_len = (src.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;
        let s1 = src.get(idx).copied().unwrap_or(0.0) as f64;
        let s2 = src.get(idx + 1).map(|&s| s as f64).unwrap_or(s1);
        out.push(quantize(s1 + (s2 - s1) * frac));
    }

    out
}

/// Little-endian byte view of PCM samples
pub fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Converts capture frames to wire-ready PCM bytes
///
/// Stateless: every frame is converted and handed on immediately.
#[derive(Debug, Clone, Copy)]
pub struct CapturePipeline {
    target_rate: u32,
}

impl CapturePipeline {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn encode(&self, frame: &AudioFrame) -> Vec<u8> {
        let pcm = resample_to_i16(&frame.samples, frame.sample_rate, self.target_rate);
        to_le_bytes(&pcm)
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new(TARGET_SAMPLE_RATE)
    }
}
