//! Sample-format and transport-encoding helpers.
//!
//! Both remote services speak little-endian 16-bit PCM wrapped in base64;
//! sample rate and channel count are always known from configuration, so
//! nothing here sniffs formats.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::buffer::AudioBuffer;
use crate::error::{AudioError, Result};

/// Convert f32 samples to i16, clamping to [-1.0, 1.0].
///
/// Negative values scale by 32768 and positive ones by 32767 so both ends
/// of the range map onto i16::MIN / i16::MAX exactly.
pub fn float_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

pub fn i16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Odd byte counts are a decode error; PCM16 frames are never split.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Decode raw PCM16LE bytes into a playable buffer.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(AudioError::Decode(format!(
            "invalid format: {}Hz/{}ch",
            sample_rate, channels
        )));
    }
    let pcm = bytes_to_pcm16(bytes)?;
    if pcm.len() % channels as usize != 0 {
        return Err(AudioError::Decode(format!(
            "{} samples do not divide into {} channels",
            pcm.len(),
            channels
        )));
    }
    Ok(AudioBuffer::new(i16_to_float(&pcm), sample_rate, channels))
}

/// Stretch `input` to exactly `out_len` samples by linear interpolation.
/// Positions advance by `input.len() / out_len` from the first sample, so
/// consecutive chunks of a stream line up.
pub fn resample_linear(input: &[f32], out_len: usize) -> Vec<f32> {
    if input.is_empty() {
        return vec![0.0; out_len];
    }
    if input.len() == out_len {
        return input.to_vec();
    }
    let step = input.len() as f64 / out_len as f64;
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return input[last];
            }
            let frac = (pos - idx as f64) as f32;
            input[idx] + (input[idx + 1] - input[idx]) * frac
        })
        .collect()
}

/// Microphone window → base64 text ready for a realtime-input frame.
pub fn encode_capture_frame(samples: &[f32]) -> String {
    encode_base64(&pcm16_to_bytes(&float_to_i16(samples)))
}

/// base64 reply payload → playable buffer.
pub fn decode_transport_audio(text: &str, sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    let bytes = decode_base64(text)?;
    if bytes.is_empty() {
        return Err(AudioError::Decode("empty audio payload".into()));
    }
    decode_pcm16(&bytes, sample_rate, channels)
}
