//! PCM16 and transport-text conversion.
//!
//! Pure functions: linear f32 samples <-> 16-bit little-endian PCM, and binary
//! buffers <-> base64 text for JSON frames.

use crate::error::CodecError;
use base64::Engine;

/// Encode f32 samples to PCM16 LE. Samples are clamped to [-1, 1]; negative values
/// scale by 0x8000 and non-negative by 0x7FFF so both rails are reachable.
pub fn encode_float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = if s < 0.0 {
            (s * 32768.0).round() as i16
        } else {
            (s * 32767.0).round() as i16
        };
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode PCM16 LE into f32 samples. Inverse of [`encode_float_to_pcm16`] up to
/// 16-bit quantization.
pub fn decode_pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            if value < 0 {
                value as f32 / 32768.0
            } else {
                value as f32 / 32767.0
            }
        })
        .collect())
}

/// Binary -> base64 text for embedding in JSON frames.
pub fn bytes_to_transport_text(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Base64 text -> binary.
pub fn transport_text_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| CodecError::InvalidTransportText(e.to_string()))
}
