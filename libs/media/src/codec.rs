//! Float <-> 16-bit PCM conversion for the wire format.
//!
//! All functions are pure and length preserving. Negative samples use the
//! full 32768 magnitude and positive ones 32767, so both ends of the
//! fixed-point range are reachable.

use crate::error::{MediaError, MediaResult};
use shared_proto::wire::BYTES_PER_SAMPLE;

const NEG_FULL_SCALE: f32 = 32768.0;
const POS_FULL_SCALE: f32 = 32767.0;

/// Largest round-trip error for any sample in [-1, 1].
pub const QUANTIZATION_STEP: f32 = 1.0 / POS_FULL_SCALE;

pub fn encode_sample(sample: f32) -> i16 {
    // NaN would otherwise survive clamp
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 {
        s * NEG_FULL_SCALE
    } else {
        s * POS_FULL_SCALE
    };
    scaled.round() as i16
}

pub fn decode_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEG_FULL_SCALE
    } else {
        sample as f32 / POS_FULL_SCALE
    }
}

/// Convert a captured float block into wire samples.
pub fn encode(block: &[f32]) -> Vec<i16> {
    block.iter().map(|&s| encode_sample(s)).collect()
}

/// Convert wire samples back into a float block for rendering.
pub fn decode(block: &[i16]) -> Vec<f32> {
    block.iter().map(|&s| decode_sample(s)).collect()
}

/// Serialize samples as little-endian bytes, one message payload.
pub fn to_wire(block: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(block.len() * BYTES_PER_SAMPLE);
    for sample in block {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Parse a message payload into samples. Odd lengths cannot be PCM16.
pub fn from_wire(payload: &[u8]) -> MediaResult<Vec<i16>> {
    if payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(MediaError::MalformedFrame(format!(
            "payload of {} bytes is not a whole number of 16-bit samples",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
