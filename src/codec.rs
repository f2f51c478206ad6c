//! Conversion between float samples, 16-bit little-endian PCM bytes and the
//! base64 transport encoding used on the session channel.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Bytes per 16-bit PCM sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Encode float samples as 16-bit little-endian PCM.
///
/// Samples are clamped to [-1.0, 1.0]. Negative values scale by 32768 and
/// non-negative values by 32767, truncating toward zero. NaN encodes as 0.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    bytes
}

fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    // `as` truncates toward zero and saturates at the i16 bounds
    scaled as i16
}

/// Decode 16-bit little-endian PCM into float samples.
///
/// For multi-channel input the samples stay interleaved. A trailing partial
/// frame (fewer than `2 * channel_count` bytes) is dropped.
pub fn decode(bytes: &[u8], _sample_rate: u32, channel_count: u16) -> Vec<f32> {
    let frame_bytes = BYTES_PER_SAMPLE * usize::from(channel_count.max(1));
    let usable = bytes.len() - bytes.len() % frame_bytes;
    bytes[..usable]
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Number of bytes a decode would drop for the given channel layout.
pub fn trailing_bytes(len: usize, channel_count: u16) -> usize {
    len % (BYTES_PER_SAMPLE * usize::from(channel_count.max(1)))
}

/// Transport-encode raw bytes.
pub fn to_transport(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a transport string back into raw bytes.
pub fn from_transport(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// An encoded frame ready to send: the PCM bytes and their transport form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub pcm: Vec<u8>,
    pub data: String,
}

impl EncodedChunk {
    pub fn from_samples(samples: &[f32]) -> Self {
        let pcm = encode(samples);
        let data = to_transport(&pcm);
        Self { pcm, data }
    }

    pub fn from_transport(data: &str) -> Result<Self, base64::DecodeError> {
        let pcm = from_transport(data)?;
        Ok(Self {
            pcm,
            data: data.to_string(),
        })
    }
}
