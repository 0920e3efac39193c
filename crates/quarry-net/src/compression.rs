//! Conditional DEFLATE (zlib) compression for frame payloads.
//!
//! Payloads strictly larger than the negotiated threshold are compressed
//! before framing; smaller ones are sent as-is. The frame's flag byte records
//! which happened so the reader knows whether to inflate.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Frame flag bit: payload is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Controls when payloads are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Payloads longer than this many bytes are compressed. Default: 256.
    pub threshold: usize,
    /// Whether compression is applied at all. Default: false until negotiated.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: false,
        }
    }
}

impl CompressionConfig {
    /// Settings from a negotiated threshold; `None` disables compression.
    pub fn from_threshold(threshold: Option<usize>) -> Self {
        match threshold {
            Some(threshold) => Self {
                threshold,
                enabled: true,
            },
            None => Self::default(),
        }
    }

    /// Whether a payload of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && len > self.threshold
    }
}

/// Errors that can occur while inflating a payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The zlib stream was corrupt or truncated.
    #[error("inflate failed: {0}")]
    Corrupt(String),
    /// The inflated payload exceeded the frame size limit.
    #[error("inflated payload exceeds {max} bytes")]
    TooLarge {
        /// Configured limit.
        max: usize,
    },
}

/// Compress `data` with zlib at the default level.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a zlib payload, refusing output larger than `max` bytes.
pub fn decompress(data: &[u8], max: usize) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(max as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Corrupt(e.to_string()))?;
    if out.len() > max {
        return Err(CompressionError::TooLarge { max });
    }
    Ok(out)
}

/// Apply the compression policy: returns the flag bits and the bytes to send.
pub fn encode_payload(data: &[u8], config: &CompressionConfig, allow: bool) -> (u8, Vec<u8>) {
    if allow && config.should_compress(data.len()) {
        (FLAG_COMPRESSED, compress(data))
    } else {
        (0, data.to_vec())
    }
}
