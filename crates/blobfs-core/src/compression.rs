//! LZ4 and Zstd compression for blob payloads.
//!
//! The write path streams plaintext through a [`Compressor`] so the
//! compressed size is known while data is still arriving; the read path
//! decompresses a stored payload in one shot and insists on the exact
//! expected plaintext length.
//!
//! Stored payload layout: an 8-byte little-endian length of the compressed
//! frame, the frame, then zero padding up to the block boundary.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

/// Bytes reserved in front of every compressed payload for its length.
pub const PAYLOAD_HEADER_LEN: usize = 8;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// Store plaintext only
    None,
    /// LZ4 frame format: fastest, lower ratio
    Lz4,
    /// Zstandard: higher ratio
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd { level: 3 }
    }
}

/// Compression and decompression failures.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The encoder rejected input or failed to flush.
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// The stored payload could not be decoded.
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// The payload is shorter than its header claims.
    #[error("Payload truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
    /// Decoded plaintext length differs from the recorded content size.
    #[error("Decompressed length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected plaintext length.
        expected: usize,
        /// Produced plaintext length (capped at expected + 1).
        actual: usize,
    },
    /// The stream was used after it finished or failed.
    #[error("Compressor is not streaming")]
    NotStreaming,
    /// The stream has not been finished yet.
    #[error("Compressor has not finished")]
    NotFinished,
    /// The algorithm does not describe a compressed payload.
    #[error("Algorithm {0:?} has no compressed form")]
    Uncompressed(CompressionAlgorithm),
}

/// Streaming compression capability shared by every algorithm.
pub trait Codec {
    /// Feeds more plaintext.
    fn update(&mut self, data: &[u8]) -> Result<(), CompressionError>;

    /// Flushes and closes the stream. No further updates are accepted.
    fn finish(&mut self) -> Result<(), CompressionError>;

    /// Bytes of payload produced so far, header included.
    fn size(&self) -> usize;
}

enum StreamState<E> {
    Streaming(E),
    Finished(Vec<u8>),
    Failed,
}

fn seal(mut out: Vec<u8>) -> Vec<u8> {
    let frame_len = (out.len() - PAYLOAD_HEADER_LEN) as u64;
    out[..PAYLOAD_HEADER_LEN].copy_from_slice(&frame_len.to_le_bytes());
    out
}

/// Streaming LZ4 frame encoder.
pub struct Lz4Stream {
    state: StreamState<lz4_flex::frame::FrameEncoder<Vec<u8>>>,
}

impl Lz4Stream {
    /// Starts a new stream.
    pub fn new() -> Self {
        let sink = vec![0u8; PAYLOAD_HEADER_LEN];
        Self {
            state: StreamState::Streaming(lz4_flex::frame::FrameEncoder::new(sink)),
        }
    }
}

impl Default for Lz4Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Lz4Stream {
    fn update(&mut self, data: &[u8]) -> Result<(), CompressionError> {
        let result = match &mut self.state {
            StreamState::Streaming(enc) => enc.write_all(data),
            _ => return Err(CompressionError::NotStreaming),
        };
        result.map_err(|e| {
            self.state = StreamState::Failed;
            CompressionError::CompressionFailed(e.to_string())
        })
    }

    fn finish(&mut self) -> Result<(), CompressionError> {
        match std::mem::replace(&mut self.state, StreamState::Failed) {
            StreamState::Streaming(enc) => {
                let out = enc
                    .finish()
                    .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
                self.state = StreamState::Finished(seal(out));
                Ok(())
            }
            StreamState::Finished(out) => {
                self.state = StreamState::Finished(out);
                Ok(())
            }
            StreamState::Failed => Err(CompressionError::NotStreaming),
        }
    }

    fn size(&self) -> usize {
        match &self.state {
            StreamState::Streaming(enc) => enc.get_ref().len(),
            StreamState::Finished(out) => out.len(),
            StreamState::Failed => 0,
        }
    }
}

/// Streaming Zstandard encoder.
pub struct ZstdStream {
    state: StreamState<zstd::stream::write::Encoder<'static, Vec<u8>>>,
}

impl ZstdStream {
    /// Starts a new stream at the given level.
    pub fn new(level: i32) -> Result<Self, CompressionError> {
        let sink = vec![0u8; PAYLOAD_HEADER_LEN];
        let enc = zstd::stream::write::Encoder::new(sink, level)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
        Ok(Self {
            state: StreamState::Streaming(enc),
        })
    }
}

impl Codec for ZstdStream {
    fn update(&mut self, data: &[u8]) -> Result<(), CompressionError> {
        let result = match &mut self.state {
            StreamState::Streaming(enc) => enc.write_all(data),
            _ => return Err(CompressionError::NotStreaming),
        };
        result.map_err(|e| {
            self.state = StreamState::Failed;
            CompressionError::CompressionFailed(e.to_string())
        })
    }

    fn finish(&mut self) -> Result<(), CompressionError> {
        match std::mem::replace(&mut self.state, StreamState::Failed) {
            StreamState::Streaming(enc) => {
                let out = enc
                    .finish()
                    .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
                self.state = StreamState::Finished(seal(out));
                Ok(())
            }
            StreamState::Finished(out) => {
                self.state = StreamState::Finished(out);
                Ok(())
            }
            StreamState::Failed => Err(CompressionError::NotStreaming),
        }
    }

    fn size(&self) -> usize {
        match &self.state {
            StreamState::Streaming(enc) => enc.get_ref().len(),
            StreamState::Finished(out) => out.len(),
            StreamState::Failed => 0,
        }
    }
}

/// Write-path compressor, one variant per algorithm.
pub enum Compressor {
    /// LZ4 frame stream.
    Lz4(Lz4Stream),
    /// Zstandard stream.
    Zstd(ZstdStream),
}

impl Compressor {
    /// Creates a compressor, or `None` when the algorithm stores plaintext.
    pub fn new(algo: CompressionAlgorithm) -> Result<Option<Self>, CompressionError> {
        match algo {
            CompressionAlgorithm::None => Ok(None),
            CompressionAlgorithm::Lz4 => Ok(Some(Compressor::Lz4(Lz4Stream::new()))),
            CompressionAlgorithm::Zstd { level } => {
                Ok(Some(Compressor::Zstd(ZstdStream::new(level)?)))
            }
        }
    }

    /// The algorithm this compressor produces.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        match self {
            Compressor::Lz4(_) => CompressionAlgorithm::Lz4,
            // The level is not needed to decode.
            Compressor::Zstd(_) => CompressionAlgorithm::Zstd { level: 0 },
        }
    }

    /// Returns the finished payload (header + frame).
    pub fn into_payload(self) -> Result<Vec<u8>, CompressionError> {
        let state = match self {
            Compressor::Lz4(s) => match s.state {
                StreamState::Finished(out) => Some(out),
                _ => None,
            },
            Compressor::Zstd(s) => match s.state {
                StreamState::Finished(out) => Some(out),
                _ => None,
            },
        };
        state.ok_or(CompressionError::NotFinished)
    }
}

impl Codec for Compressor {
    fn update(&mut self, data: &[u8]) -> Result<(), CompressionError> {
        match self {
            Compressor::Lz4(s) => s.update(data),
            Compressor::Zstd(s) => s.update(data),
        }
    }

    fn finish(&mut self) -> Result<(), CompressionError> {
        match self {
            Compressor::Lz4(s) => s.finish(),
            Compressor::Zstd(s) => s.finish(),
        }
    }

    fn size(&self) -> usize {
        match self {
            Compressor::Lz4(s) => s.size(),
            Compressor::Zstd(s) => s.size(),
        }
    }
}

/// Decompresses a stored payload, which may carry trailing block padding.
///
/// Fails unless exactly `expected_len` plaintext bytes come out.
pub fn decompress(
    algo: CompressionAlgorithm,
    src: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, CompressionError> {
    if src.len() < PAYLOAD_HEADER_LEN {
        return Err(CompressionError::Truncated {
            needed: PAYLOAD_HEADER_LEN,
            available: src.len(),
        });
    }
    let mut header = [0u8; PAYLOAD_HEADER_LEN];
    header.copy_from_slice(&src[..PAYLOAD_HEADER_LEN]);
    let frame_len = u64::from_le_bytes(header);
    let available = src.len() - PAYLOAD_HEADER_LEN;
    if frame_len > available as u64 {
        return Err(CompressionError::Truncated {
            needed: PAYLOAD_HEADER_LEN.saturating_add(frame_len as usize),
            available: src.len(),
        });
    }
    let frame = &src[PAYLOAD_HEADER_LEN..PAYLOAD_HEADER_LEN + frame_len as usize];

    // Read one byte past the expected length so over-long output is caught.
    let limit = expected_len as u64 + 1;
    let mut out = Vec::with_capacity(expected_len);
    match algo {
        CompressionAlgorithm::None => return Err(CompressionError::Uncompressed(algo)),
        CompressionAlgorithm::Lz4 => {
            lz4_flex::frame::FrameDecoder::new(frame)
                .take(limit)
                .read_to_end(&mut out)
                .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
        }
        CompressionAlgorithm::Zstd { .. } => {
            zstd::stream::read::Decoder::new(frame)
                .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?
                .take(limit)
                .read_to_end(&mut out)
                .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
        }
    }

    if out.len() != expected_len {
        return Err(CompressionError::LengthMismatch {
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}
