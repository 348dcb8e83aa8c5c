// src/storage/document/codec.rs
//! zstd-compressed JSON segments
//!
//! A segment is one write batch: a JSON array of documents, compressed as a
//! single zstd frame. Typical record JSON compresses about 10:1.

use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use tracing::debug;

/// Levels outside this range are clamped
const MIN_LEVEL: i32 = 1;
const MAX_LEVEL: i32 = 19;

/// Encodes and decodes document segments
#[derive(Debug, Clone, Copy)]
pub struct SegmentCodec {
    level: i32,
}

impl SegmentCodec {
    /// Create a codec compressing at `level`
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(MIN_LEVEL, MAX_LEVEL),
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Serialize and compress a batch of documents
    pub fn encode(&self, documents: &[Value]) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(documents)?;

        let compressed = zstd::encode_all(json.as_slice(), self.level).map_err(|e| {
            EngineError::CompressionFailed(format!("Compression error: {}", e))
        })?;

        debug!(
            "Encoded {} documents: {} bytes -> {} bytes (ratio: {:.2}x)",
            documents.len(),
            json.len(),
            compressed.len(),
            json.len() as f64 / compressed.len().max(1) as f64
        );

        Ok(compressed)
    }

    /// Decompress and parse a segment
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Value>> {
        let json = zstd::decode_all(data).map_err(|e| {
            EngineError::CompressionFailed(format!("Decompression error: {}", e))
        })?;

        Ok(serde_json::from_slice(&json)?)
    }
}

impl Default for SegmentCodec {
    fn default() -> Self {
        Self::new(3)
    }
}
