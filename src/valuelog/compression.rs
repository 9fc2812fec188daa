//! Value Compression
//!
//! LZ4 block compression of frame payloads. The compressed block carries a
//! 4-byte little-endian size prefix so the decoder can size its output
//! before decompressing.
//!
//! # Example
//!
//! ```
//! use cachelog::valuelog::compression::{CompressionConfig, PayloadCompressor};
//!
//! let compressor = PayloadCompressor::new(CompressionConfig::default());
//!
//! let data = vec![b'a'; 4096];
//! let compressed = compressor.compress(&data).unwrap().expect("compresses well");
//!
//! let mut out = vec![0u8; compressed.decompressed_size().unwrap()];
//! compressor.decompress_into(compressed.as_ref(), &mut out).unwrap();
//! assert_eq!(out, data);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on a declared decompressed size. Anything larger is treated
/// as a corrupt size prefix rather than an allocation request.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

/// Length of the LZ4 size prefix
pub const SIZE_PREFIX_LEN: usize = 4;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for payload compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Master switch
    pub enabled: bool,
    /// Algorithm to use when enabled
    pub algorithm: CompressionAlgorithm,
    /// Values shorter than this are never compressed
    pub min_size_bytes: usize,
    /// Keep the compressed form only if `original / compressed >= min_ratio`
    pub min_ratio: f64,
    /// LZ4 high-compression level; `None` uses the default fast mode
    pub level: Option<i32>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            min_ratio: 2.0,
            level: None,
        }
    }
}

impl CompressionConfig {
    /// Compression switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.min_ratio.is_finite() || self.min_ratio < 0.0 {
            return Err(Error::Config(
                "compression.min_ratio must be a finite, non-negative number".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Compressed Block
// =============================================================================

/// An LZ4 block including its size prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock(Vec<u8>);

impl CompressedBlock {
    /// Size of the data once decompressed
    pub fn decompressed_size(&self) -> Result<usize> {
        decompressed_size(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CompressedBlock {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Read the size prefix of an LZ4 block, rejecting negative or oversized
/// declarations.
pub fn decompressed_size(block: &[u8]) -> Result<usize> {
    if block.len() < SIZE_PREFIX_LEN {
        return Err(Error::Corrupt(format!(
            "compressed payload of {} bytes has no size prefix",
            block.len()
        )));
    }
    let declared = i32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    if declared < 0 || declared as usize > MAX_DECOMPRESSED_SIZE {
        return Err(Error::Corrupt(format!(
            "invalid decompressed size {declared}"
        )));
    }
    Ok(declared as usize)
}

// =============================================================================
// Payload Compressor
// =============================================================================

/// Applies the compression policy to frame payloads
#[derive(Debug, Clone)]
pub struct PayloadCompressor {
    config: CompressionConfig,
}

impl PayloadCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Whether a value of `value_len` bytes should be tried at all
    pub fn wants(&self, value_len: usize) -> bool {
        self.config.enabled
            && self.config.algorithm == CompressionAlgorithm::Lz4
            && value_len > 0
            && value_len >= self.config.min_size_bytes
    }

    /// Compress `data`.
    ///
    /// Returns `None` when the result misses the configured ratio, in which
    /// case the caller stores the payload uncompressed.
    pub fn compress(&self, data: &[u8]) -> Result<Option<CompressedBlock>> {
        let mode = match self.config.level {
            Some(level) => lz4::block::CompressionMode::HIGHCOMPRESSION(level),
            None => lz4::block::CompressionMode::DEFAULT,
        };
        let compressed =
            lz4::block::compress(data, Some(mode), true).map_err(|e| Error::CompressionFailed {
                algorithm: CompressionAlgorithm::Lz4.to_string(),
                reason: e.to_string(),
            })?;

        let ratio = data.len() as f64 / compressed.len().max(1) as f64;
        if ratio >= self.config.min_ratio {
            Ok(Some(CompressedBlock(compressed)))
        } else {
            Ok(None)
        }
    }

    /// Decompress a prefixed block into `out`, which must be exactly the
    /// declared size.
    pub fn decompress_into(&self, block: &[u8], out: &mut [u8]) -> Result<()> {
        let expected = decompressed_size(block)?;
        if out.len() != expected {
            return Err(Error::Corrupt(format!(
                "output buffer of {} bytes for {} byte payload",
                out.len(),
                expected
            )));
        }
        let written = lz4::block::decompress_to_buffer(block, None, out)
            .map_err(|e| Error::Corrupt(format!("lz4 decompression failed: {e}")))?;
        if written != expected {
            return Err(Error::Corrupt(format!(
                "lz4 produced {written} bytes, expected {expected}"
            )));
        }
        Ok(())
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}
