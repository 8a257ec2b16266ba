//! Blob Compression
//!
//! LZ4 compression of stored objects. Every stored blob starts with a
//! one-byte algorithm tag, so blobs written with compression on stay
//! readable after it is switched off and vice versa.
//!
//! # Example
//!
//! ```
//! use stratastor::blobstor::compression::{BlobCompressor, CompressionConfig};
//!
//! let compressor = BlobCompressor::new(CompressionConfig {
//!     enabled: true,
//!     ..Default::default()
//! });
//!
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data.";
//! let stored = compressor.pack(data, None, false).unwrap();
//! assert_eq!(compressor.unpack(&stored).unwrap().as_ref(), data);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
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

    /// Tag byte written in front of stored blobs
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::Corrupted(format!("unknown compression tag {}", other))),
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

/// Configuration for blob compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Whether new blobs are compressed
    pub enabled: bool,
    /// Content types never compressed (`video/*`, `*/zip` patterns allowed)
    pub uncompressible_content_types: Vec<String>,
    /// Minimum size to compress
    pub min_size_bytes: u64,
    /// Compression level (algorithm-specific)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uncompressible_content_types: Vec::new(),
            min_size_bytes: 64,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Blob Compressor
// =============================================================================

/// Applies the blobstor compression policy to stored blobs.
pub struct BlobCompressor {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl BlobCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Whether the content type is excluded from compression
    pub fn is_uncompressible(&self, content_type: &str) -> bool {
        self.config.uncompressible_content_types.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                content_type.starts_with(prefix)
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                content_type.ends_with(suffix)
            } else {
                content_type == pattern
            }
        })
    }

    /// Frame `data` for storage, compressing when policy allows and it helps.
    pub fn pack(&self, data: &[u8], content_type: Option<&str>, dont_compress: bool) -> Result<Bytes> {
        let wants = self.config.enabled
            && !dont_compress
            && (data.len() as u64) >= self.config.min_size_bytes
            && !content_type.is_some_and(|ct| self.is_uncompressible(ct));

        let (algorithm, body) = if wants {
            match self.lz4.compress(data) {
                Ok(compressed) if compressed.len() < data.len() => {
                    (CompressionAlgorithm::Lz4, compressed)
                }
                Ok(_) => (CompressionAlgorithm::None, data.to_vec()),
                Err(e) => {
                    tracing::warn!("Compression failed, storing uncompressed: {}", e);
                    (CompressionAlgorithm::None, data.to_vec())
                }
            }
        } else {
            (CompressionAlgorithm::None, data.to_vec())
        };

        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(algorithm.tag());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Strip the frame tag and decompress
    pub fn unpack(&self, stored: &[u8]) -> Result<Bytes> {
        let (&tag, body) = stored
            .split_first()
            .ok_or_else(|| Error::Corrupted("empty blob".into()))?;
        let algorithm = CompressionAlgorithm::from_tag(tag)?;
        if algorithm == CompressionAlgorithm::None {
            return Ok(Bytes::copy_from_slice(body));
        }
        Ok(Bytes::from(self.compressor(algorithm).decompress(body)?))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for BlobCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}
