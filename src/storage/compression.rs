// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Per-chunk stream compression.
//!
//! Each column chunk compresses its value and existence streams
//! independently. A stream whose compressed form is not smaller than its
//! input is stored raw and tagged [`CompressionType::None`]; decompression
//! trusts the tag recorded in the chunk metadata, never the table options
//! (options may change between write and read).

use std::io::Write;

use serde::{Deserialize, Serialize};

use super::{StorageError, StorageResult};

/// Supported codecs. `Deflate` is the generic codec, `Lz4` favors speed,
/// `Zstd` favors ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Deflate,
    Lz4,
    Zstd,
}

impl CompressionType {
    /// Parse a host-supplied codec name. Unknown names are a configuration
    /// error at the option boundary.
    pub fn from_name(name: &str) -> StorageResult<Self> {
        match name.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "deflate" | "generic" => Ok(Self::Deflate),
            "lz4" | "fast" => Ok(Self::Lz4),
            "zstd" | "zstandard" | "high-ratio" => Ok(Self::Zstd),
            other => Err(StorageError::InvalidOptions(format!(
                "unknown compression codec {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deflate => "deflate",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Range a configured level must fall in. The setting is shared across
    /// codecs; each codec maps it onto its native scale internally.
    pub const LEVEL_MIN: i32 = 0;
    pub const LEVEL_MAX: i32 = 19;

    /// Map the shared level setting onto this codec's native scale.
    fn effective_level(&self, level: i32) -> i32 {
        match self {
            Self::None | Self::Lz4 => 0,
            Self::Deflate => level.clamp(0, 9),
            Self::Zstd => level.clamp(1, 19),
        }
    }
}

/// Compress `data`, falling back to an uncompressed representation whenever
/// the codec does not actually shrink the stream. Returns the codec that was
/// really applied together with the bytes to store.
pub fn maybe_compress(
    codec: CompressionType,
    level: i32,
    data: &[u8],
) -> StorageResult<(CompressionType, Vec<u8>)> {
    if codec == CompressionType::None || data.is_empty() {
        return Ok((CompressionType::None, data.to_vec()));
    }
    let compressed = compress(codec, level, data)?;
    if compressed.len() >= data.len() {
        Ok((CompressionType::None, data.to_vec()))
    } else {
        Ok((codec, compressed))
    }
}

pub fn compress(codec: CompressionType, level: i32, data: &[u8]) -> StorageResult<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Deflate => {
            let level = codec.effective_level(level);
            let mut encoder = flate2::write::DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2),
                flate2::Compression::new(level as u32),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionType::Lz4 => Ok(lz4_flex::block::compress(data)),
        CompressionType::Zstd => {
            let level = codec.effective_level(level);
            zstd::bulk::compress(data, level)
                .map_err(|e| StorageError::Decode(format!("zstd compression failed: {}", e)))
        }
    }
}

/// Decompress a stream back to exactly `decompressed_len` bytes, as recorded
/// in the chunk metadata.
pub fn decompress(
    codec: CompressionType,
    data: &[u8],
    decompressed_len: usize,
) -> StorageResult<Vec<u8>> {
    let out = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Deflate => {
            let mut decoder = flate2::write::DeflateDecoder::new(Vec::with_capacity(
                decompressed_len,
            ));
            decoder.write_all(data)?;
            decoder
                .finish()
                .map_err(|e| StorageError::Decode(format!("deflate stream corrupt: {}", e)))?
        }
        CompressionType::Lz4 => lz4_flex::block::decompress(data, decompressed_len)
            .map_err(|e| StorageError::Decode(format!("lz4 stream corrupt: {}", e)))?,
        CompressionType::Zstd => zstd::bulk::decompress(data, decompressed_len)
            .map_err(|e| StorageError::Decode(format!("zstd stream corrupt: {}", e)))?,
    };
    if out.len() != decompressed_len {
        return Err(StorageError::Decode(format!(
            "decompressed {} bytes, chunk metadata says {}",
            out.len(),
            decompressed_len
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    const CODECS: [CompressionType; 4] = [
        CompressionType::None,
        CompressionType::Deflate,
        CompressionType::Lz4,
        CompressionType::Zstd,
    ];

    fn small_ints() -> Vec<u8> {
        let mut buf = vec![];
        for i in 0..1000i32 {
            buf.put_i32_le(i % 128);
        }
        buf
    }

    fn repeated_run() -> Vec<u8> {
        let mut buf = vec![];
        for _ in 0..4000i32 {
            buf.put_i32_le(7);
        }
        buf
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        for codec in CODECS {
            for data in [small_ints(), repeated_run()] {
                let compressed = compress(codec, 3, &data).unwrap();
                let restored = decompress(codec, &compressed, data.len()).unwrap();
                assert_eq!(restored, data, "codec {:?}", codec);
            }
        }
    }

    #[test]
    fn test_incompressible_stream_stored_raw() {
        // 3 bytes of noise cannot shrink; the stored codec must say so.
        let data = [1u8, 254, 97];
        for codec in CODECS {
            let (stored, bytes) = maybe_compress(codec, 3, &data).unwrap();
            assert_eq!(stored, CompressionType::None);
            assert_eq!(bytes, data);
        }
    }

    #[test]
    fn test_repeated_run_actually_compresses() {
        let data = repeated_run();
        for codec in [
            CompressionType::Deflate,
            CompressionType::Lz4,
            CompressionType::Zstd,
        ] {
            let (stored, bytes) = maybe_compress(codec, 3, &data).unwrap();
            assert_eq!(stored, codec);
            assert!(bytes.len() < data.len());
        }
    }

    #[test]
    fn test_unknown_codec_name_rejected() {
        assert!(matches!(
            CompressionType::from_name("brotli"),
            Err(StorageError::InvalidOptions(_))
        ));
        assert_eq!(
            CompressionType::from_name("high-ratio").unwrap(),
            CompressionType::Zstd
        );
    }
}
