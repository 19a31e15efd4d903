// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::compression::CompressionType;
use super::{StorageError, StorageResult};

/// Upper bound for both row limits. Matches the original engine's option
/// ranges; anything outside is rejected, never clamped.
pub const ROW_LIMIT_MAX: u64 = 10_000_000;

/// Options for the whole engine instance.
#[derive(Clone)]
pub struct StorageOptions {
    /// Directory holding the manifest and one data file per storage.
    pub path: PathBuf,

    /// Number of decompressed chunks kept in the chunk cache.
    pub cache_size: u64,

    /// Defaults applied to newly created tables.
    pub table_defaults: ColumnarOptions,
}

impl StorageOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_size: 4096,
            table_defaults: ColumnarOptions::default(),
        }
    }

    #[cfg(test)]
    pub fn default_for_test(path: PathBuf) -> Self {
        Self {
            path,
            cache_size: 64,
            table_defaults: ColumnarOptions::default(),
        }
    }
}

/// Per-relation, host-settable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarOptions {
    /// Rows per chunk group: one chunk per column is cut at this boundary.
    pub chunk_group_row_limit: u64,

    /// Rows per stripe; also the number of row numbers reserved when a
    /// stripe is started.
    pub stripe_row_limit: u64,

    /// Codec applied per column chunk.
    pub compression: CompressionType,

    /// Codec-specific level.
    pub compression_level: i32,
}

impl Default for ColumnarOptions {
    fn default() -> Self {
        Self {
            chunk_group_row_limit: 10_000,
            stripe_row_limit: 150_000,
            compression: CompressionType::Lz4,
            compression_level: 3,
        }
    }
}

impl ColumnarOptions {
    /// Validate before any option takes effect.
    pub fn validate(&self) -> StorageResult<()> {
        if self.chunk_group_row_limit == 0 || self.chunk_group_row_limit > ROW_LIMIT_MAX {
            return Err(StorageError::InvalidOptions(format!(
                "chunk group row limit {} out of range 1..={}",
                self.chunk_group_row_limit, ROW_LIMIT_MAX
            )));
        }
        if self.stripe_row_limit == 0 || self.stripe_row_limit > ROW_LIMIT_MAX {
            return Err(StorageError::InvalidOptions(format!(
                "stripe row limit {} out of range 1..={}",
                self.stripe_row_limit, ROW_LIMIT_MAX
            )));
        }
        if self.compression_level < CompressionType::LEVEL_MIN
            || self.compression_level > CompressionType::LEVEL_MAX
        {
            return Err(StorageError::InvalidOptions(format!(
                "compression level {} out of range {}..={}",
                self.compression_level,
                CompressionType::LEVEL_MIN,
                CompressionType::LEVEL_MAX
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut options = ColumnarOptions::default();
        options.chunk_group_row_limit = 0;
        assert!(matches!(
            options.validate(),
            Err(StorageError::InvalidOptions(_))
        ));

        let mut options = ColumnarOptions::default();
        options.stripe_row_limit = ROW_LIMIT_MAX + 1;
        assert!(matches!(
            options.validate(),
            Err(StorageError::InvalidOptions(_))
        ));

        let mut options = ColumnarOptions::default();
        options.compression = CompressionType::Zstd;
        options.compression_level = 99;
        assert!(matches!(
            options.validate(),
            Err(StorageError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_validate_accepts_tiny_limits() {
        // Tiny limits are legal; tests and narrow tables rely on them.
        let options = ColumnarOptions {
            chunk_group_row_limit: 2,
            stripe_row_limit: 4,
            ..ColumnarOptions::default()
        };
        options.validate().unwrap();
    }
}
