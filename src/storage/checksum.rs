// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

use super::{StorageError, StorageResult};

/// Checksum over a chunk's stored streams (value stream as written, then
/// existence stream).
pub fn build_stream_checksum(value: &[u8], exists: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(value);
    hasher.update(exists);
    hasher.finalize() as u64
}

pub fn verify_stream_checksum(value: &[u8], exists: &[u8], expected: u64) -> StorageResult<()> {
    let found = build_stream_checksum(value, exists);
    if found != expected {
        return Err(StorageError::Checksum { found, expected });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_corruption() {
        let checksum = build_stream_checksum(b"values", b"exists");
        verify_stream_checksum(b"values", b"exists", checksum).unwrap();
        assert!(verify_stream_checksum(b"valuez", b"exists", checksum).is_err());
    }
}
