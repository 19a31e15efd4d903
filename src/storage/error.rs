// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

use thiserror::Error;

use crate::catalog::StorageId;
use crate::storage::row_id::MAX_ROW_NUMBER;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid checksum: found {found}, expected {expected}")]
    Checksum { found: u64, expected: u64 },
    /// Metadata contradicts itself. Fatal: indicates corruption and must
    /// abort the current operation.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
    /// Rejected at the option-setting boundary; values are never clamped.
    #[error("invalid option: {0}")]
    InvalidOptions(String),
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("duplicated {0}: {1}")]
    Duplicated(&'static str, String),
    #[error(
        "row number {0} out of range (valid range is 1..={MAX_ROW_NUMBER}); \
         vacuum the table to compact its row number space"
    )]
    RowNumberOutOfRange(u64),
    #[error("could not acquire lock on storage {0}")]
    LockTimeout(StorageId),
    /// Cooperative cancellation observed. Raised by vacuum after cleanup so
    /// the caller sees the original interruption; scans instead end early
    /// and benignly.
    #[error("operation interrupted")]
    Interrupted,
}

pub type StorageResult<T> = Result<T, StorageError>;
