// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Mapping between the host's opaque two-component row identifiers and the
//! engine's flat row number space.
//!
//! The mapping is deterministic: `row_number = block * K + offset - 1` with
//! `K` valid offsets per block. Offset 0 never occurs, so row number 0 is
//! reserved and doubles as an "invalid" sentinel on the host side.

use serde::{Deserialize, Serialize};

use super::{StorageError, StorageResult};

/// Valid offsets per block component.
pub const ROW_OFFSETS_PER_BLOCK: u64 = 2048;

/// First valid row number.
pub const FIRST_ROW_NUMBER: u64 = 1;

/// Highest representable row number; one block component is reserved.
pub const MAX_ROW_NUMBER: u64 = ROW_OFFSETS_PER_BLOCK * (u32::MAX as u64);

/// Opaque two-component row address handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub block: u32,
    pub offset: u16,
}

impl RowId {
    /// Build the address for a row number. Fails on zero and on numbers
    /// beyond the representable maximum.
    pub fn from_row_number(row_number: u64) -> StorageResult<Self> {
        validate_row_number(row_number)?;
        Ok(Self {
            block: (row_number / ROW_OFFSETS_PER_BLOCK) as u32,
            offset: (row_number % ROW_OFFSETS_PER_BLOCK) as u16 + 1,
        })
    }

    /// Decode back to a row number, rejecting addresses no valid row number
    /// maps to.
    pub fn row_number(&self) -> StorageResult<u64> {
        if self.offset == 0 || u64::from(self.offset) > ROW_OFFSETS_PER_BLOCK {
            return Err(StorageError::Decode(format!(
                "row id offset component {} out of range",
                self.offset
            )));
        }
        let row_number =
            u64::from(self.block) * ROW_OFFSETS_PER_BLOCK + u64::from(self.offset) - 1;
        validate_row_number(row_number)?;
        Ok(row_number)
    }
}

pub fn validate_row_number(row_number: u64) -> StorageResult<()> {
    if row_number < FIRST_ROW_NUMBER || row_number > MAX_ROW_NUMBER {
        return Err(StorageError::RowNumberOutOfRange(row_number));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_roundtrip() {
        for row_number in [
            FIRST_ROW_NUMBER,
            ROW_OFFSETS_PER_BLOCK - 1,
            ROW_OFFSETS_PER_BLOCK,
            ROW_OFFSETS_PER_BLOCK + 1,
            123_456_789,
            MAX_ROW_NUMBER,
        ] {
            let id = RowId::from_row_number(row_number).unwrap();
            assert_eq!(id.row_number().unwrap(), row_number);
        }
    }

    #[test]
    fn test_first_block_is_zero() {
        let id = RowId::from_row_number(1).unwrap();
        assert_eq!((id.block, id.offset), (0, 2));
    }

    #[test]
    fn test_invalid_row_numbers_rejected() {
        assert!(matches!(
            RowId::from_row_number(0),
            Err(StorageError::RowNumberOutOfRange(0))
        ));
        assert!(matches!(
            RowId::from_row_number(MAX_ROW_NUMBER + 1),
            Err(StorageError::RowNumberOutOfRange(_))
        ));
        let bad = RowId {
            block: 0,
            offset: 0,
        };
        assert!(bad.row_number().is_err());
    }
}
