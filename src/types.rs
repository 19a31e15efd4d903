// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Minimal value model shared by the write and read paths.
//!
//! Values are stored column-major inside a stripe. Fixed-width types encode
//! little-endian into the value stream; variable-width types are
//! length-prefixed. Nulls never reach the value stream: the per-chunk
//! existence stream records which rows carry a value.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, StorageResult};

/// Data type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    Blob,
}

impl DataType {
    /// Width of one encoded value, or `None` for variable-width types.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            DataType::Bool => Some(1),
            DataType::Int32 => Some(4),
            DataType::Int64 => Some(8),
            DataType::Float64 => Some(8),
            DataType::String | DataType::Blob => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "BOOLEAN",
            DataType::Int32 => "INT",
            DataType::Int64 => "BIGINT",
            DataType::Float64 => "DOUBLE",
            DataType::String => "VARCHAR",
            DataType::Blob => "BLOB",
        };
        write!(f, "{}", name)
    }
}

/// A single value of a row cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Blob(Vec<u8>),
}

/// A row is one value per column, in catalog order.
pub type Row = Vec<DataValue>;

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// Data type of this value, `None` for null.
    pub fn datatype(&self) -> Option<DataType> {
        match self {
            DataValue::Null => None,
            DataValue::Bool(_) => Some(DataType::Bool),
            DataValue::Int32(_) => Some(DataType::Int32),
            DataValue::Int64(_) => Some(DataType::Int64),
            DataValue::Float64(_) => Some(DataType::Float64),
            DataValue::String(_) => Some(DataType::String),
            DataValue::Blob(_) => Some(DataType::Blob),
        }
    }

    /// Total order over values of the same type. Used for chunk min/max
    /// tracking and predicate pruning; comparing across types is a caller
    /// bug and falls back to `Equal` after a debug assertion.
    pub fn compare(&self, other: &DataValue) -> Ordering {
        match (self, other) {
            (DataValue::Bool(a), DataValue::Bool(b)) => a.cmp(b),
            (DataValue::Int32(a), DataValue::Int32(b)) => a.cmp(b),
            (DataValue::Int64(a), DataValue::Int64(b)) => a.cmp(b),
            (DataValue::Float64(a), DataValue::Float64(b)) => a.total_cmp(b),
            (DataValue::String(a), DataValue::String(b)) => a.cmp(b),
            (DataValue::Blob(a), DataValue::Blob(b)) => a.cmp(b),
            _ => {
                debug_assert!(false, "comparing values of different types");
                Ordering::Equal
            }
        }
    }

    /// Encode into a value stream.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            DataValue::Null => unreachable!("nulls are recorded in the existence stream"),
            DataValue::Bool(v) => buf.put_u8(*v as u8),
            DataValue::Int32(v) => buf.put_i32_le(*v),
            DataValue::Int64(v) => buf.put_i64_le(*v),
            DataValue::Float64(v) => buf.put_f64_le(*v),
            DataValue::String(v) => {
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            DataValue::Blob(v) => {
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v);
            }
        }
    }

    /// Decode one value of `datatype` from a value stream.
    pub fn decode(datatype: DataType, buf: &mut impl Buf) -> StorageResult<DataValue> {
        macro_rules! need {
            ($n:expr) => {
                if buf.remaining() < $n {
                    return Err(StorageError::Decode(format!(
                        "value stream truncated: expected {} more bytes",
                        $n
                    )));
                }
            };
        }
        let value = match datatype {
            DataType::Bool => {
                need!(1);
                DataValue::Bool(buf.get_u8() != 0)
            }
            DataType::Int32 => {
                need!(4);
                DataValue::Int32(buf.get_i32_le())
            }
            DataType::Int64 => {
                need!(8);
                DataValue::Int64(buf.get_i64_le())
            }
            DataType::Float64 => {
                need!(8);
                DataValue::Float64(buf.get_f64_le())
            }
            DataType::String => {
                need!(4);
                let len = buf.get_u32_le() as usize;
                need!(len);
                let mut data = vec![0; len];
                buf.copy_to_slice(&mut data);
                DataValue::String(String::from_utf8(data).map_err(|_| {
                    StorageError::Decode("value stream holds invalid utf-8".into())
                })?)
            }
            DataType::Blob => {
                need!(4);
                let len = buf.get_u32_le() as usize;
                need!(len);
                let mut data = vec![0; len];
                buf.copy_to_slice(&mut data);
                DataValue::Blob(data)
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let values = vec![
            DataValue::Bool(true),
            DataValue::Int32(-42),
            DataValue::Int64(1 << 40),
            DataValue::Float64(3.5),
            DataValue::String("stripe".into()),
            DataValue::Blob(vec![0, 1, 2, 255]),
        ];
        for value in values {
            let mut buf = vec![];
            value.encode(&mut buf);
            let decoded = DataValue::decode(value.datatype().unwrap(), &mut &buf[..]).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_compare_floats_total_order() {
        let a = DataValue::Float64(f64::NAN);
        let b = DataValue::Float64(1.0);
        // NaN sorts above every number under total order
        assert_eq!(a.compare(&b), Ordering::Greater);
    }
}
