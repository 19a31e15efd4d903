// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! StripeLight is a columnar storage engine. Rows are buffered per
//! transaction, then flushed as compressed column-oriented extents
//! ("stripes") into an append-only data file, one file per storage. A
//! transactional metadata catalog describes every stripe and chunk, a
//! per-chunk-group deletion bitmap ("row mask") provides row-level deletes,
//! and a vacuum routine reclaims space from deleted rows and fragmented
//! extents.
//!
//! The engine is embedded: it runs inside a host that provides transactions
//! and snapshots. A minimal host model lives in [`transaction`].

#![deny(unused_must_use)]

pub mod catalog;
pub mod storage;
pub mod transaction;
pub mod types;

pub use storage::{
    CmpOp, ColumnarOptions, CompressionType, ReadStats, RowId, ScanPredicate, StorageError,
    StorageOptions, StorageResult, StripeStorage, StripeTable, TableReadState,
};
pub use transaction::{Snapshot, Transaction, TransactionManager};
