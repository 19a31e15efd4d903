// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Durability log for the metadata catalog.
//!
//! Every committed transaction appends its catalog mutations wrapped in
//! `Begin`/`End` markers; opening the engine replays complete entries and
//! drops a trailing torn entry. Only committed work ever reaches the file,
//! so replay needs no undo.

use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::meta::{ChunkGroupMeta, ChunkMeta, RowMaskMeta, StripeMeta};
use super::options::ColumnarOptions;
use super::StorageResult;
use crate::catalog::{RelationId, StorageId, TableCatalog};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ManifestOp {
    CreateTable {
        table: TableCatalog,
        options: ColumnarOptions,
    },
    DropTable {
        relation_id: RelationId,
    },
    SetOptions {
        relation_id: RelationId,
        options: ColumnarOptions,
    },
    AddStripe {
        stripe: StripeMeta,
        chunks: Vec<ChunkMeta>,
        chunk_groups: Vec<ChunkGroupMeta>,
    },
    DeleteStripe {
        storage_id: StorageId,
        stripe_id: u64,
    },
    RelocateStripe {
        storage_id: StorageId,
        stripe_id: u64,
        file_offset: u64,
    },
    AddRowMask {
        mask: RowMaskMeta,
    },
    UpdateRowMask {
        mask_id: u64,
        deleted_rows: u64,
        mask: Vec<u8>,
    },
    UpdateChunkGroup {
        storage_id: StorageId,
        stripe_id: u64,
        chunk_group: u32,
        deleted_rows: u64,
    },
    /// Begin of a committed transaction's ops.
    Begin,
    /// End of a committed transaction's ops.
    End,
}

/// Handles all reads and writes to the manifest file.
pub struct Manifest {
    file: File,
    enable_fsync: bool,
}

impl Manifest {
    pub async fn open(path: impl AsRef<Path>, enable_fsync: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())
            .await?;
        Ok(Self { file, enable_fsync })
    }

    /// Replay the manifest, yielding ops of complete `Begin..End` groups.
    /// A torn tail (crash mid-append) is dropped with a warning.
    pub async fn replay(&mut self) -> StorageResult<Vec<ManifestOp>> {
        let mut data = String::new();
        self.file.seek(SeekFrom::Start(0)).await?;
        let mut reader = BufReader::new(&mut self.file);
        reader.read_to_string(&mut data).await?;

        let mut ops = vec![];
        let mut buffered_ops = vec![];
        let mut in_txn = false;
        let stream = Deserializer::from_str(&data).into_iter::<ManifestOp>();
        for op in stream {
            let op = match op {
                Ok(op) => op,
                Err(err) => {
                    warn!("manifest has a torn tail, dropping it: {}", err);
                    break;
                }
            };
            match op {
                ManifestOp::Begin => {
                    buffered_ops.clear();
                    in_txn = true;
                }
                ManifestOp::End => {
                    ops.append(&mut buffered_ops);
                    in_txn = false;
                }
                op if in_txn => buffered_ops.push(op),
                op => {
                    warn!("manifest op outside a transaction, ignoring: {:?}", op);
                }
            }
        }
        if in_txn {
            warn!("manifest ends inside a transaction; its ops are dropped");
        }
        Ok(ops)
    }

    /// Append one committed transaction's ops, wrapped in markers.
    pub async fn append(&mut self, ops: &[ManifestOp]) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        serde_json::to_writer(&mut data, &ManifestOp::Begin)?;
        for op in ops {
            serde_json::to_writer(&mut data, op)?;
        }
        serde_json::to_writer(&mut data, &ManifestOp::End)?;
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.write_all(&data).await?;
        if self.enable_fsync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}
