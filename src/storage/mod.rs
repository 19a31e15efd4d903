// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! The columnar storage engine.
//!
//! [`StripeStorage`] owns the metadata catalog, the write-state and
//! row-mask registries, the shared chunk cache and the manifest. Tables are
//! handles over one storage each; transactions come from the host model in
//! [`crate::transaction`] and are finished through [`StripeStorage::commit`]
//! / [`StripeStorage::abort`], which drive the registries' lifecycle hooks.

mod checksum;
mod compaction;
mod compression;
mod disk;
mod error;
pub(crate) mod manifest;
mod meta;
mod options;
mod read_state;
mod row_id;
mod row_mask;
mod table;
mod write_state;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use compression::CompressionType;
pub use disk::METAPAGE_SIZE;
use disk::PhysicalStorage;
pub use error::{StorageError, StorageResult};
use manifest::{Manifest, ManifestOp};
use meta::MetadataCatalog;
pub use meta::{
    ChunkGroupMeta, ChunkMeta, RowMaskMeta, ScanDirection, StripeMeta, StripeWriteState,
    ROW_MASK_CHUNK_SIZE,
};
use moka::future::Cache;
pub use options::{ColumnarOptions, StorageOptions};
use parking_lot::RwLock;
pub use read_state::{
    ChunkCache, CmpOp, ReadContext, ReadStats, ScanPredicate, TableReadState,
};
pub use row_id::{RowId, FIRST_ROW_NUMBER, MAX_ROW_NUMBER, ROW_OFFSETS_PER_BLOCK};
use row_mask::RowMaskManager;
pub use table::StripeTable;
use tokio_util::sync::CancellationToken;
use tracing::info;
use write_state::{WriteContext, WriteStateManager};

use crate::catalog::{ColumnDesc, RelationId, StorageId, TableCatalog};
use crate::transaction::{Transaction, TransactionManager};

const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Engine internals shared by every table handle.
pub(crate) struct EngineShared {
    pub(crate) meta: MetadataCatalog,
    pub(crate) write_states: WriteStateManager,
    pub(crate) row_masks: RowMaskManager,
    pub(crate) cache: ChunkCache,
    pub(crate) txn_mgr: Arc<TransactionManager>,
    pub(crate) manifest: tokio::sync::Mutex<Manifest>,
}

/// The storage engine.
pub struct StripeStorage {
    options: Arc<StorageOptions>,
    path: PathBuf,
    shared: Arc<EngineShared>,
    tables: RwLock<HashMap<RelationId, StripeTable>>,
    next_relation_id: AtomicU32,
    next_storage_id: AtomicU64,
}

impl StripeStorage {
    /// Open (or bootstrap) an engine instance at `options.path`, replaying
    /// the manifest into the catalog.
    pub async fn open(options: StorageOptions) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&options.path).await?;
        let path = options.path.clone();
        let mut manifest = Manifest::open(path.join(MANIFEST_FILE_NAME), true).await?;
        let ops = manifest.replay().await?;

        let shared = Arc::new(EngineShared {
            meta: MetadataCatalog::new(),
            write_states: WriteStateManager::new(),
            row_masks: RowMaskManager::new(),
            cache: Cache::new(options.cache_size),
            txn_mgr: Arc::new(TransactionManager::new()),
            manifest: tokio::sync::Mutex::new(manifest),
        });

        let storage = Self {
            options: Arc::new(options),
            path,
            shared,
            tables: RwLock::new(HashMap::new()),
            next_relation_id: AtomicU32::new(1),
            next_storage_id: AtomicU64::new(1),
        };
        storage.bootstrap(ops)?;
        Ok(storage)
    }

    fn bootstrap(&self, ops: Vec<ManifestOp>) -> StorageResult<()> {
        let mut replayed = 0usize;
        for op in ops {
            match op {
                ManifestOp::CreateTable { mut table, options } => {
                    table.rebuild_column_map();
                    self.next_relation_id
                        .fetch_max(table.relation_id() + 1, Ordering::SeqCst);
                    self.next_storage_id
                        .fetch_max(table.storage_id() + 1, Ordering::SeqCst);
                    let physical = PhysicalStorage::open(&self.path, table.storage_id())?;
                    let handle = StripeTable {
                        info: Arc::new(table),
                        options: Arc::new(RwLock::new(options)),
                        storage: Arc::new(physical),
                        shared: self.shared.clone(),
                    };
                    self.tables.write().insert(handle.relation_id(), handle);
                }
                ManifestOp::DropTable { relation_id } => {
                    self.tables.write().remove(&relation_id);
                }
                ManifestOp::SetOptions {
                    relation_id,
                    options,
                } => {
                    if let Some(table) = self.tables.read().get(&relation_id) {
                        *table.options.write() = options;
                    }
                }
                op => {
                    self.shared.meta.apply_manifest_op(&op)?;
                }
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(ops = replayed, "replayed manifest");
        }
        Ok(())
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.shared.txn_mgr
    }

    /// Begin a host transaction.
    pub fn begin(&self) -> Transaction {
        self.shared.txn_mgr.begin()
    }

    /// Create a table over a fresh storage. Maintenance operations are
    /// auto-committed: the manifest entry is written immediately.
    pub async fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDesc>,
        options: Option<ColumnarOptions>,
    ) -> StorageResult<StripeTable> {
        let options = options.unwrap_or_else(|| self.options.table_defaults.clone());
        options.validate()?;
        if columns.is_empty() {
            return Err(StorageError::InvalidOptions(
                "a columnar table needs at least one column".into(),
            ));
        }
        if self.get_table_by_name(name).is_ok() {
            return Err(StorageError::Duplicated("table", name.into()));
        }
        let relation_id = self.next_relation_id.fetch_add(1, Ordering::SeqCst);
        let storage_id = self.new_storage()?;
        let physical = PhysicalStorage::open(&self.path, storage_id)?;
        let catalog = TableCatalog::new(relation_id, name, storage_id, columns);
        self.shared
            .manifest
            .lock()
            .await
            .append(&[ManifestOp::CreateTable {
                table: catalog.clone(),
                options: options.clone(),
            }])
            .await?;
        let handle = StripeTable {
            info: Arc::new(catalog),
            options: Arc::new(RwLock::new(options)),
            storage: Arc::new(physical),
            shared: self.shared.clone(),
        };
        self.tables.write().insert(relation_id, handle.clone());
        info!(relation_id, storage_id, name, "created table");
        Ok(handle)
    }

    /// Allocate a fresh storage id and create its data file.
    fn new_storage(&self) -> StorageResult<StorageId> {
        let storage_id = self.next_storage_id.fetch_add(1, Ordering::SeqCst);
        PhysicalStorage::create(&self.path, storage_id)?;
        Ok(storage_id)
    }

    pub fn get_table(&self, relation_id: RelationId) -> StorageResult<StripeTable> {
        self.tables
            .read()
            .get(&relation_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("table", relation_id.to_string()))
    }

    pub fn get_table_by_name(&self, name: &str) -> StorageResult<StripeTable> {
        self.tables
            .read()
            .values()
            .find(|table| table.name() == name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("table", name.into()))
    }

    /// Drop a table: catalog rows and the data file go away immediately.
    pub async fn drop_table(&self, relation_id: RelationId) -> StorageResult<()> {
        let Some(table) = self.tables.write().remove(&relation_id) else {
            return Err(StorageError::NotFound("table", relation_id.to_string()));
        };
        self.shared
            .manifest
            .lock()
            .await
            .append(&[ManifestOp::DropTable { relation_id }])
            .await?;
        self.shared.meta.delete_all_for_storage(table.storage_id());
        table.storage.delete_file()?;
        info!(relation_id, "dropped table");
        Ok(())
    }

    /// Commit: flush every write state and row-mask cache the transaction
    /// holds, append its catalog mutations to the manifest, release locks.
    pub async fn commit(&self, txn: Transaction) -> StorageResult<()> {
        let result = self.flush_transaction(&txn).await;
        match result {
            Ok(()) => {
                let ops = txn.take_manifest_ops();
                self.shared.manifest.lock().await.append(&ops).await?;
                self.shared.write_states.release(&txn);
                self.shared.row_masks.release(&txn);
                txn.finish(true);
                Ok(())
            }
            Err(err) => {
                // A failed pre-commit flush aborts the transaction.
                self.shared.write_states.release(&txn);
                self.shared.row_masks.release(&txn);
                txn.finish(false);
                Err(err)
            }
        }
    }

    async fn flush_transaction(&self, txn: &Transaction) -> StorageResult<()> {
        for relation_id in self.shared.write_states.relations_of(txn) {
            let table = self.get_table(relation_id)?;
            let ctx = WriteContext {
                txn,
                catalog: &self.shared.meta,
                storage: &table.storage,
            };
            self.shared
                .write_states
                .flush_relation(relation_id, &ctx)
                .await?;
        }
        for storage_id in self.shared.row_masks.storages_of(txn) {
            self.shared
                .row_masks
                .flush_storage(&self.shared.meta, storage_id, txn)?;
        }
        Ok(())
    }

    /// Abort: discard buffered rows and cached masks without flushing.
    /// Reserved row numbers and stripe ids stay burned; vacuum reclaims
    /// the orphaned metadata.
    pub async fn abort(&self, txn: Transaction) -> StorageResult<()> {
        self.shared.write_states.release(&txn);
        self.shared.row_masks.release(&txn);
        let _ = txn.take_manifest_ops();
        txn.finish(false);
        Ok(())
    }

    /// Commit the innermost subtransaction: its write states and mask
    /// entries are elevated to the parent scope, not flushed.
    pub fn commit_subtransaction(&self, txn: &Transaction) {
        let (child, parent) = txn.pop_subtransaction_commit();
        self.shared.write_states.subtransaction_commit(txn, child, parent);
        self.shared.row_masks.subtransaction_commit(txn, child, parent);
    }

    /// Abort the innermost subtransaction: its buffered work is discarded.
    pub fn abort_subtransaction(&self, txn: &Transaction) {
        let child = txn.pop_subtransaction_abort();
        self.shared.write_states.subtransaction_abort(txn, child);
        self.shared.row_masks.subtransaction_abort(txn, child);
    }

    /// Host maintenance entry point: vacuum one table in its own
    /// transaction. Partial progress under interruption is durable, so the
    /// transaction commits even when the interruption is re-raised.
    pub async fn vacuum(
        &self,
        relation_id: RelationId,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let table = self.get_table(relation_id)?;
        let txn = self.begin();
        let result = table.vacuum(&txn, cancel).await;
        match result {
            Ok(()) => {
                self.commit(txn).await?;
                Ok(())
            }
            Err(StorageError::Interrupted) => {
                self.commit(txn).await?;
                Err(StorageError::Interrupted)
            }
            Err(err) => {
                self.abort(txn).await?;
                Err(err)
            }
        }
    }
}
