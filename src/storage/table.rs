// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Host-facing surface of one columnar table: insert, delete, update, point
//! fetch, scans and maintenance.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::compaction::{self, VacuumContext};
use super::disk::PhysicalStorage;
use super::meta::{ScanDirection, StripeWriteState};
use super::options::ColumnarOptions;
use super::read_state::{read_row_in_stripe, ReadContext, ScanPredicate, TableReadState};
use super::row_id::RowId;
use super::write_state::WriteContext;
use super::{EngineShared, StorageResult};
use crate::catalog::{ColumnDesc, RelationId, StorageId, TableCatalog};
use crate::transaction::{Snapshot, Transaction};
use crate::types::{DataValue, Row};

/// A table backed by one columnar storage. Cheap to clone; all clones share
/// the same storage handle and options.
#[derive(Clone)]
pub struct StripeTable {
    pub(super) info: Arc<TableCatalog>,
    pub(super) options: Arc<RwLock<ColumnarOptions>>,
    pub(super) storage: Arc<PhysicalStorage>,
    pub(super) shared: Arc<EngineShared>,
}

impl StripeTable {
    pub fn relation_id(&self) -> RelationId {
        self.info.relation_id()
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn storage_id(&self) -> StorageId {
        self.info.storage_id()
    }

    pub fn columns(&self) -> &Arc<[ColumnDesc]> {
        self.info.columns()
    }

    pub fn options(&self) -> ColumnarOptions {
        self.options.read().clone()
    }

    /// Change the per-relation options. Validation happens here, at the
    /// setting boundary; invalid values are rejected, never clamped.
    /// Already-written stripes keep the limits they were written with.
    pub async fn set_options(&self, options: ColumnarOptions) -> StorageResult<()> {
        options.validate()?;
        self.shared
            .manifest
            .lock()
            .await
            .append(&[super::manifest::ManifestOp::SetOptions {
                relation_id: self.relation_id(),
                options: options.clone(),
            }])
            .await?;
        *self.options.write() = options;
        Ok(())
    }

    /// Current logical size of the backing storage in bytes.
    pub fn table_size(&self) -> u64 {
        self.storage.table_size()
    }

    /// Visible row count, from stripe metadata alone.
    pub fn row_count(&self, snapshot: &Snapshot) -> u64 {
        self.shared
            .meta
            .total_row_count(self.storage_id(), snapshot)
    }

    /// Highest row number any visible stripe covers.
    pub fn highest_row_number(&self, snapshot: &Snapshot) -> Option<u64> {
        self.shared
            .meta
            .find_stripe_with_highest_row_number(self.storage_id(), snapshot)
            .map(|entry| entry.meta.first_row_number + entry.meta.row_count.max(1) - 1)
    }

    /// First row number of the next visible stripe strictly after
    /// `row_number`. Hosts use this to partition parallel work along stripe
    /// boundaries.
    pub fn next_stripe_boundary(&self, row_number: u64, snapshot: &Snapshot) -> Option<u64> {
        self.shared
            .meta
            .find_next_stripe(self.storage_id(), row_number, snapshot)
            .map(|entry| entry.meta.first_row_number)
    }

    pub(super) fn write_context<'a>(&'a self, txn: &'a Transaction) -> WriteContext<'a> {
        WriteContext {
            txn,
            catalog: &self.shared.meta,
            storage: &self.storage,
        }
    }

    /// Context for driving scans created on this table.
    pub fn read_context(&self) -> ReadContext<'_> {
        ReadContext {
            catalog: &self.shared.meta,
            storage: &self.storage,
            cache: &self.shared.cache,
        }
    }

    /// Buffer one row into the transaction's write state, cutting chunk and
    /// stripe boundaries as configured. The returned identifier is stable
    /// before the row is durable.
    pub async fn insert_row(&self, txn: &Transaction, values: Row) -> StorageResult<RowId> {
        let options = self.options();
        let ctx = self.write_context(txn);
        let row_number = self
            .shared
            .write_states
            .write_row(self.relation_id(), self.columns(), &options, &ctx, values)
            .await?;
        RowId::from_row_number(row_number)
    }

    /// Mark one row deleted. Returns `false` when the row no longer exists:
    /// already deleted (possibly by a concurrent transaction that held the
    /// advisory lock first) or not yet visible. The advisory lock is taken
    /// here and held until transaction end.
    pub async fn delete_row(
        &self,
        txn: &Transaction,
        row_id: RowId,
        snapshot: &Snapshot,
    ) -> StorageResult<bool> {
        let row_number = row_id.row_number()?;
        txn.acquire_storage_lock(self.storage_id()).await;
        self.shared.row_masks.mark_deleted(
            &self.shared.meta,
            self.storage_id(),
            txn,
            snapshot,
            row_number,
        )
    }

    /// Update is modeled as delete + insert; the engine never writes in
    /// place. `None` means the old row no longer existed, and nothing was
    /// inserted.
    pub async fn update_row(
        &self,
        txn: &Transaction,
        row_id: RowId,
        values: Row,
        snapshot: &Snapshot,
    ) -> StorageResult<Option<RowId>> {
        if !self.delete_row(txn, row_id, snapshot).await? {
            return Ok(None);
        }
        Ok(Some(self.insert_row(txn, values).await?))
    }

    /// Point lookup by row identifier, honoring the row mask.
    pub async fn fetch_row_by_id(
        &self,
        txn: &Transaction,
        row_id: RowId,
        snapshot: &Snapshot,
    ) -> StorageResult<Option<Row>> {
        let row_number = row_id.row_number()?;
        let needed: Vec<usize> = (0..self.columns().len()).collect();
        self.read_row_by_number(txn, row_number, snapshot, &needed)
            .await
    }

    /// Locate and decode one row. If the owning stripe's write is still in
    /// progress and belongs to the calling transaction, the transaction's
    /// own write state is force-flushed first so it observes its own
    /// writes. A foreign in-progress stripe under a dirty snapshot yields
    /// an all-null placeholder: existence undetermined, the caller decides
    /// whether to wait.
    pub async fn read_row_by_number(
        &self,
        txn: &Transaction,
        row_number: u64,
        snapshot: &Snapshot,
        needed: &[usize],
    ) -> StorageResult<Option<Row>> {
        // Point lookups go through the catalog masks; push this
        // transaction's pending deletes down first so it sees them.
        self.shared
            .row_masks
            .flush_storage(&self.shared.meta, self.storage_id(), txn)?;
        let mut flushed_own_writes = false;
        loop {
            let Some(entry) =
                self.shared
                    .meta
                    .find_stripe_containing(self.storage_id(), row_number, snapshot)
            else {
                return Ok(None);
            };
            match entry.write_state(self.shared.txn_mgr.as_ref())? {
                StripeWriteState::Flushed => {
                    // The index lookup alone cannot tell "row not written
                    // yet" from "row in a later stripe"; re-check the bound.
                    if !entry.meta.covers_row(row_number) {
                        return Ok(None);
                    }
                    let ctx = self.read_context();
                    return read_row_in_stripe(
                        &ctx,
                        self.columns(),
                        needed,
                        snapshot,
                        &entry.meta,
                        row_number,
                    )
                    .await;
                }
                StripeWriteState::InProgress => {
                    if entry.version.insert.0 == txn.xid() {
                        if flushed_own_writes {
                            // Already flushed and the row still is not
                            // there: it was never written.
                            return Ok(None);
                        }
                        let ctx = self.write_context(txn);
                        self.shared
                            .write_states
                            .flush_relation(self.relation_id(), &ctx)
                            .await?;
                        flushed_own_writes = true;
                        continue;
                    }
                    if snapshot.is_dirty() {
                        // Existence undetermined: another transaction is
                        // still writing this stripe.
                        return Ok(Some(vec![
                            DataValue::Null;
                            self.columns().len()
                        ]));
                    }
                    return Ok(None);
                }
                StripeWriteState::Aborted => return Ok(None),
            }
        }
    }

    /// Open a scan. The calling transaction's pending writes and row-mask
    /// cache are flushed first, so the scan observes its own work through
    /// the ordinary catalog path.
    pub async fn begin_scan(
        &self,
        txn: &Transaction,
        snapshot: Snapshot,
        needed: impl IntoIterator<Item = usize>,
        predicate: Option<ScanPredicate>,
        cancel: CancellationToken,
    ) -> StorageResult<TableReadState> {
        let ctx = self.write_context(txn);
        self.shared
            .write_states
            .flush_relation(self.relation_id(), &ctx)
            .await?;
        self.shared
            .row_masks
            .flush_storage(&self.shared.meta, self.storage_id(), txn)?;

        let mut stripes = Vec::new();
        for entry in
            self.shared
                .meta
                .list_stripes(self.storage_id(), &snapshot, ScanDirection::Forward)
        {
            if entry.write_state(self.shared.txn_mgr.as_ref())? == StripeWriteState::Flushed {
                stripes.push(entry.meta);
            }
        }
        Ok(TableReadState::new(
            self.columns().clone(),
            needed,
            predicate,
            snapshot,
            stripes,
            cancel,
        ))
    }

    /// Scan for building a secondary index: every column, dirty snapshot,
    /// no predicate.
    pub async fn begin_index_build_scan(
        &self,
        txn: &Transaction,
        cancel: CancellationToken,
    ) -> StorageResult<TableReadState> {
        let needed: Vec<usize> = (0..self.columns().len()).collect();
        self.begin_scan(txn, txn.dirty_snapshot(), needed, None, cancel)
            .await
    }

    /// Run vacuum under the storage advisory lock. Interruption through the
    /// token surfaces as [`super::StorageError::Interrupted`] after partial
    /// progress was made durable.
    pub async fn vacuum(
        &self,
        txn: &Transaction,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        txn.acquire_storage_lock_with_timeout(self.storage_id())
            .await?;
        // Vacuum rewrites through the ordinary read path; its snapshot must
        // see the latest masks, so flush this transaction's cache first.
        self.shared
            .row_masks
            .flush_storage(&self.shared.meta, self.storage_id(), txn)?;
        let ctx = VacuumContext {
            txn,
            catalog: &self.shared.meta,
            storage: &self.storage,
            cache: &self.shared.cache,
            columns: self.columns(),
            options: self.options(),
        };
        compaction::vacuum(&ctx, cancel).await
    }
}
