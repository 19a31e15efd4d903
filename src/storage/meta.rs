// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Transactional metadata catalog.
//!
//! One logical table each for stripes, chunks, chunk groups and row masks,
//! held as versioned rows in ordered maps. Visibility and rollback are
//! inherited from the host transaction model: every row carries the
//! `(xid, subxid)` that inserted it and an optional delete mark, and readers
//! filter through their snapshot. Durability goes through the manifest: the
//! ops a transaction pushes while mutating the catalog are appended on
//! commit and replayed at engine open.
//!
//! Row masks and chunk-group delete counters are the deliberate exception to
//! MVCC: they are bounded-size mutable cells rewritten in place under the
//! storage advisory lock.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::compression::CompressionType;
use super::disk::PhysicalStorage;
use super::manifest::ManifestOp;
use super::{StorageError, StorageResult};
use crate::catalog::{ColumnId, StorageId};
use crate::transaction::{
    Snapshot, SubXid, Transaction, TransactionManager, TxnId, BOOTSTRAP_XID, TOP_SUB_XID,
};
use crate::types::DataValue;

/// Rows covered by one row-mask catalog row.
pub const ROW_MASK_CHUNK_SIZE: u64 = 512;

pub type StripeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub insert: (TxnId, SubXid),
    pub delete: Option<(TxnId, SubXid)>,
}

impl VersionInfo {
    fn new(txn: &Transaction) -> Self {
        Self {
            insert: (txn.xid(), txn.current_subxid()),
            delete: None,
        }
    }

    fn bootstrap() -> Self {
        Self {
            insert: (BOOTSTRAP_XID, TOP_SUB_XID),
            delete: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: VersionInfo,
    data: T,
}

impl<T> Versioned<T> {
    fn visible(&self, snapshot: &Snapshot) -> bool {
        snapshot.row_visible(self.version.insert, self.version.delete)
    }
}

/// Derived lifecycle state of a stripe row. There is no stored flag; the
/// state falls out of the field combination plus the fate of the inserting
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeWriteState {
    /// Reservation exists, data not yet written, writer still running.
    InProgress,
    /// Data and metadata are complete; the stripe is immutable.
    Flushed,
    /// Reservation whose writer rolled back; reclaimed by vacuum.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeMeta {
    pub storage_id: StorageId,
    pub stripe_id: StripeId,
    /// Start of the extent; 0 while reserved.
    pub file_offset: u64,
    pub data_length: u64,
    pub column_count: u32,
    /// Chunk group row limit in force when the stripe was written.
    pub chunk_group_row_limit: u64,
    pub row_count: u64,
    pub chunk_group_count: u32,
    pub first_row_number: u64,
}

impl StripeMeta {
    pub fn covers_row(&self, row_number: u64) -> bool {
        row_number >= self.first_row_number
            && row_number < self.first_row_number + self.row_count
    }

    /// One past the last byte of the extent.
    pub fn extent_end(&self) -> u64 {
        self.file_offset + self.data_length
    }

    fn is_flushed(&self) -> bool {
        self.row_count > 0 && self.chunk_group_count > 0 && self.data_length > 0
    }

    fn is_reserved(&self) -> bool {
        self.row_count == 0
            && self.chunk_group_count == 0
            && self.data_length == 0
            && self.file_offset == 0
    }
}

/// A stripe row together with its version, so callers can tell an
/// in-progress reservation of their own transaction from a foreign one.
#[derive(Debug, Clone)]
pub struct StripeEntry {
    pub meta: StripeMeta,
    pub version: VersionInfo,
}

impl StripeEntry {
    /// Classify the stripe, rejecting contradictory field combinations.
    pub fn write_state(&self, mgr: &TransactionManager) -> StorageResult<StripeWriteState> {
        if self.meta.is_flushed() {
            Ok(StripeWriteState::Flushed)
        } else if self.meta.is_reserved() {
            if mgr.is_committed(self.version.insert.0) {
                // A committed transaction always completes its reservations
                // before commit; a committed reserved row is corruption.
                Err(StorageError::Corrupted(format!(
                    "stripe {} of storage {} committed while still reserved",
                    self.meta.stripe_id, self.meta.storage_id
                )))
            } else if mgr.is_aborted_or_gone(self.version.insert.0) {
                Ok(StripeWriteState::Aborted)
            } else {
                Ok(StripeWriteState::InProgress)
            }
        } else {
            Err(StorageError::Corrupted(format!(
                "stripe {} of storage {} has inconsistent metadata \
                 (row_count={}, chunk_group_count={}, data_length={}, file_offset={})",
                self.meta.stripe_id,
                self.meta.storage_id,
                self.meta.row_count,
                self.meta.chunk_group_count,
                self.meta.data_length,
                self.meta.file_offset
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub storage_id: StorageId,
    pub stripe_id: StripeId,
    pub chunk_group: u32,
    pub column: ColumnId,
    /// Min/max over non-null values; `None` when the chunk is all-null.
    pub minimum: Option<DataValue>,
    pub maximum: Option<DataValue>,
    /// Offsets are relative to the stripe extent.
    pub value_offset: u64,
    pub value_length: u64,
    pub exists_offset: u64,
    pub exists_length: u64,
    pub value_compression: CompressionType,
    pub compression_level: i32,
    pub value_decompressed_size: u64,
    pub value_count: u64,
    /// crc32 over the stored value and existence streams.
    pub checksum: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkGroupMeta {
    pub storage_id: StorageId,
    pub stripe_id: StripeId,
    pub chunk_group: u32,
    pub row_count: u64,
    pub deleted_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMaskMeta {
    pub id: u64,
    pub storage_id: StorageId,
    pub stripe_id: StripeId,
    pub chunk_group: u32,
    pub start_row_number: u64,
    /// Inclusive.
    pub end_row_number: u64,
    pub deleted_rows: u64,
    /// One bit per row in `[start, end]`, LSB-first within each byte;
    /// set means deleted. Bits are set, never cleared.
    pub mask: Vec<u8>,
}

impl RowMaskMeta {
    pub fn covers_row(&self, row_number: u64) -> bool {
        row_number >= self.start_row_number && row_number <= self.end_row_number
    }

    pub fn bit(&self, row_number: u64) -> bool {
        let idx = (row_number - self.start_row_number) as usize;
        self.mask[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn set_bit(&mut self, row_number: u64) {
        let idx = (row_number - self.start_row_number) as usize;
        self.mask[idx / 8] |= 1 << (idx % 8);
    }
}

/// Chunk metadata of one stripe organized for the read path:
/// `chunks[group][column]`.
pub struct StripeSkipList {
    pub chunk_groups: Vec<ChunkGroupMeta>,
    pub chunks: Vec<Vec<ChunkMeta>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

#[derive(Default)]
struct CatalogInner {
    stripes: BTreeMap<(StorageId, StripeId), Versioned<StripeMeta>>,
    /// Ordered index over `first_row_number`; row numbers are never reused,
    /// so the key is unique per storage.
    first_row_index: BTreeMap<(StorageId, u64), StripeId>,
    chunks: BTreeMap<(StorageId, StripeId, u32, ColumnId), Versioned<ChunkMeta>>,
    chunk_groups: BTreeMap<(StorageId, StripeId, u32), Versioned<ChunkGroupMeta>>,
    /// Keyed by the range start; mask ranges within a storage are disjoint.
    row_masks: BTreeMap<(StorageId, u64), Versioned<RowMaskMeta>>,
    row_mask_ids: HashMap<u64, (StorageId, u64)>,
    next_row_mask_id: u64,
}

/// The transactional catalog shared by every table of one engine instance.
pub struct MetadataCatalog {
    inner: RwLock<CatalogInner>,
}

impl Default for MetadataCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner {
                next_row_mask_id: 1,
                ..CatalogInner::default()
            }),
        }
    }

    /// Reserve a stripe id and a run of row numbers, inserting a
    /// reserved-state catalog row. The reservation is write-then-read-back
    /// under the host's guarantees: if the transaction aborts, the row is
    /// simply never visible and vacuum purges it later.
    pub fn reserve_stripe(
        &self,
        txn: &Transaction,
        storage: &PhysicalStorage,
        column_count: u32,
        chunk_group_row_limit: u64,
        row_reservation: u64,
    ) -> StorageResult<StripeMeta> {
        let stripe_id = storage.reserve_stripe_id()?;
        let first_row_number = storage.reserve_row_numbers(row_reservation)?;
        let meta = StripeMeta {
            storage_id: storage.storage_id(),
            stripe_id,
            file_offset: 0,
            data_length: 0,
            column_count,
            chunk_group_row_limit,
            row_count: 0,
            chunk_group_count: 0,
            first_row_number,
        };
        let mut inner = self.inner.write();
        inner.stripes.insert(
            (meta.storage_id, stripe_id),
            Versioned {
                version: VersionInfo::new(txn),
                data: meta.clone(),
            },
        );
        inner
            .first_row_index
            .insert((meta.storage_id, first_row_number), stripe_id);
        Ok(meta)
    }

    /// Fill in a reserved stripe after its extent hit the disk, and record
    /// the per-chunk and per-group metadata in the same step. Only the
    /// reserving transaction ever completes a stripe.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_stripe(
        &self,
        txn: &Transaction,
        storage_id: StorageId,
        stripe_id: StripeId,
        file_offset: u64,
        data_length: u64,
        row_count: u64,
        chunks: Vec<ChunkMeta>,
        chunk_groups: Vec<ChunkGroupMeta>,
    ) -> StorageResult<StripeMeta> {
        let mut inner = self.inner.write();
        let row = inner
            .stripes
            .get_mut(&(storage_id, stripe_id))
            .ok_or_else(|| StorageError::NotFound("stripe", stripe_id.to_string()))?;
        if row.version.insert.0 != txn.xid() {
            return Err(StorageError::Corrupted(format!(
                "stripe {} completed by transaction {} but reserved by {}",
                stripe_id,
                txn.xid(),
                row.version.insert.0
            )));
        }
        row.data.file_offset = file_offset;
        row.data.data_length = data_length;
        row.data.row_count = row_count;
        row.data.chunk_group_count = chunk_groups.len() as u32;
        let meta = row.data.clone();

        for group in &chunk_groups {
            inner.chunk_groups.insert(
                (storage_id, stripe_id, group.chunk_group),
                Versioned {
                    version: VersionInfo::new(txn),
                    data: group.clone(),
                },
            );
        }
        for chunk in &chunks {
            inner.chunks.insert(
                (storage_id, stripe_id, chunk.chunk_group, chunk.column),
                Versioned {
                    version: VersionInfo::new(txn),
                    data: chunk.clone(),
                },
            );
        }
        txn.push_manifest_op(ManifestOp::AddStripe {
            stripe: meta.clone(),
            chunks,
            chunk_groups,
        });
        Ok(meta)
    }

    /// Create the all-zero masks for a freshly flushed stripe: one row per
    /// `ROW_MASK_CHUNK_SIZE`-sized subrange of each chunk group. Returns
    /// `false` without escalating when a mask for a subrange already exists
    /// (a create-time race surfaced as a uniqueness violation); rows created
    /// before the collision stay.
    pub fn save_empty_row_masks(
        &self,
        txn: &Transaction,
        storage_id: StorageId,
        stripe_id: StripeId,
        stripe_first_row_number: u64,
        chunk_group_row_counts: &[u64],
    ) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        let mut start = stripe_first_row_number;
        for (group, &row_count) in chunk_group_row_counts.iter().enumerate() {
            let mut remaining = row_count;
            while remaining > 0 {
                let span = remaining.min(ROW_MASK_CHUNK_SIZE);
                let end = start + span - 1;
                if inner.row_masks.contains_key(&(storage_id, start)) {
                    return Ok(false);
                }
                let id = inner.next_row_mask_id;
                inner.next_row_mask_id += 1;
                let meta = RowMaskMeta {
                    id,
                    storage_id,
                    stripe_id,
                    chunk_group: group as u32,
                    start_row_number: start,
                    end_row_number: end,
                    deleted_rows: 0,
                    mask: vec![0u8; span.div_ceil(8) as usize],
                };
                inner.row_mask_ids.insert(id, (storage_id, start));
                inner.row_masks.insert(
                    (storage_id, start),
                    Versioned {
                        version: VersionInfo::new(txn),
                        data: meta.clone(),
                    },
                );
                txn.push_manifest_op(ManifestOp::AddRowMask { mask: meta });
                start = end + 1;
                remaining -= span;
            }
        }
        Ok(true)
    }

    /// Find-less-or-equal lookup: the stripe whose `first_row_number` is the
    /// greatest one not above `row_number`, visible under `snapshot`. The
    /// caller must still check [`StripeMeta::covers_row`]: the index alone
    /// cannot distinguish "row does not exist" from "row is in a later,
    /// not-yet-visible stripe".
    pub fn find_stripe_containing(
        &self,
        storage_id: StorageId,
        row_number: u64,
        snapshot: &Snapshot,
    ) -> Option<StripeEntry> {
        let inner = self.inner.read();
        inner
            .first_row_index
            .range((
                Bound::Included((storage_id, 0)),
                Bound::Included((storage_id, row_number)),
            ))
            .rev()
            .find_map(|(_, &stripe_id)| {
                let row = inner.stripes.get(&(storage_id, stripe_id))?;
                row.visible(snapshot).then(|| StripeEntry {
                    meta: row.data.clone(),
                    version: row.version,
                })
            })
    }

    /// Find-greater lookup: the first visible stripe whose
    /// `first_row_number` is strictly above `row_number`. Used to find the
    /// next stripe boundary when partitioning work.
    pub fn find_next_stripe(
        &self,
        storage_id: StorageId,
        row_number: u64,
        snapshot: &Snapshot,
    ) -> Option<StripeEntry> {
        let inner = self.inner.read();
        inner
            .first_row_index
            .range((
                Bound::Excluded((storage_id, row_number)),
                Bound::Included((storage_id, u64::MAX)),
            ))
            .find_map(|(_, &stripe_id)| {
                let row = inner.stripes.get(&(storage_id, stripe_id))?;
                row.visible(snapshot).then(|| StripeEntry {
                    meta: row.data.clone(),
                    version: row.version,
                })
            })
    }

    pub fn find_stripe_with_highest_row_number(
        &self,
        storage_id: StorageId,
        snapshot: &Snapshot,
    ) -> Option<StripeEntry> {
        self.find_stripe_containing(storage_id, u64::MAX, snapshot)
    }

    /// All visible stripes of a storage in `first_row_number` order.
    pub fn list_stripes(
        &self,
        storage_id: StorageId,
        snapshot: &Snapshot,
        direction: ScanDirection,
    ) -> Vec<StripeEntry> {
        let inner = self.inner.read();
        let mut stripes: Vec<StripeEntry> = inner
            .first_row_index
            .range((
                Bound::Included((storage_id, 0)),
                Bound::Included((storage_id, u64::MAX)),
            ))
            .filter_map(|(_, &stripe_id)| {
                let row = inner.stripes.get(&(storage_id, stripe_id))?;
                row.visible(snapshot).then(|| StripeEntry {
                    meta: row.data.clone(),
                    version: row.version,
                })
            })
            .collect();
        if direction == ScanDirection::Backward {
            stripes.reverse();
        }
        stripes
    }

    /// Mark a stripe and its dependent rows deleted. Old snapshots keep
    /// seeing them; the physical rows disappear in [`Self::purge`].
    pub fn delete_stripe(
        &self,
        txn: &Transaction,
        storage_id: StorageId,
        stripe_id: StripeId,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let mark = Some((txn.xid(), txn.current_subxid()));
        let row = inner
            .stripes
            .get_mut(&(storage_id, stripe_id))
            .ok_or_else(|| StorageError::NotFound("stripe", stripe_id.to_string()))?;
        row.version.delete = mark;
        for (_, chunk) in inner
            .chunks
            .range_mut((storage_id, stripe_id, 0, 0)..=(storage_id, stripe_id, u32::MAX, u32::MAX))
        {
            chunk.version.delete = mark;
        }
        for (_, group) in inner
            .chunk_groups
            .range_mut((storage_id, stripe_id, 0)..=(storage_id, stripe_id, u32::MAX))
        {
            group.version.delete = mark;
        }
        let mask_keys: Vec<(StorageId, u64)> = inner
            .row_masks
            .range((storage_id, 0)..=(storage_id, u64::MAX))
            .filter(|(_, mask)| mask.data.stripe_id == stripe_id)
            .map(|(&key, _)| key)
            .collect();
        for key in mask_keys {
            inner.row_masks.get_mut(&key).unwrap().version.delete = mark;
        }
        txn.push_manifest_op(ManifestOp::DeleteStripe {
            storage_id,
            stripe_id,
        });
        Ok(())
    }

    /// Physically drop every catalog row of a storage. Drop-table path.
    pub fn delete_all_for_storage(&self, storage_id: StorageId) {
        let mut inner = self.inner.write();
        inner.stripes.retain(|&(sid, _), _| sid != storage_id);
        inner.first_row_index.retain(|&(sid, _), _| sid != storage_id);
        inner.chunks.retain(|&(sid, ..), _| sid != storage_id);
        inner.chunk_groups.retain(|&(sid, ..), _| sid != storage_id);
        let removed: Vec<u64> = inner
            .row_masks
            .iter()
            .filter(|(&(sid, _), _)| sid == storage_id)
            .map(|(_, mask)| mask.data.id)
            .collect();
        for id in removed {
            inner.row_mask_ids.remove(&id);
        }
        inner.row_masks.retain(|&(sid, _), _| sid != storage_id);
    }

    /// Physically remove rows no live snapshot can see: inserts of aborted
    /// transactions and delete-marked rows whose deleter committed. Called
    /// by vacuum under the storage's exclusive lock, when no snapshot of
    /// this storage is older than the vacuum's own.
    pub fn purge(&self, storage_id: StorageId, mgr: &TransactionManager) -> usize {
        let dead = |version: &VersionInfo| -> bool {
            if mgr.is_aborted_or_gone(version.insert.0) && version.insert.0 != BOOTSTRAP_XID {
                return true;
            }
            matches!(version.delete, Some((xid, _)) if mgr.is_committed(xid))
        };
        let mut inner = self.inner.write();
        let mut purged = 0;
        let dead_stripes: Vec<(StripeId, u64)> = inner
            .stripes
            .iter()
            .filter(|(&(sid, _), row)| sid == storage_id && dead(&row.version))
            .map(|(&(_, stripe_id), row)| (stripe_id, row.data.first_row_number))
            .collect();
        for (stripe_id, first_row_number) in dead_stripes {
            inner.stripes.remove(&(storage_id, stripe_id));
            inner.first_row_index.remove(&(storage_id, first_row_number));
            purged += 1;
        }
        inner
            .chunks
            .retain(|&(sid, ..), row| sid != storage_id || !dead(&row.version));
        inner
            .chunk_groups
            .retain(|&(sid, ..), row| sid != storage_id || !dead(&row.version));
        let dead_masks: Vec<(u64, (StorageId, u64))> = inner
            .row_masks
            .iter()
            .filter(|(&(sid, _), row)| sid == storage_id && dead(&row.version))
            .map(|(&key, row)| (row.data.id, key))
            .collect();
        for (id, key) in dead_masks {
            inner.row_mask_ids.remove(&id);
            inner.row_masks.remove(&key);
        }
        if purged > 0 {
            debug!(storage_id, purged, "purged dead stripe metadata");
        }
        purged
    }

    /// Chunk metadata for one flushed stripe, shaped for the read path. The
    /// counts must agree with the stripe row; anything else is corruption.
    pub fn read_stripe_skip_list(
        &self,
        stripe: &StripeMeta,
        snapshot: &Snapshot,
    ) -> StorageResult<StripeSkipList> {
        let inner = self.inner.read();
        let mut chunk_groups = Vec::with_capacity(stripe.chunk_group_count as usize);
        for (_, row) in inner.chunk_groups.range(
            (stripe.storage_id, stripe.stripe_id, 0)
                ..=(stripe.storage_id, stripe.stripe_id, u32::MAX),
        ) {
            if row.visible(snapshot) {
                chunk_groups.push(row.data.clone());
            }
        }
        if chunk_groups.len() != stripe.chunk_group_count as usize {
            return Err(StorageError::Corrupted(format!(
                "stripe {} of storage {} declares {} chunk groups, catalog has {}",
                stripe.stripe_id,
                stripe.storage_id,
                stripe.chunk_group_count,
                chunk_groups.len()
            )));
        }
        let mut chunks: Vec<Vec<ChunkMeta>> =
            vec![Vec::with_capacity(stripe.column_count as usize); chunk_groups.len()];
        for (_, row) in inner.chunks.range(
            (stripe.storage_id, stripe.stripe_id, 0, 0)
                ..=(stripe.storage_id, stripe.stripe_id, u32::MAX, u32::MAX),
        ) {
            if row.visible(snapshot) {
                let group = row.data.chunk_group as usize;
                chunks
                    .get_mut(group)
                    .ok_or_else(|| {
                        StorageError::Corrupted(format!(
                            "chunk of stripe {} references chunk group {} beyond the stripe's {}",
                            stripe.stripe_id, group, stripe.chunk_group_count
                        ))
                    })?
                    .push(row.data.clone());
            }
        }
        for (group, group_chunks) in chunks.iter().enumerate() {
            if group_chunks.len() != stripe.column_count as usize {
                return Err(StorageError::Corrupted(format!(
                    "chunk group {} of stripe {} has {} chunks for {} columns",
                    group,
                    stripe.stripe_id,
                    group_chunks.len(),
                    stripe.column_count
                )));
            }
        }
        Ok(StripeSkipList {
            chunk_groups,
            chunks,
        })
    }

    /// Current deleted-row total of a stripe, from the chunk group counters.
    pub fn deleted_rows_for_stripe(
        &self,
        storage_id: StorageId,
        stripe_id: StripeId,
        snapshot: &Snapshot,
    ) -> u64 {
        let inner = self.inner.read();
        inner
            .chunk_groups
            .range((storage_id, stripe_id, 0)..=(storage_id, stripe_id, u32::MAX))
            .filter(|(_, row)| row.visible(snapshot))
            .map(|(_, row)| row.data.deleted_rows)
            .sum()
    }

    pub fn chunk_group(
        &self,
        storage_id: StorageId,
        stripe_id: StripeId,
        chunk_group: u32,
        snapshot: &Snapshot,
    ) -> Option<ChunkGroupMeta> {
        let inner = self.inner.read();
        inner
            .chunk_groups
            .get(&(storage_id, stripe_id, chunk_group))
            .filter(|row| row.visible(snapshot))
            .map(|row| row.data.clone())
    }

    /// Sum of decompressed chunk sizes; drives the vacuum combine cap.
    pub fn decompressed_length_for_stripe(
        &self,
        storage_id: StorageId,
        stripe_id: StripeId,
        snapshot: &Snapshot,
    ) -> u64 {
        let inner = self.inner.read();
        inner
            .chunks
            .range((storage_id, stripe_id, 0, 0)..=(storage_id, stripe_id, u32::MAX, u32::MAX))
            .filter(|(_, row)| row.visible(snapshot))
            .map(|(_, row)| row.data.value_decompressed_size)
            .sum()
    }

    /// Total visible row count of a storage, from stripe metadata alone.
    pub fn total_row_count(&self, storage_id: StorageId, snapshot: &Snapshot) -> u64 {
        self.list_stripes(storage_id, snapshot, ScanDirection::Forward)
            .iter()
            .map(|entry| entry.meta.row_count)
            .sum()
    }

    /// Backward ordered lookup of the mask covering `row_number`. Returns a
    /// snapshot copy of the current cell; `None` means the row belongs to a
    /// not-yet-visible (speculative) insert.
    pub fn find_row_mask(
        &self,
        storage_id: StorageId,
        row_number: u64,
        snapshot: &Snapshot,
    ) -> Option<RowMaskMeta> {
        let inner = self.inner.read();
        inner
            .row_masks
            .range((
                Bound::Included((storage_id, 0)),
                Bound::Included((storage_id, row_number)),
            ))
            .rev()
            .find_map(|(_, row)| {
                (row.visible(snapshot) && row.data.covers_row(row_number))
                    .then(|| row.data.clone())
            })
    }

    /// All visible masks overlapping a stripe, keyed by range start.
    pub fn row_masks_for_stripe(
        &self,
        storage_id: StorageId,
        stripe_id: StripeId,
        snapshot: &Snapshot,
    ) -> Vec<RowMaskMeta> {
        let inner = self.inner.read();
        inner
            .row_masks
            .range((storage_id, 0)..=(storage_id, u64::MAX))
            .filter(|(_, row)| row.data.stripe_id == stripe_id && row.visible(snapshot))
            .map(|(_, row)| row.data.clone())
            .collect()
    }

    /// Write a flushed mask cell back in place and fold the delete delta
    /// into the owning chunk group. The caller holds the storage advisory
    /// lock; this is the documented exception to row versioning.
    pub fn write_row_mask(
        &self,
        txn: &Transaction,
        mask_id: u64,
        mask: &[u8],
        deleted_rows: u64,
        delta: u64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let key = *inner
            .row_mask_ids
            .get(&mask_id)
            .ok_or_else(|| StorageError::NotFound("row mask", mask_id.to_string()))?;
        let row = inner.row_masks.get_mut(&key).unwrap();
        // Merge rather than overwrite: the same cache entry flushes again at
        // commit after a scan-time flush, and bits are only ever set.
        for (stored, fresh) in row.data.mask.iter_mut().zip(mask) {
            *stored |= fresh;
        }
        row.data.deleted_rows = row.data.deleted_rows.max(deleted_rows);
        let (storage_id, stripe_id, chunk_group) =
            (row.data.storage_id, row.data.stripe_id, row.data.chunk_group);
        let (mask_bytes, mask_deleted) = (row.data.mask.clone(), row.data.deleted_rows);
        let group = inner
            .chunk_groups
            .get_mut(&(storage_id, stripe_id, chunk_group))
            .ok_or_else(|| {
                StorageError::Corrupted(format!(
                    "row mask {} points at missing chunk group {} of stripe {}",
                    mask_id, chunk_group, stripe_id
                ))
            })?;
        group.data.deleted_rows += delta;
        let group_deleted = group.data.deleted_rows;
        txn.push_manifest_op(ManifestOp::UpdateRowMask {
            mask_id,
            deleted_rows: mask_deleted,
            mask: mask_bytes,
        });
        txn.push_manifest_op(ManifestOp::UpdateChunkGroup {
            storage_id,
            stripe_id,
            chunk_group,
            deleted_rows: group_deleted,
        });
        Ok(())
    }

    /// Rewrite only the extent offset of a relocated stripe (vacuum's
    /// hole-filling pass; the bytes themselves were copied verbatim).
    pub fn update_stripe_location(
        &self,
        txn: &Transaction,
        storage_id: StorageId,
        stripe_id: StripeId,
        file_offset: u64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let row = inner
            .stripes
            .get_mut(&(storage_id, stripe_id))
            .ok_or_else(|| StorageError::NotFound("stripe", stripe_id.to_string()))?;
        row.data.file_offset = file_offset;
        txn.push_manifest_op(ManifestOp::RelocateStripe {
            storage_id,
            stripe_id,
            file_offset,
        });
        Ok(())
    }

    /// Replay one committed manifest op at engine open.
    pub(super) fn apply_manifest_op(&self, op: &ManifestOp) -> StorageResult<()> {
        let mut inner = self.inner.write();
        match op {
            ManifestOp::AddStripe {
                stripe,
                chunks,
                chunk_groups,
            } => {
                inner.first_row_index.insert(
                    (stripe.storage_id, stripe.first_row_number),
                    stripe.stripe_id,
                );
                inner.stripes.insert(
                    (stripe.storage_id, stripe.stripe_id),
                    Versioned {
                        version: VersionInfo::bootstrap(),
                        data: stripe.clone(),
                    },
                );
                for group in chunk_groups {
                    inner.chunk_groups.insert(
                        (group.storage_id, group.stripe_id, group.chunk_group),
                        Versioned {
                            version: VersionInfo::bootstrap(),
                            data: group.clone(),
                        },
                    );
                }
                for chunk in chunks {
                    inner.chunks.insert(
                        (chunk.storage_id, chunk.stripe_id, chunk.chunk_group, chunk.column),
                        Versioned {
                            version: VersionInfo::bootstrap(),
                            data: chunk.clone(),
                        },
                    );
                }
            }
            ManifestOp::AddRowMask { mask } => {
                inner.next_row_mask_id = inner.next_row_mask_id.max(mask.id + 1);
                inner
                    .row_mask_ids
                    .insert(mask.id, (mask.storage_id, mask.start_row_number));
                inner.row_masks.insert(
                    (mask.storage_id, mask.start_row_number),
                    Versioned {
                        version: VersionInfo::bootstrap(),
                        data: mask.clone(),
                    },
                );
            }
            ManifestOp::UpdateRowMask {
                mask_id,
                deleted_rows,
                mask,
            } => {
                if let Some(&key) = inner.row_mask_ids.get(mask_id) {
                    let row = inner.row_masks.get_mut(&key).unwrap();
                    row.data.mask = mask.clone();
                    row.data.deleted_rows = *deleted_rows;
                }
            }
            ManifestOp::UpdateChunkGroup {
                storage_id,
                stripe_id,
                chunk_group,
                deleted_rows,
            } => {
                if let Some(row) = inner
                    .chunk_groups
                    .get_mut(&(*storage_id, *stripe_id, *chunk_group))
                {
                    row.data.deleted_rows = *deleted_rows;
                }
            }
            ManifestOp::DeleteStripe {
                storage_id,
                stripe_id,
            } => {
                if let Some(row) = inner.stripes.remove(&(*storage_id, *stripe_id)) {
                    inner
                        .first_row_index
                        .remove(&(*storage_id, row.data.first_row_number));
                }
                inner.chunks.retain(|&(sid, stripe, ..), _| {
                    sid != *storage_id || stripe != *stripe_id
                });
                inner.chunk_groups.retain(|&(sid, stripe, _), _| {
                    sid != *storage_id || stripe != *stripe_id
                });
                let dead: Vec<(u64, (StorageId, u64))> = inner
                    .row_masks
                    .iter()
                    .filter(|(&(sid, _), row)| sid == *storage_id && row.data.stripe_id == *stripe_id)
                    .map(|(&key, row)| (row.data.id, key))
                    .collect();
                for (id, key) in dead {
                    inner.row_mask_ids.remove(&id);
                    inner.row_masks.remove(&key);
                }
            }
            ManifestOp::RelocateStripe {
                storage_id,
                stripe_id,
                file_offset,
            } => {
                if let Some(row) = inner.stripes.get_mut(&(*storage_id, *stripe_id)) {
                    row.data.file_offset = *file_offset;
                }
            }
            // Table-level ops are handled by the engine bootstrap.
            _ => {}
        }
        Ok(())
    }
}
