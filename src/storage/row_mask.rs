// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Row-level deletion bitmaps and their transaction-scoped write cache.
//!
//! Masks live in the catalog as bounded mutable cells (the deliberate MVCC
//! exception) but are mutated through an in-memory cache first: the catalog
//! is consulted at most once per mask per subtransaction, every further
//! delete against the same range hits the cache, and the cache is written
//! back at commit and at scan start. All of this runs under the storage's
//! advisory lock, acquired by the table layer and held to transaction end,
//! so concurrent deleters serialize instead of racing on bit flips.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::meta::{MetadataCatalog, RowMaskMeta};
use super::StorageResult;
use crate::catalog::StorageId;
use crate::transaction::{Snapshot, SubXid, Transaction, TxnId};

/// One cached mask cell, loaded from the catalog on first touch.
struct RowMaskWriteStateEntry {
    meta: RowMaskMeta,
    /// `deleted_rows` as of the last write-back; the flush delta for the
    /// chunk group counter is measured against this.
    flushed_deleted_rows: u64,
    dirty: bool,
}

struct RowMaskFrame {
    subxid: SubXid,
    entries: Vec<RowMaskWriteStateEntry>,
    /// Most deletes cluster; remember the entry that served the last hit.
    last_hit: usize,
}

impl RowMaskFrame {
    fn find_entry(&mut self, row_number: u64) -> Option<&mut RowMaskWriteStateEntry> {
        if let Some(entry) = self.entries.get(self.last_hit) {
            if entry.meta.covers_row(row_number) {
                return self.entries.get_mut(self.last_hit);
            }
        }
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.meta.covers_row(row_number))?;
        self.last_hit = idx;
        self.entries.get_mut(idx)
    }
}

/// Registry of row-mask write states keyed by `(storage, transaction)`,
/// with the same subtransaction stack discipline as the write states.
#[derive(Default)]
pub struct RowMaskManager {
    map: Mutex<HashMap<(StorageId, TxnId), Vec<RowMaskFrame>>>,
}

impl RowMaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deletion bit for `row_number`. Returns `false` when the row
    /// cannot be deleted: the bit was already set (a concurrent or earlier
    /// delete won) or no mask covers the row (the row belongs to a
    /// speculative, not-yet-visible insert). Both are recoverable caller
    /// conditions, not errors.
    ///
    /// The caller holds the storage advisory lock.
    pub fn mark_deleted(
        &self,
        catalog: &MetadataCatalog,
        storage_id: StorageId,
        txn: &Transaction,
        snapshot: &Snapshot,
        row_number: u64,
    ) -> StorageResult<bool> {
        let subxid = txn.current_subxid();
        let mut map = self.map.lock();
        let frames = map.entry((storage_id, txn.xid())).or_default();
        let frame_idx = match frames.iter().rposition(|frame| frame.subxid == subxid) {
            Some(idx) => idx,
            None => {
                frames.push(RowMaskFrame {
                    subxid,
                    entries: Vec::new(),
                    last_hit: 0,
                });
                frames.len() - 1
            }
        };
        let frame = &mut frames[frame_idx];

        if frame.find_entry(row_number).is_none() {
            // First touch of this range in this subtransaction: a single
            // catalog lookup, cached for the rest of the subtransaction.
            let Some(meta) = catalog.find_row_mask(storage_id, row_number, snapshot) else {
                return Ok(false);
            };
            let flushed = meta.deleted_rows;
            frame.entries.push(RowMaskWriteStateEntry {
                meta,
                flushed_deleted_rows: flushed,
                dirty: false,
            });
            frame.last_hit = frame.entries.len() - 1;
        }
        let entry = frame.find_entry(row_number).unwrap();
        if entry.meta.bit(row_number) {
            // Row already gone, possibly while this transaction waited on
            // the advisory lock.
            return Ok(false);
        }
        entry.meta.set_bit(row_number);
        entry.meta.deleted_rows += 1;
        entry.dirty = true;
        Ok(true)
    }

    /// Write every dirty cached cell of this storage back to the catalog.
    /// Runs at subtransaction pre-commit and at scan start; entries stay
    /// cached, so a later flush only carries the new delta.
    pub fn flush_storage(
        &self,
        catalog: &MetadataCatalog,
        storage_id: StorageId,
        txn: &Transaction,
    ) -> StorageResult<()> {
        let mut map = self.map.lock();
        let Some(frames) = map.get_mut(&(storage_id, txn.xid())) else {
            return Ok(());
        };
        for frame in frames.iter_mut() {
            for entry in frame.entries.iter_mut().filter(|entry| entry.dirty) {
                let delta = entry.meta.deleted_rows - entry.flushed_deleted_rows;
                catalog.write_row_mask(
                    txn,
                    entry.meta.id,
                    &entry.meta.mask,
                    entry.meta.deleted_rows,
                    delta,
                )?;
                entry.flushed_deleted_rows = entry.meta.deleted_rows;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// Storages this transaction holds cached masks for.
    pub fn storages_of(&self, txn: &Transaction) -> Vec<StorageId> {
        self.map
            .lock()
            .keys()
            .filter(|(_, xid)| *xid == txn.xid())
            .map(|(storage_id, _)| *storage_id)
            .collect()
    }

    /// Subtransaction commit: elevate the child's entries to the parent
    /// scope, merging cells both scopes touched.
    pub fn subtransaction_commit(&self, txn: &Transaction, child: SubXid, parent: SubXid) {
        let mut map = self.map.lock();
        for ((_, xid), frames) in map.iter_mut() {
            if *xid != txn.xid() {
                continue;
            }
            let Some(child_idx) = frames.iter().position(|frame| frame.subxid == child) else {
                continue;
            };
            let child_frame = frames.remove(child_idx);
            let parent_idx = match frames.iter().rposition(|frame| frame.subxid == parent) {
                Some(idx) => idx,
                None => {
                    frames.push(RowMaskFrame {
                        subxid: parent,
                        entries: Vec::new(),
                        last_hit: 0,
                    });
                    frames.len() - 1
                }
            };
            let parent_frame = &mut frames[parent_idx];
            for entry in child_frame.entries {
                match parent_frame
                    .entries
                    .iter_mut()
                    .find(|existing| existing.meta.id == entry.meta.id)
                {
                    Some(existing) => {
                        for (byte, child_byte) in
                            existing.meta.mask.iter_mut().zip(&entry.meta.mask)
                        {
                            *byte |= child_byte;
                        }
                        // Recount instead of summing deltas: both scopes may
                        // have set the same bit.
                        existing.meta.deleted_rows = existing
                            .meta
                            .mask
                            .iter()
                            .map(|byte| byte.count_ones() as u64)
                            .sum();
                        existing.flushed_deleted_rows =
                            existing.flushed_deleted_rows.min(entry.flushed_deleted_rows);
                        existing.dirty = true;
                    }
                    None => parent_frame.entries.push(entry),
                }
            }
            parent_frame.last_hit = 0;
        }
    }

    /// Subtransaction abort: discard the child's entries; the catalog masks
    /// were never touched.
    pub fn subtransaction_abort(&self, txn: &Transaction, child: SubXid) {
        let mut map = self.map.lock();
        for ((_, xid), frames) in map.iter_mut() {
            if *xid == txn.xid() {
                frames.retain(|frame| frame.subxid != child);
            }
        }
    }

    /// Transaction cleanup hook: drop all cached state.
    pub fn release(&self, txn: &Transaction) {
        self.map.lock().retain(|(_, xid), _| *xid != txn.xid());
    }
}
