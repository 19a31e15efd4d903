// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Read path: snapshot scans over stripes with chunk-skip filtering.
//!
//! A scan walks the visible stripes in row-number order. Per chunk group it
//! first consults the chunk min/max of the predicate column: if no value in
//! `[min, max]` can satisfy the predicate, the whole group is skipped
//! without touching the data file. Otherwise the needed chunks are
//! decompressed (through the shared chunk cache) into column vectors and
//! rows are yielded, skipping any row whose deletion bit is set.

use std::collections::VecDeque;
use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use moka::future::Cache;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use super::checksum::verify_stream_checksum;
use super::compression::decompress;
use super::disk::PhysicalStorage;
use super::meta::{ChunkMeta, MetadataCatalog, RowMaskMeta, StripeMeta, StripeSkipList};
use super::{StorageError, StorageResult};
use crate::catalog::{ColumnDesc, StorageId};
use crate::transaction::Snapshot;
use crate::types::{DataValue, Row};

/// Cache key of one decoded chunk.
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct ChunkCacheKey {
    pub storage_id: StorageId,
    pub stripe_id: u64,
    pub chunk_group: u32,
    pub column: u32,
}

/// Decoded chunk: one value per row of the chunk group, nulls restored from
/// the existence stream.
pub type DecodedChunk = Arc<Vec<DataValue>>;

pub type ChunkCache = Cache<ChunkCacheKey, DecodedChunk>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single-column comparison predicate, used only for chunk pruning. The
/// min/max check is a bound, not exact filtering: surviving chunks may still
/// contain no matching row, and the caller re-evaluates per row.
#[derive(Debug, Clone)]
pub struct ScanPredicate {
    pub column: usize,
    pub op: CmpOp,
    pub value: DataValue,
}

impl ScanPredicate {
    /// Whether some value in `[min, max]` could satisfy the predicate.
    pub fn may_match_range(&self, min: &DataValue, max: &DataValue) -> bool {
        match self.op {
            CmpOp::Eq => {
                min.compare(&self.value).is_le() && max.compare(&self.value).is_ge()
            }
            CmpOp::Lt => min.compare(&self.value).is_lt(),
            CmpOp::Le => min.compare(&self.value).is_le(),
            CmpOp::Gt => max.compare(&self.value).is_gt(),
            CmpOp::Ge => max.compare(&self.value).is_ge(),
        }
    }
}

/// Counters exposed for observability; tests use them to prove pruning
/// happened (or did not).
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadStats {
    /// Chunk groups skipped entirely on min/max evidence.
    pub chunk_groups_filtered: u64,
    /// Chunks actually requested from disk or cache.
    pub chunks_loaded: u64,
}

/// Everything the read path needs from the surrounding engine.
pub struct ReadContext<'a> {
    pub catalog: &'a MetadataCatalog,
    pub storage: &'a PhysicalStorage,
    pub cache: &'a ChunkCache,
}

/// Read and decode one chunk, bypassing the cache.
fn load_chunk_from_disk(
    storage: &PhysicalStorage,
    columns: &[ColumnDesc],
    stripe: &StripeMeta,
    chunk: &ChunkMeta,
    row_count: u64,
) -> StorageResult<Vec<DataValue>> {
    let value_bytes = storage.read_at(
        stripe.file_offset + chunk.value_offset,
        chunk.value_length,
    )?;
    let exists_bytes = storage.read_at(
        stripe.file_offset + chunk.exists_offset,
        chunk.exists_length,
    )?;
    verify_stream_checksum(&value_bytes, &exists_bytes, chunk.checksum)?;
    let value_stream = decompress(
        chunk.value_compression,
        &value_bytes,
        chunk.value_decompressed_size as usize,
    )?;
    let exists: BitVec<u8, Lsb0> = BitVec::from_vec(exists_bytes);
    let datatype = columns[chunk.column as usize].datatype();

    let mut values = Vec::with_capacity(row_count as usize);
    let mut buf = &value_stream[..];
    let mut decoded = 0u64;
    for row in 0..row_count as usize {
        if exists.get(row).map(|bit| *bit).unwrap_or(false) {
            values.push(DataValue::decode(datatype, &mut buf)?);
            decoded += 1;
        } else {
            values.push(DataValue::Null);
        }
    }
    if decoded != chunk.value_count {
        return Err(StorageError::Corrupted(format!(
            "chunk (stripe {}, group {}, column {}) decoded {} values, metadata says {}",
            chunk.stripe_id, chunk.chunk_group, chunk.column, decoded, chunk.value_count
        )));
    }
    Ok(values)
}

async fn load_chunk(
    ctx: &ReadContext<'_>,
    columns: &[ColumnDesc],
    stripe: &StripeMeta,
    chunk: &ChunkMeta,
    row_count: u64,
    stats: &mut ReadStats,
) -> StorageResult<DecodedChunk> {
    stats.chunks_loaded += 1;
    let key = ChunkCacheKey {
        storage_id: chunk.storage_id,
        stripe_id: chunk.stripe_id,
        chunk_group: chunk.chunk_group,
        column: chunk.column,
    };
    if let Some(cached) = ctx.cache.get(&key).await {
        return Ok(cached);
    }
    let decoded: DecodedChunk = Arc::new(load_chunk_from_disk(
        ctx.storage,
        columns,
        stripe,
        chunk,
        row_count,
    )?);
    ctx.cache.insert(key, decoded.clone()).await;
    Ok(decoded)
}

/// Min/max pruning for one chunk group: prune only when the predicate
/// column's chunk carries bounds that rule every value out. An all-null
/// chunk has no bounds and is never pruned here.
fn group_may_match(predicate: &Option<ScanPredicate>, chunks: &[ChunkMeta]) -> bool {
    let Some(predicate) = predicate else {
        return true;
    };
    let Some(chunk) = chunks
        .iter()
        .find(|chunk| chunk.column as usize == predicate.column)
    else {
        return true;
    };
    match (&chunk.minimum, &chunk.maximum) {
        (Some(min), Some(max)) => predicate.may_match_range(min, max),
        _ => true,
    }
}

/// Apply the deletion masks covering `[first_row, first_row + rows)` to a
/// fresh visibility bitmap (set bit = row live).
fn visibility_for_range(masks: &[RowMaskMeta], first_row: u64, rows: u64) -> BitVec {
    let mut visibility = BitVec::new();
    visibility.resize(rows as usize, true);
    for mask in masks {
        if mask.end_row_number < first_row || mask.start_row_number >= first_row + rows {
            continue;
        }
        let from = mask.start_row_number.max(first_row);
        let to = mask.end_row_number.min(first_row + rows - 1);
        for row_number in from..=to {
            if mask.bit(row_number) {
                visibility.set((row_number - first_row) as usize, false);
            }
        }
    }
    visibility
}

struct StripeCursor {
    stripe: StripeMeta,
    skip_list: StripeSkipList,
    masks: Vec<RowMaskMeta>,
    group_idx: usize,
    /// First row number of the current chunk group.
    group_first_row: u64,
    group_rows: u64,
    /// Decoded needed columns of the current group; `None` when the group
    /// was pruned or the column is not needed.
    group_columns: Vec<Option<DecodedChunk>>,
    visibility: BitVec,
    row_in_group: u64,
    loaded: bool,
}

impl StripeCursor {
    fn new(stripe: StripeMeta, skip_list: StripeSkipList, masks: Vec<RowMaskMeta>) -> Self {
        let group_first_row = stripe.first_row_number;
        let column_count = stripe.column_count as usize;
        Self {
            stripe,
            skip_list,
            masks,
            group_idx: 0,
            group_first_row,
            group_rows: 0,
            group_columns: vec![None; column_count],
            visibility: BitVec::new(),
            row_in_group: 0,
            loaded: false,
        }
    }
}

/// One open scan. Created by the table layer after it flushed the calling
/// transaction's pending writes and row-mask cache, so the scan observes the
/// transaction's own work through the ordinary catalog path.
pub struct TableReadState {
    columns: Arc<[ColumnDesc]>,
    needed: SmallVec<[usize; 16]>,
    predicate: Option<ScanPredicate>,
    snapshot: Snapshot,
    stripes: VecDeque<StripeMeta>,
    cursor: Option<StripeCursor>,
    stats: ReadStats,
    cancel: CancellationToken,
}

impl TableReadState {
    pub fn new(
        columns: Arc<[ColumnDesc]>,
        needed: impl IntoIterator<Item = usize>,
        predicate: Option<ScanPredicate>,
        snapshot: Snapshot,
        stripes: Vec<StripeMeta>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            columns,
            needed: needed.into_iter().collect(),
            predicate,
            snapshot,
            stripes: stripes.into(),
            cursor: None,
            stats: ReadStats::default(),
            cancel,
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Advance to the next chunk group with decodable rows, loading its
    /// needed chunks. Returns `false` when the stripe is exhausted.
    async fn advance_group(&mut self, ctx: &ReadContext<'_>) -> StorageResult<bool> {
        loop {
            let cursor = self.cursor.as_mut().unwrap();
            if cursor.loaded {
                cursor.group_first_row += cursor.group_rows;
                cursor.group_idx += 1;
                cursor.loaded = false;
            }
            if cursor.group_idx >= cursor.skip_list.chunk_groups.len() {
                return Ok(false);
            }
            let group_rows = cursor.skip_list.chunk_groups[cursor.group_idx].row_count;
            if !group_may_match(
                &self.predicate,
                &cursor.skip_list.chunks[cursor.group_idx],
            ) {
                // Skipped without decompression.
                self.stats.chunk_groups_filtered += 1;
                cursor.group_first_row += group_rows;
                cursor.group_idx += 1;
                continue;
            }
            cursor.group_rows = group_rows;
            cursor.row_in_group = 0;
            cursor.visibility =
                visibility_for_range(&cursor.masks, cursor.group_first_row, group_rows);
            cursor.loaded = true;
            let stripe = cursor.stripe.clone();
            let chunk_metas: Vec<ChunkMeta> = cursor.skip_list.chunks[cursor.group_idx]
                .iter()
                .filter(|chunk| self.needed.contains(&(chunk.column as usize)))
                .cloned()
                .collect();
            let mut loaded: Vec<(u32, DecodedChunk)> = Vec::with_capacity(chunk_metas.len());
            for chunk in &chunk_metas {
                let decoded = load_chunk(
                    ctx,
                    &self.columns,
                    &stripe,
                    chunk,
                    group_rows,
                    &mut self.stats,
                )
                .await?;
                loaded.push((chunk.column, decoded));
            }
            let cursor = self.cursor.as_mut().unwrap();
            cursor.group_columns = vec![None; cursor.stripe.column_count as usize];
            for (column, decoded) in loaded {
                cursor.group_columns[column as usize] = Some(decoded);
            }
            return Ok(true);
        }
    }

    /// Next visible row as `(row_number, values)`; columns outside the
    /// needed set come back as nulls. `Ok(None)` means end of scan, which a
    /// cancellation request also produces (benign early termination).
    pub async fn next_row(&mut self, ctx: &ReadContext<'_>) -> StorageResult<Option<(u64, Row)>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if self.cursor.is_none() {
                let Some(stripe) = self.stripes.pop_front() else {
                    return Ok(None);
                };
                let skip_list = ctx.catalog.read_stripe_skip_list(&stripe, &self.snapshot)?;
                let masks = ctx.catalog.row_masks_for_stripe(
                    stripe.storage_id,
                    stripe.stripe_id,
                    &self.snapshot,
                );
                self.cursor = Some(StripeCursor::new(stripe, skip_list, masks));
            }
            let needs_advance = {
                let cursor = self.cursor.as_ref().unwrap();
                !cursor.loaded || cursor.row_in_group >= cursor.group_rows
            };
            if needs_advance && !self.advance_group(ctx).await? {
                self.cursor = None;
                continue;
            }
            let cursor = self.cursor.as_mut().unwrap();
            while cursor.row_in_group < cursor.group_rows {
                let idx = cursor.row_in_group as usize;
                let row_number = cursor.group_first_row + cursor.row_in_group;
                cursor.row_in_group += 1;
                if !cursor.visibility[idx] {
                    continue;
                }
                let mut row: Row = vec![DataValue::Null; cursor.stripe.column_count as usize];
                for (column, decoded) in cursor.group_columns.iter().enumerate() {
                    if let Some(decoded) = decoded {
                        row[column] = decoded[idx].clone();
                    }
                }
                return Ok(Some((row_number, row)));
            }
        }
    }
}

/// Point lookup inside one flushed stripe: decompress only the chunk group
/// containing `row_number` and honor its mask. `Ok(None)` means the row's
/// deletion bit is set.
pub async fn read_row_in_stripe(
    ctx: &ReadContext<'_>,
    columns: &Arc<[ColumnDesc]>,
    needed: &[usize],
    snapshot: &Snapshot,
    stripe: &StripeMeta,
    row_number: u64,
) -> StorageResult<Option<Row>> {
    debug_assert!(stripe.covers_row(row_number));
    let skip_list = ctx.catalog.read_stripe_skip_list(stripe, snapshot)?;
    let mut group_first_row = stripe.first_row_number;
    for (group_idx, group) in skip_list.chunk_groups.iter().enumerate() {
        if row_number >= group_first_row + group.row_count {
            group_first_row += group.row_count;
            continue;
        }
        if let Some(mask) = ctx
            .catalog
            .find_row_mask(stripe.storage_id, row_number, snapshot)
        {
            if mask.covers_row(row_number) && mask.bit(row_number) {
                return Ok(None);
            }
        }
        let idx = (row_number - group_first_row) as usize;
        let mut row: Row = vec![DataValue::Null; stripe.column_count as usize];
        let mut stats = ReadStats::default();
        for chunk in &skip_list.chunks[group_idx] {
            if !needed.contains(&(chunk.column as usize)) {
                continue;
            }
            let decoded =
                load_chunk(ctx, columns, stripe, chunk, group.row_count, &mut stats).await?;
            row[chunk.column as usize] = decoded[idx].clone();
        }
        return Ok(Some(row));
    }
    Err(StorageError::Corrupted(format!(
        "stripe {} covers row {} but no chunk group does",
        stripe.stripe_id, row_number
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_range_check() {
        // Chunk with min=5, max=10.
        let min = DataValue::Int32(5);
        let max = DataValue::Int32(10);
        let pred = |op, value| ScanPredicate {
            column: 0,
            op,
            value: DataValue::Int32(value),
        };
        // col > 20 can never match.
        assert!(!pred(CmpOp::Gt, 20).may_match_range(&min, &max));
        // col > 7 may match even if no actual row satisfies it.
        assert!(pred(CmpOp::Gt, 7).may_match_range(&min, &max));
        assert!(pred(CmpOp::Eq, 5).may_match_range(&min, &max));
        assert!(!pred(CmpOp::Eq, 4).may_match_range(&min, &max));
        assert!(!pred(CmpOp::Lt, 5).may_match_range(&min, &max));
        assert!(pred(CmpOp::Le, 5).may_match_range(&min, &max));
        assert!(!pred(CmpOp::Ge, 11).may_match_range(&min, &max));
    }

    #[test]
    fn test_visibility_from_masks() {
        let mut mask = RowMaskMeta {
            id: 1,
            storage_id: 1,
            stripe_id: 1,
            chunk_group: 0,
            start_row_number: 1,
            end_row_number: 8,
            deleted_rows: 0,
            mask: vec![0u8],
        };
        mask.set_bit(3);
        mask.set_bit(7);
        let visibility = visibility_for_range(&[mask], 1, 8);
        let live: Vec<usize> = visibility.iter_ones().collect();
        assert_eq!(live, vec![0, 1, 3, 4, 5, 7]);
    }
}
