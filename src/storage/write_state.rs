// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Per-transaction write buffering and the stripe flush protocol.
//!
//! One [`TableWriteState`] exists per (relation, subtransaction) while rows
//! are being inserted: values accumulate column-by-column, a full chunk
//! group is serialized and compressed into the in-flight stripe buffer, and
//! a full stripe (or an explicit end-of-write) reserves an extent, writes it
//! and records the catalog rows. Row numbers are assigned eagerly from the
//! stripe reservation so callers can hand out stable row identifiers before
//! anything is durable.
//!
//! The [`WriteStateManager`] is the explicit registry keyed by
//! `(relation, transaction)` holding a subtransaction stack per entry:
//! child commit re-tags frames to the parent scope, child abort discards
//! them, and transaction end either flushes everything or drops it.

use std::collections::HashMap;
use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::checksum::build_stream_checksum;
use super::compression::maybe_compress;
use super::disk::PhysicalStorage;
use super::meta::{ChunkGroupMeta, ChunkMeta, MetadataCatalog, StripeMeta};
use super::options::ColumnarOptions;
use super::StorageResult;
use crate::catalog::{ColumnDesc, RelationId};
use crate::transaction::{SubXid, Transaction, TxnId};
use crate::types::{DataValue, Row};

/// Everything a flush needs from the surrounding engine.
pub struct WriteContext<'a> {
    pub txn: &'a Transaction,
    pub catalog: &'a MetadataCatalog,
    pub storage: &'a PhysicalStorage,
}

/// The in-flight stripe: reserved metadata plus the serialized chunk groups
/// flushed into it so far.
struct StripeBuffer {
    meta: StripeMeta,
    data: Vec<u8>,
    chunks: Vec<ChunkMeta>,
    chunk_group_row_counts: Vec<u64>,
    /// Rows already serialized into `data`.
    rows_serialized: u64,
}

/// Write buffer for one (relation, subtransaction).
pub struct TableWriteState {
    columns: Arc<[ColumnDesc]>,
    options: ColumnarOptions,
    /// Accumulating chunk group, one value vector per column.
    chunk_columns: Vec<Vec<DataValue>>,
    chunk_rows: u64,
    stripe: Option<StripeBuffer>,
}

impl TableWriteState {
    /// Fresh buffer; also used directly by vacuum for its rewrite pipeline.
    pub(super) fn new(columns: Arc<[ColumnDesc]>, options: ColumnarOptions) -> Self {
        let column_count = columns.len();
        Self {
            columns,
            options,
            chunk_columns: vec![Vec::new(); column_count],
            chunk_rows: 0,
            stripe: None,
        }
    }

    /// Buffer one row, cutting chunk and stripe boundaries as thresholds are
    /// crossed. Returns the row number assigned to the row.
    pub async fn write_row(&mut self, ctx: &WriteContext<'_>, values: Row) -> StorageResult<u64> {
        assert_eq!(
            values.len(),
            self.columns.len(),
            "row arity does not match the table"
        );
        if self.stripe.is_none() {
            // First row of a new stripe: reserve the id and the full row
            // number range up front. Unused numbers become permanent gaps.
            let meta = ctx.catalog.reserve_stripe(
                ctx.txn,
                ctx.storage,
                self.columns.len() as u32,
                self.options.chunk_group_row_limit,
                self.options.stripe_row_limit,
            )?;
            self.stripe = Some(StripeBuffer {
                meta,
                data: Vec::new(),
                chunks: Vec::new(),
                chunk_group_row_counts: Vec::new(),
                rows_serialized: 0,
            });
        }
        let row_number = {
            let stripe = self.stripe.as_ref().unwrap();
            stripe.meta.first_row_number + stripe.rows_serialized + self.chunk_rows
        };
        for (column, value) in self.chunk_columns.iter_mut().zip(values) {
            column.push(value);
        }
        self.chunk_rows += 1;

        if self.chunk_rows >= self.options.chunk_group_row_limit {
            self.serialize_chunk_group()?;
        }
        let stripe_full =
            self.stripe.as_ref().unwrap().rows_serialized + self.chunk_rows
                >= self.options.stripe_row_limit;
        if stripe_full {
            self.flush_stripe(ctx).await?;
        }
        Ok(row_number)
    }

    /// Serialize the accumulated chunk group into the stripe buffer: one
    /// value stream and one existence stream per column, value streams
    /// compressed individually.
    fn serialize_chunk_group(&mut self) -> StorageResult<()> {
        if self.chunk_rows == 0 {
            return Ok(());
        }
        let stripe = self.stripe.as_mut().expect("chunk group without a stripe");
        let chunk_group = stripe.chunk_group_row_counts.len() as u32;
        for (idx, column_values) in self.chunk_columns.iter_mut().enumerate() {
            let mut value_stream = Vec::new();
            let mut exists: BitVec<u8, Lsb0> = BitVec::with_capacity(column_values.len());
            let mut minimum: Option<DataValue> = None;
            let mut maximum: Option<DataValue> = None;
            let mut value_count = 0u64;
            for value in column_values.iter() {
                if value.is_null() {
                    exists.push(false);
                    continue;
                }
                exists.push(true);
                value.encode(&mut value_stream);
                value_count += 1;
                match &minimum {
                    Some(min) if min.compare(value).is_le() => {}
                    _ => minimum = Some(value.clone()),
                }
                match &maximum {
                    Some(max) if max.compare(value).is_ge() => {}
                    _ => maximum = Some(value.clone()),
                }
            }
            let decompressed_size = value_stream.len() as u64;
            // The codec only sticks if it actually shrinks the stream.
            let (stored_codec, value_bytes) = maybe_compress(
                self.options.compression,
                self.options.compression_level,
                &value_stream,
            )?;
            let exists_bytes = exists.into_vec();

            let value_offset = stripe.data.len() as u64;
            stripe.data.extend_from_slice(&value_bytes);
            let exists_offset = stripe.data.len() as u64;
            stripe.data.extend_from_slice(&exists_bytes);

            stripe.chunks.push(ChunkMeta {
                storage_id: stripe.meta.storage_id,
                stripe_id: stripe.meta.stripe_id,
                chunk_group,
                column: idx as u32,
                minimum,
                maximum,
                value_offset,
                value_length: value_bytes.len() as u64,
                exists_offset,
                exists_length: exists_bytes.len() as u64,
                value_compression: stored_codec,
                compression_level: self.options.compression_level,
                value_decompressed_size: decompressed_size,
                value_count,
                checksum: build_stream_checksum(&value_bytes, &exists_bytes),
            });
            column_values.clear();
        }
        stripe.chunk_group_row_counts.push(self.chunk_rows);
        stripe.rows_serialized += self.chunk_rows;
        self.chunk_rows = 0;
        Ok(())
    }

    /// Stripe boundary (or forced end-of-write): write the extent, complete
    /// the catalog rows, create the empty row masks, return to empty.
    pub async fn flush_stripe(&mut self, ctx: &WriteContext<'_>) -> StorageResult<()> {
        self.serialize_chunk_group()?;
        let stripe = match self.stripe.take() {
            Some(stripe) if stripe.rows_serialized > 0 => stripe,
            // Nothing buffered; an untouched reservation stays orphaned and
            // vacuum reclaims it.
            _ => return Ok(()),
        };
        let file_offset = ctx.storage.reserve_data(stripe.data.len() as u64)?;
        ctx.storage.write_at(file_offset, &stripe.data)?;
        ctx.storage.sync()?;

        let chunk_groups = stripe
            .chunk_group_row_counts
            .iter()
            .enumerate()
            .map(|(group, &row_count)| ChunkGroupMeta {
                storage_id: stripe.meta.storage_id,
                stripe_id: stripe.meta.stripe_id,
                chunk_group: group as u32,
                row_count,
                deleted_rows: 0,
            })
            .collect_vec();
        let meta = ctx.catalog.complete_stripe(
            ctx.txn,
            stripe.meta.storage_id,
            stripe.meta.stripe_id,
            file_offset,
            stripe.data.len() as u64,
            stripe.rows_serialized,
            stripe.chunks,
            chunk_groups,
        )?;
        if !ctx.catalog.save_empty_row_masks(
            ctx.txn,
            meta.storage_id,
            meta.stripe_id,
            meta.first_row_number,
            &stripe.chunk_group_row_counts,
        )? {
            // Uniqueness race on mask creation: report, do not escalate.
            warn!(
                storage_id = meta.storage_id,
                stripe_id = meta.stripe_id,
                "could not initialize row mask"
            );
        }
        debug!(
            storage_id = meta.storage_id,
            stripe_id = meta.stripe_id,
            rows = meta.row_count,
            bytes = meta.data_length,
            "flushed stripe"
        );
        Ok(())
    }
}

type StateRef = Arc<tokio::sync::Mutex<TableWriteState>>;

/// Stack of write states for one (relation, transaction): first write in a
/// new subtransaction pushes, child commit re-tags to the parent, child
/// abort pops and discards.
#[derive(Default)]
struct WriteStateStack {
    frames: Vec<(SubXid, StateRef)>,
}

/// Process-scoped registry of write states with the subtransaction
/// lifecycle hooks.
#[derive(Default)]
pub struct WriteStateManager {
    map: Mutex<HashMap<(RelationId, TxnId), WriteStateStack>>,
}

impl WriteStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state accepting writes for the transaction's current
    /// subtransaction, created on first use.
    fn state_for_write(
        &self,
        relation_id: RelationId,
        txn: &Transaction,
        columns: &Arc<[ColumnDesc]>,
        options: &ColumnarOptions,
    ) -> StateRef {
        let subxid = txn.current_subxid();
        let mut map = self.map.lock();
        let stack = map.entry((relation_id, txn.xid())).or_default();
        if let Some((frame_subxid, state)) = stack.frames.last() {
            if *frame_subxid == subxid {
                return state.clone();
            }
        }
        let state = Arc::new(tokio::sync::Mutex::new(TableWriteState::new(
            columns.clone(),
            options.clone(),
        )));
        stack.frames.push((subxid, state.clone()));
        state
    }

    pub async fn write_row(
        &self,
        relation_id: RelationId,
        columns: &Arc<[ColumnDesc]>,
        options: &ColumnarOptions,
        ctx: &WriteContext<'_>,
        values: Row,
    ) -> StorageResult<u64> {
        let state = self.state_for_write(relation_id, ctx.txn, columns, options);
        let mut state = state.lock().await;
        state.write_row(ctx, values).await
    }

    /// Force-flush every frame the transaction holds for a relation, so a
    /// scan or point lookup observes the transaction's own writes.
    pub async fn flush_relation(
        &self,
        relation_id: RelationId,
        ctx: &WriteContext<'_>,
    ) -> StorageResult<()> {
        let frames = {
            let map = self.map.lock();
            match map.get(&(relation_id, ctx.txn.xid())) {
                Some(stack) => stack.frames.clone(),
                None => return Ok(()),
            }
        };
        for (_, state) in frames {
            state.lock().await.flush_stripe(ctx).await?;
        }
        Ok(())
    }

    /// Relations this transaction has write states for.
    pub fn relations_of(&self, txn: &Transaction) -> Vec<RelationId> {
        self.map
            .lock()
            .keys()
            .filter(|(_, xid)| *xid == txn.xid())
            .map(|(relation_id, _)| *relation_id)
            .collect()
    }

    /// Subtransaction commit: elevate the child's frames to the parent
    /// scope instead of flushing them.
    pub fn subtransaction_commit(&self, txn: &Transaction, child: SubXid, parent: SubXid) {
        let mut map = self.map.lock();
        for ((_, xid), stack) in map.iter_mut() {
            if *xid != txn.xid() {
                continue;
            }
            for (subxid, _) in stack.frames.iter_mut() {
                if *subxid == child {
                    *subxid = parent;
                }
            }
        }
    }

    /// Subtransaction abort: pop and discard the child's frames. Reserved
    /// stripes stay orphaned; vacuum reclaims them.
    pub fn subtransaction_abort(&self, txn: &Transaction, child: SubXid) {
        let mut map = self.map.lock();
        for ((_, xid), stack) in map.iter_mut() {
            if *xid == txn.xid() {
                stack.frames.retain(|(subxid, _)| *subxid != child);
            }
        }
    }

    /// Transaction cleanup hook. Entries are removed whether or not the
    /// transaction flushed: a committing transaction flushed through
    /// [`Self::flush_relation`] first, an aborting one just forgets.
    pub fn release(&self, txn: &Transaction) {
        self.map.lock().retain(|(_, xid), _| *xid != txn.xid());
    }
}
