// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Vacuum: merges low-occupancy stripes, reclaims orphaned reservations,
//! relocates stripes into holes and truncates trailing free space.
//!
//! The combine pass walks stripes newest-first, accumulating live rows
//! until the next stripe would push the total past the current stripe row
//! limit (or the decompressed-size cap). The qualifying suffix is rewritten
//! through the ordinary read→write pipeline into one fresh stripe placed in
//! the reclaimed region: old catalog rows are deleted and the storage is
//! truncated *before* the buffered rows flush, so the new extent lands
//! where the old ones were. A single qualifying stripe is only rewritten
//! when more than a fifth of its rows are deleted; a lone "full" stripe is
//! left alone.
//!
//! Interruption is cooperative: the cancellation token is checked at stripe
//! boundaries, partial progress is flushed and truncated as valid durable
//! state, and the interruption resurfaces as [`StorageError::Interrupted`]
//! after cleanup.
//!
//! Physical effects (byte relocation, truncation) are not transactional;
//! vacuum commits its transaction immediately after returning, and holds
//! the storage's advisory lock throughout.

use std::sync::Arc;

use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::disk::{PhysicalStorage, METAPAGE_SIZE};
use super::meta::{MetadataCatalog, ScanDirection, StripeMeta, StripeWriteState};
use super::options::ColumnarOptions;
use super::read_state::{ChunkCache, ReadContext, TableReadState};
use super::write_state::{TableWriteState, WriteContext};
use super::{StorageError, StorageResult};
use crate::catalog::ColumnDesc;
use crate::transaction::Transaction;

/// A single candidate stripe is rewritten only above this deleted fraction.
const VACUUM_DELETED_ROW_FRACTION: f64 = 0.2;

/// Combine stops accumulating once the selected stripes' decompressed size
/// reaches this cap.
const VACUUM_COMBINE_BYTE_CAP: u64 = 1_024_000_000;

/// Gaps smaller than this are not worth relocating into.
const MIN_HOLE_LENGTH: u64 = 10_000;

pub struct VacuumContext<'a> {
    pub txn: &'a Transaction,
    pub catalog: &'a MetadataCatalog,
    pub storage: &'a PhysicalStorage,
    pub cache: &'a ChunkCache,
    pub columns: &'a Arc<[ColumnDesc]>,
    /// Options in force now, not at write time.
    pub options: ColumnarOptions,
}

#[derive(Debug, Clone, Copy)]
struct StripeHole {
    file_offset: u64,
    data_length: u64,
}

/// Run a full vacuum of one storage. The caller holds the storage advisory
/// lock and commits the surrounding transaction right after this returns.
pub async fn vacuum(ctx: &VacuumContext<'_>, token: &CancellationToken) -> StorageResult<()> {
    // Reservations and catalog rows of rolled-back transactions are
    // invisible garbage until this explicit reclamation.
    ctx.catalog
        .purge(ctx.storage.storage_id(), ctx.txn.manager());

    combine_stripes(ctx, token).await?;
    if token.is_cancelled() {
        truncate_tail(ctx)?;
        return Err(StorageError::Interrupted);
    }

    fill_holes(ctx, token)?;
    truncate_tail(ctx)?;
    if token.is_cancelled() {
        return Err(StorageError::Interrupted);
    }
    Ok(())
}

/// Newest-first selection and rewrite of the qualifying stripe suffix.
async fn combine_stripes(
    ctx: &VacuumContext<'_>,
    token: &CancellationToken,
) -> StorageResult<()> {
    let storage_id = ctx.storage.storage_id();
    let snapshot = ctx.txn.snapshot();
    let mut flushed: Vec<StripeMeta> = Vec::new();
    for entry in ctx
        .catalog
        .list_stripes(storage_id, &snapshot, ScanDirection::Backward)
    {
        if entry.write_state(ctx.txn.manager())? == StripeWriteState::Flushed {
            flushed.push(entry.meta);
        }
    }
    if flushed.is_empty() {
        debug!(storage_id, "stopping vacuum: no flushed stripes");
        return Ok(());
    }

    let mut selected = 0usize;
    let mut total_live = 0u64;
    let mut total_decompressed = 0u64;
    let mut newest_deleted = 0u64;
    for (idx, stripe) in flushed.iter().enumerate() {
        let deleted =
            ctx.catalog
                .deleted_rows_for_stripe(storage_id, stripe.stripe_id, &snapshot);
        total_decompressed +=
            ctx.catalog
                .decompressed_length_for_stripe(storage_id, stripe.stripe_id, &snapshot);
        if total_decompressed >= VACUUM_COMBINE_BYTE_CAP {
            break;
        }
        let live = stripe.row_count - deleted;
        if total_live + live >= ctx.options.stripe_row_limit {
            break;
        }
        if idx == 0 {
            newest_deleted = deleted;
        }
        total_live += live;
        selected += 1;
    }

    if selected == 0 {
        // The newest stripe alone is already full.
        return Ok(());
    }
    if selected == 1 {
        let stripe = &flushed[0];
        let fraction = newest_deleted as f64 / stripe.row_count as f64;
        if fraction <= VACUUM_DELETED_ROW_FRACTION {
            return Ok(());
        }
    }

    // Oldest-first within the selected suffix, so the combined stripe keeps
    // old rows in front.
    let mut sources: Vec<StripeMeta> = flushed[..selected].to_vec();
    sources.reverse();

    let read_ctx = ReadContext {
        catalog: ctx.catalog,
        storage: ctx.storage,
        cache: ctx.cache,
    };
    let write_ctx = WriteContext {
        txn: ctx.txn,
        catalog: ctx.catalog,
        storage: ctx.storage,
    };
    let all_columns = (0..ctx.columns.len()).collect_vec();
    let mut writer = TableWriteState::new(ctx.columns.clone(), ctx.options.clone());
    let mut consumed: Vec<StripeMeta> = Vec::new();
    let mut interrupted = false;

    for stripe in sources {
        if token.is_cancelled() {
            interrupted = true;
            break;
        }
        let mut reader = TableReadState::new(
            ctx.columns.clone(),
            all_columns.iter().copied(),
            None,
            snapshot.clone(),
            vec![stripe.clone()],
            token.clone(),
        );
        while let Some((_, values)) = reader.next_row(&read_ctx).await? {
            writer.write_row(&write_ctx, values).await?;
        }
        if token.is_cancelled() {
            // The scan may have ended early; the stripe is not consumed.
            interrupted = true;
            break;
        }
        ctx.catalog
            .delete_stripe(ctx.txn, storage_id, stripe.stripe_id)?;
        consumed.push(stripe);
    }

    if interrupted {
        // Whatever was safely combined stays; the extent goes at the end
        // and truncation below only trims the tail.
        writer.flush_stripe(&write_ctx).await?;
        info!(
            storage_id,
            combined = consumed.len(),
            "vacuum interrupted, partial combine kept"
        );
        return Ok(());
    }

    // Roll the reservation back over the consumed extents before the
    // combined stripe flushes, so it lands in the reclaimed region.
    let remaining_end = ctx
        .catalog
        .list_stripes(storage_id, &snapshot, ScanDirection::Forward)
        .iter()
        .map(|entry| entry.meta.extent_end())
        .max()
        .unwrap_or(METAPAGE_SIZE);
    ctx.storage.truncate(remaining_end)?;
    writer.flush_stripe(&write_ctx).await?;
    info!(
        storage_id,
        combined = consumed.len(),
        rows = total_live,
        "vacuum combined stripes"
    );
    Ok(())
}

/// Gaps of reclaimable space between extents, in offset order.
fn holes_for_storage(ctx: &VacuumContext<'_>) -> Vec<StripeHole> {
    let snapshot = ctx.txn.snapshot();
    let mut stripes: Vec<StripeMeta> = ctx
        .catalog
        .list_stripes(ctx.storage.storage_id(), &snapshot, ScanDirection::Forward)
        .into_iter()
        .map(|entry| entry.meta)
        .filter(|meta| meta.data_length > 0)
        .collect();
    stripes.sort_by_key(|meta| meta.file_offset);

    let mut holes = Vec::new();
    let mut last_end = METAPAGE_SIZE;
    for stripe in stripes {
        if stripe.file_offset > last_end && stripe.file_offset - last_end >= MIN_HOLE_LENGTH {
            holes.push(StripeHole {
                file_offset: last_end,
                data_length: stripe.file_offset - last_end,
            });
        }
        last_end = last_end.max(stripe.extent_end());
    }
    holes
}

/// Move later, smaller stripes backward into holes. Only the offset
/// metadata changes; the bytes are copied verbatim, so nothing is
/// decompressed or recompressed.
fn fill_holes(ctx: &VacuumContext<'_>, token: &CancellationToken) -> StorageResult<()> {
    let storage_id = ctx.storage.storage_id();
    let mut relocated = 0u32;
    loop {
        if token.is_cancelled() {
            break;
        }
        let holes = holes_for_storage(ctx);
        if holes.is_empty() {
            break;
        }
        let snapshot = ctx.txn.snapshot();
        let mut moved = false;
        for hole in holes {
            let mut stripes: Vec<StripeMeta> = ctx
                .catalog
                .list_stripes(storage_id, &snapshot, ScanDirection::Forward)
                .into_iter()
                .map(|entry| entry.meta)
                .collect();
            stripes.sort_by_key(|meta| meta.file_offset);
            if let Some(stripe) = stripes.iter().find(|stripe| {
                stripe.data_length > 0
                    && stripe.data_length <= hole.data_length
                    && stripe.file_offset > hole.file_offset
            }) {
                let data = ctx.storage.read_at(stripe.file_offset, stripe.data_length)?;
                ctx.storage.write_at(hole.file_offset, &data)?;
                ctx.storage.sync()?;
                ctx.catalog.update_stripe_location(
                    ctx.txn,
                    storage_id,
                    stripe.stripe_id,
                    hole.file_offset,
                )?;
                relocated += 1;
                moved = true;
                break;
            }
        }
        if !moved {
            break;
        }
    }
    if relocated > 0 {
        info!(storage_id, relocated, "vacuum relocated stripes into holes");
    }
    Ok(())
}

/// Trim the file past the last visible extent.
fn truncate_tail(ctx: &VacuumContext<'_>) -> StorageResult<()> {
    let snapshot = ctx.txn.snapshot();
    let end = ctx
        .catalog
        .list_stripes(ctx.storage.storage_id(), &snapshot, ScanDirection::Forward)
        .iter()
        .map(|entry| entry.meta.extent_end())
        .max()
        .unwrap_or(METAPAGE_SIZE);
    let before = ctx.storage.table_size();
    ctx.storage.truncate(end)?;
    let after = ctx.storage.table_size();
    if after < before {
        info!(
            storage_id = ctx.storage.storage_id(),
            before, after, "vacuum truncated storage"
        );
    }
    Ok(())
}
