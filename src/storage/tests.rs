// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Engine-level tests: insert/flush/lookup, deletion masks, chunk skipping,
//! abort semantics, vacuum and restart recovery.

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::catalog::ColumnDesc;
use crate::transaction::Snapshot;
use crate::types::{DataType, DataValue, Row};

async fn test_engine(dir: &TempDir) -> StripeStorage {
    StripeStorage::open(StorageOptions::default_for_test(dir.path().to_path_buf()))
        .await
        .unwrap()
}

fn small_options(chunk_group_row_limit: u64, stripe_row_limit: u64) -> ColumnarOptions {
    ColumnarOptions {
        chunk_group_row_limit,
        stripe_row_limit,
        ..ColumnarOptions::default()
    }
}

fn int_columns() -> Vec<ColumnDesc> {
    vec![
        ColumnDesc::new("v", DataType::Int32, false),
        ColumnDesc::new("note", DataType::String, true),
    ]
}

fn int_row(v: i32) -> Row {
    vec![
        DataValue::Int32(v),
        DataValue::String(format!("row-{}", v)),
    ]
}

async fn insert_rows(
    engine: &StripeStorage,
    table: &StripeTable,
    values: impl IntoIterator<Item = i32>,
) -> Vec<RowId> {
    let txn = engine.begin();
    let mut ids = vec![];
    for v in values {
        ids.push(table.insert_row(&txn, int_row(v)).await.unwrap());
    }
    engine.commit(txn).await.unwrap();
    ids
}

async fn scan_values(engine: &StripeStorage, table: &StripeTable) -> Vec<i32> {
    scan_values_with(engine, table, None).await.0
}

async fn scan_values_with(
    engine: &StripeStorage,
    table: &StripeTable,
    predicate: Option<ScanPredicate>,
) -> (Vec<i32>, ReadStats) {
    let txn = engine.begin();
    let snapshot = txn.snapshot();
    let mut scan = table
        .begin_scan(&txn, snapshot, [0usize, 1], predicate, CancellationToken::new())
        .await
        .unwrap();
    let ctx = table.read_context();
    let mut values = vec![];
    while let Some((_, row)) = scan.next_row(&ctx).await.unwrap() {
        match row[0] {
            DataValue::Int32(v) => values.push(v),
            ref other => panic!("unexpected value {:?}", other),
        }
    }
    let stats = scan.stats();
    engine.commit(txn).await.unwrap();
    (values, stats)
}

fn visible_stripes(table: &StripeTable, snapshot: &Snapshot) -> Vec<StripeMeta> {
    table
        .shared
        .meta
        .list_stripes(table.storage_id(), snapshot, ScanDirection::Forward)
        .into_iter()
        .map(|entry| entry.meta)
        .collect()
}

#[tokio::test]
async fn test_insert_flush_and_point_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(2, 4)))
        .await
        .unwrap();

    let ids = insert_rows(&engine, &table, 1..=10).await;
    // Row numbers are strictly increasing in insertion order.
    let numbers: Vec<u64> = ids.iter().map(|id| id.row_number().unwrap()).collect();
    for pair in numbers.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    // Exactly the inserted values come back by id.
    let txn = engine.begin();
    let snapshot = txn.snapshot();
    for (id, v) in ids.iter().zip(1..=10) {
        let row = table
            .fetch_row_by_id(&txn, *id, &snapshot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, int_row(v));
    }
    engine.commit(txn).await.unwrap();

    // 3 stripes of 4, 4 and 2 rows, each chunked into groups of <= 2.
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    let row_counts: Vec<u64> = stripes.iter().map(|s| s.row_count).collect();
    assert_eq!(row_counts, vec![4, 4, 2]);
    for stripe in &stripes {
        let skip_list = table
            .shared
            .meta
            .read_stripe_skip_list(stripe, &snapshot)
            .unwrap();
        for group in &skip_list.chunk_groups {
            assert!(group.row_count <= 2);
        }
    }
}

#[tokio::test]
async fn test_chunk_boundary_counts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(3, 100)))
        .await
        .unwrap();

    // Exactly the chunk limit: one full chunk group, no partial one.
    insert_rows(&engine, &table, 1..=3).await;
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    assert_eq!(stripes.len(), 1);
    assert_eq!(stripes[0].chunk_group_count, 1);

    // One more row than the limit: two chunk groups.
    insert_rows(&engine, &table, 4..=7).await;
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    assert_eq!(stripes.len(), 2);
    assert_eq!(stripes[1].row_count, 4);
    assert_eq!(stripes[1].chunk_group_count, 2);
}

#[tokio::test]
async fn test_read_own_writes_forces_flush() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(10, 100)))
        .await
        .unwrap();

    let txn = engine.begin();
    let id = table.insert_row(&txn, int_row(42)).await.unwrap();
    // Nothing flushed yet, but the lookup must observe the write.
    let row = table
        .fetch_row_by_id(&txn, id, &txn.snapshot())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row, int_row(42));
    engine.commit(txn).await.unwrap();
}

#[tokio::test]
async fn test_mark_deleted_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(4, 8)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=8).await;

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    let id = RowId::from_row_number(3).unwrap();
    assert!(table.delete_row(&txn, id, &snapshot).await.unwrap());
    // Second delete of the same row says "row no longer exists".
    assert!(!table.delete_row(&txn, id, &snapshot).await.unwrap());
    engine.commit(txn).await.unwrap();

    // deleted_rows incremented exactly once.
    let snapshot = engine.transaction_manager().snapshot();
    let deleted: u64 = visible_stripes(&table, &snapshot)
        .iter()
        .map(|s| {
            table
                .shared
                .meta
                .deleted_rows_for_stripe(table.storage_id(), s.stripe_id, &snapshot)
        })
        .sum();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_end_to_end_delete_and_scan() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(2, 4)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=10).await;

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    for row_number in [3u64, 7] {
        let id = RowId::from_row_number(row_number).unwrap();
        assert!(table.delete_row(&txn, id, &snapshot).await.unwrap());
    }
    engine.commit(txn).await.unwrap();

    assert_eq!(
        scan_values(&engine, &table).await,
        vec![1, 2, 4, 5, 6, 8, 9, 10]
    );

    // Each owning chunk group counts exactly one deleted row: row 3 is in
    // stripe 1 group 1 (rows 3..4), row 7 in stripe 2 group 1 (rows 7..8).
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    let group = |stripe: &StripeMeta, idx: u32| {
        table
            .shared
            .meta
            .chunk_group(table.storage_id(), stripe.stripe_id, idx, &snapshot)
            .unwrap()
    };
    assert_eq!(group(&stripes[0], 0).deleted_rows, 0);
    assert_eq!(group(&stripes[0], 1).deleted_rows, 1);
    assert_eq!(group(&stripes[1], 0).deleted_rows, 0);
    assert_eq!(group(&stripes[1], 1).deleted_rows, 1);
    assert_eq!(group(&stripes[2], 0).deleted_rows, 0);
}

#[tokio::test]
async fn test_chunk_skip_filtering() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(8, 8)))
        .await
        .unwrap();
    // One chunk with min=5, max=10.
    insert_rows(&engine, &table, 5..=10).await;

    // v > 20 cannot match: the chunk is skipped without decompression.
    let predicate = ScanPredicate {
        column: 0,
        op: CmpOp::Gt,
        value: DataValue::Int32(20),
    };
    let (values, stats) = scan_values_with(&engine, &table, Some(predicate)).await;
    assert!(values.is_empty());
    assert_eq!(stats.chunk_groups_filtered, 1);
    assert_eq!(stats.chunks_loaded, 0);

    // v > 7 may match: min/max is a bound, not exact filtering, so the
    // chunk is decoded and every row surfaces for re-evaluation.
    let predicate = ScanPredicate {
        column: 0,
        op: CmpOp::Gt,
        value: DataValue::Int32(7),
    };
    let (values, stats) = scan_values_with(&engine, &table, Some(predicate)).await;
    assert_eq!(values, vec![5, 6, 7, 8, 9, 10]);
    assert_eq!(stats.chunk_groups_filtered, 0);
    assert!(stats.chunks_loaded > 0);
}

#[tokio::test]
async fn test_abort_discards_buffer_and_leaves_gap() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(4, 8)))
        .await
        .unwrap();

    let txn = engine.begin();
    for v in 1..=5 {
        table.insert_row(&txn, int_row(v)).await.unwrap();
    }
    engine.abort(txn).await.unwrap();

    // No stripe or chunk metadata survives the abort.
    let snapshot = engine.transaction_manager().snapshot();
    assert!(visible_stripes(&table, &snapshot).is_empty());

    // A fresh insert gets a row number past the burned reservation.
    let txn = engine.begin();
    let id = table.insert_row(&txn, int_row(100)).await.unwrap();
    engine.commit(txn).await.unwrap();
    // The aborted transaction reserved rows 1..=8; the gap is permanent.
    assert_eq!(id.row_number().unwrap(), 9);
    assert_eq!(scan_values(&engine, &table).await, vec![100]);
}

#[tokio::test]
async fn test_subtransaction_abort_and_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(10, 100)))
        .await
        .unwrap();

    let txn = engine.begin();
    table.insert_row(&txn, int_row(1)).await.unwrap();
    txn.begin_subtransaction();
    table.insert_row(&txn, int_row(2)).await.unwrap();
    engine.abort_subtransaction(&txn);
    txn.begin_subtransaction();
    table.insert_row(&txn, int_row(3)).await.unwrap();
    engine.commit_subtransaction(&txn);
    engine.commit(txn).await.unwrap();

    // The aborted subtransaction's row is gone; the committed child's row
    // was elevated to the parent and flushed with it.
    assert_eq!(scan_values(&engine, &table).await, vec![1, 3]);
}

#[tokio::test]
async fn test_update_is_delete_plus_insert() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(4, 4)))
        .await
        .unwrap();
    let ids = insert_rows(&engine, &table, 1..=4).await;

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    let new_id = table
        .update_row(&txn, ids[1], int_row(20), &snapshot)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(new_id, ids[1]);
    // Updating a row that is already gone yields None.
    assert!(table
        .update_row(&txn, ids[1], int_row(21), &snapshot)
        .await
        .unwrap()
        .is_none());
    engine.commit(txn).await.unwrap();

    assert_eq!(scan_values(&engine, &table).await, vec![1, 3, 4, 20]);
}

#[tokio::test]
async fn test_fetch_row_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(4, 4)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=2).await;

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    // Row 3 sits inside the stripe's reservation but was never written: the
    // index lookup finds the stripe, the upper-bound re-check rejects it.
    let id = RowId::from_row_number(3).unwrap();
    assert!(table
        .fetch_row_by_id(&txn, id, &snapshot)
        .await
        .unwrap()
        .is_none());
    // Row id zero decodes to no valid row number at all.
    let bad = RowId {
        block: 0,
        offset: 1,
    };
    assert!(table.fetch_row_by_id(&txn, bad, &snapshot).await.is_err());
    engine.commit(txn).await.unwrap();
}

#[tokio::test]
async fn test_dirty_read_of_foreign_in_progress_stripe() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(10, 100)))
        .await
        .unwrap();

    let writer = engine.begin();
    let id = table.insert_row(&writer, int_row(1)).await.unwrap();
    let row_number = id.row_number().unwrap();

    let reader = engine.begin();
    // Regular snapshot: the in-progress insert simply does not exist.
    let row = table
        .read_row_by_number(&reader, row_number, &reader.snapshot(), &[0, 1])
        .await
        .unwrap();
    assert!(row.is_none());
    // Dirty snapshot: existence is undetermined, the caller gets the
    // all-null placeholder and decides whether to wait.
    let row = table
        .read_row_by_number(&reader, row_number, &reader.dirty_snapshot(), &[0, 1])
        .await
        .unwrap()
        .unwrap();
    assert!(row.iter().all(|v| v.is_null()));

    engine.commit(reader).await.unwrap();
    engine.abort(writer).await.unwrap();
}

#[tokio::test]
async fn test_vacuum_merges_and_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(2, 4)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=10).await;

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    for row_number in [3u64, 7] {
        let id = RowId::from_row_number(row_number).unwrap();
        assert!(table.delete_row(&txn, id, &snapshot).await.unwrap());
    }
    engine.commit(txn).await.unwrap();

    let size_before = table.table_size();
    // Raise the stripe limit so the whole tail qualifies for combining.
    table.set_options(small_options(2, 10)).await.unwrap();
    engine
        .vacuum(table.relation_id(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(table.table_size() < size_before);
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    assert_eq!(stripes.len(), 1);
    assert_eq!(stripes[0].row_count, 8);
    assert_eq!(
        scan_values(&engine, &table).await,
        vec![1, 2, 4, 5, 6, 8, 9, 10]
    );
}

#[tokio::test]
async fn test_vacuum_skips_single_full_stripe() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(2, 4)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=4).await;

    let snapshot = engine.transaction_manager().snapshot();
    let before = visible_stripes(&table, &snapshot);
    engine
        .vacuum(table.relation_id(), &CancellationToken::new())
        .await
        .unwrap();
    let after = visible_stripes(&table, &snapshot);
    // A single full stripe is not rewritten.
    assert_eq!(before[0].stripe_id, after[0].stripe_id);
}

#[tokio::test]
async fn test_vacuum_rewrites_single_stripe_past_deleted_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(5, 10)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=10).await;

    // 3 of 10 rows deleted: 30% > the 20% threshold.
    let txn = engine.begin();
    let snapshot = txn.snapshot();
    for row_number in [2u64, 5, 9] {
        let id = RowId::from_row_number(row_number).unwrap();
        assert!(table.delete_row(&txn, id, &snapshot).await.unwrap());
    }
    engine.commit(txn).await.unwrap();

    let size_before = table.table_size();
    engine
        .vacuum(table.relation_id(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(table.table_size() < size_before);

    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    assert_eq!(stripes.len(), 1);
    assert_eq!(stripes[0].row_count, 7);
    assert_eq!(
        scan_values(&engine, &table).await,
        vec![1, 3, 4, 6, 7, 8, 10]
    );
}

#[tokio::test]
async fn test_vacuum_interruption_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), Some(small_options(2, 4)))
        .await
        .unwrap();
    insert_rows(&engine, &table, 1..=10).await;

    let token = CancellationToken::new();
    token.cancel();
    let result = engine.vacuum(table.relation_id(), &token).await;
    assert!(matches!(result, Err(StorageError::Interrupted)));

    // Partial progress is valid: the table still scans completely.
    assert_eq!(
        scan_values(&engine, &table).await,
        (1..=10).collect::<Vec<i32>>()
    );
}

#[tokio::test]
async fn test_vacuum_reclaims_aborted_flushed_stripe() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    // Large rows so the orphaned extent is big enough to count as a hole.
    let columns = vec![
        ColumnDesc::new("v", DataType::Int32, false),
        ColumnDesc::new("payload", DataType::String, false),
    ];
    let table = engine
        .create_table("t", columns, Some(small_options(2, 2)))
        .await
        .unwrap();
    // Incompressible payload so the extents keep their nominal size.
    let wide_row = |v: i32, len: usize| -> Row {
        let mut state = 0x9e37_79b9_7f4a_7c15u64 ^ (v as u64);
        let payload: String = (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                char::from(b'a' + (state >> 33) as u8 % 26)
            })
            .collect();
        vec![DataValue::Int32(v), DataValue::String(payload)]
    };

    // This transaction crosses the stripe limit, so a large stripe flushes
    // mid-transaction; the abort orphans both its bytes and its metadata.
    let txn = engine.begin();
    table.insert_row(&txn, wide_row(1, 12_000)).await.unwrap();
    table.insert_row(&txn, wide_row(2, 12_000)).await.unwrap();
    engine.abort(txn).await.unwrap();

    // A smaller committed stripe lands after the orphaned extent.
    let txn = engine.begin();
    table.insert_row(&txn, wide_row(3, 4_000)).await.unwrap();
    table.insert_row(&txn, wide_row(4, 4_000)).await.unwrap();
    engine.commit(txn).await.unwrap();

    let size_before = table.table_size();
    engine
        .vacuum(table.relation_id(), &CancellationToken::new())
        .await
        .unwrap();
    // The orphaned extent was reclaimed: the survivor moved into the hole
    // and the tail was truncated.
    assert!(table.table_size() < size_before);
    let snapshot = engine.transaction_manager().snapshot();
    let stripes = visible_stripes(&table, &snapshot);
    assert_eq!(stripes.len(), 1);
    assert_eq!(stripes[0].file_offset, METAPAGE_SIZE);

    let txn = engine.begin();
    let snapshot = txn.snapshot();
    let mut scan = table
        .begin_scan(&txn, snapshot, [0usize], None, CancellationToken::new())
        .await
        .unwrap();
    let ctx = table.read_context();
    let mut values = vec![];
    while let Some((_, row)) = scan.next_row(&ctx).await.unwrap() {
        values.push(row[0].clone());
    }
    assert_eq!(values, vec![DataValue::Int32(3), DataValue::Int32(4)]);
    engine.commit(txn).await.unwrap();
}

#[tokio::test]
async fn test_reopen_recovers_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = test_engine(&dir).await;
        let table = engine
            .create_table("t", int_columns(), Some(small_options(2, 4)))
            .await
            .unwrap();
        insert_rows(&engine, &table, 1..=6).await;
        let txn = engine.begin();
        let snapshot = txn.snapshot();
        let id = RowId::from_row_number(2).unwrap();
        assert!(table.delete_row(&txn, id, &snapshot).await.unwrap());
        engine.commit(txn).await.unwrap();
    }

    let engine = test_engine(&dir).await;
    let table = engine.get_table_by_name("t").unwrap();
    assert_eq!(table.options().stripe_row_limit, 4);
    assert_eq!(scan_values(&engine, &table).await, vec![1, 3, 4, 5, 6]);

    // Reservation counters survived: new rows continue the number space.
    let txn = engine.begin();
    let id = table.insert_row(&txn, int_row(7)).await.unwrap();
    engine.commit(txn).await.unwrap();
    assert!(id.row_number().unwrap() > 6);
    assert_eq!(scan_values(&engine, &table).await, vec![1, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn test_options_rejected_at_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(&dir).await;
    let table = engine
        .create_table("t", int_columns(), None)
        .await
        .unwrap();
    let mut options = table.options();
    options.stripe_row_limit = 0;
    assert!(matches!(
        table.set_options(options).await,
        Err(StorageError::InvalidOptions(_))
    ));
    // Nothing changed.
    assert_eq!(
        table.options().stripe_row_limit,
        ColumnarOptions::default().stripe_row_limit
    );
}
