// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Minimal model of the transactional host the engine runs inside.
//!
//! The storage core inherits visibility and rollback for its metadata from
//! whatever transaction system hosts it. This module provides that contract:
//! transaction ids, a subtransaction stack, MVCC snapshots, and the advisory
//! per-storage lock used to serialize in-place row-mask mutation.

mod snapshot;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
pub use snapshot::Snapshot;
use snapshot::SnapshotObserver;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::catalog::StorageId;
use crate::storage::manifest::ManifestOp;
use crate::storage::{StorageError, StorageResult};

pub type TxnId = u64;
pub type SubXid = u32;

/// Subtransaction id of the top-level transaction itself.
pub const TOP_SUB_XID: SubXid = 1;

/// First transaction id handed out. Id 0 is the bootstrap "transaction" that
/// owns everything replayed from the manifest.
pub const BOOTSTRAP_XID: TxnId = 0;

#[derive(Default)]
struct TxnTable {
    active: HashSet<TxnId>,
    committed: HashSet<TxnId>,
    aborted: HashSet<TxnId>,
}

/// Allocates transaction ids, tracks commit state, and owns the advisory
/// storage locks.
pub struct TransactionManager {
    next_xid: AtomicU64,
    txns: Mutex<TxnTable>,
    storage_locks: Mutex<HashMap<StorageId, Arc<tokio::sync::Mutex<()>>>>,
    lock_wait_timeout: Duration,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        let mut txns = TxnTable::default();
        txns.committed.insert(BOOTSTRAP_XID);
        Self {
            next_xid: AtomicU64::new(BOOTSTRAP_XID + 1),
            txns: Mutex::new(txns),
            storage_locks: Mutex::new(HashMap::new()),
            lock_wait_timeout: Duration::from_secs(5),
        }
    }

    pub fn begin(self: &Arc<Self>) -> Transaction {
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        self.txns.lock().active.insert(xid);
        Transaction {
            xid,
            mgr: self.clone(),
            inner: Mutex::new(TxnInner {
                subxid_stack: vec![TOP_SUB_XID],
                next_subxid: TOP_SUB_XID + 1,
                finished: false,
            }),
            aborted_subxids: Arc::new(RwLock::new(HashSet::new())),
            pending_manifest: Mutex::new(Vec::new()),
            storage_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_committed(&self, xid: TxnId) -> bool {
        self.txns.lock().committed.contains(&xid)
    }

    pub fn is_aborted(&self, xid: TxnId) -> bool {
        self.txns.lock().aborted.contains(&xid)
    }

    /// Whether `xid` rolled back, or is not known at all (a transaction from
    /// a previous engine lifetime that never reached the manifest).
    pub fn is_aborted_or_gone(&self, xid: TxnId) -> bool {
        let txns = self.txns.lock();
        txns.aborted.contains(&xid)
            || (!txns.active.contains(&xid) && !txns.committed.contains(&xid))
    }

    pub(crate) fn mark_committed(&self, xid: TxnId) {
        let mut txns = self.txns.lock();
        txns.active.remove(&xid);
        txns.committed.insert(xid);
    }

    pub(crate) fn mark_aborted(&self, xid: TxnId) {
        let mut txns = self.txns.lock();
        txns.active.remove(&xid);
        txns.aborted.insert(xid);
    }

    fn committed_set(&self) -> Arc<HashSet<TxnId>> {
        Arc::new(self.txns.lock().committed.clone())
    }

    fn aborted_set(&self) -> Arc<HashSet<TxnId>> {
        Arc::new(self.txns.lock().aborted.clone())
    }

    /// An MVCC snapshot with no owning transaction.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.committed_set(), self.aborted_set(), false, None)
    }

    fn storage_lock(&self, storage_id: StorageId) -> Arc<tokio::sync::Mutex<()>> {
        self.storage_locks
            .lock()
            .entry(storage_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire the advisory lock for `storage_id`, waiting up to the
    /// host-level lock wait timeout. Used by vacuum, which must not queue
    /// behind long writers forever.
    pub(crate) async fn lock_storage_with_timeout(
        &self,
        storage_id: StorageId,
    ) -> StorageResult<OwnedMutexGuard<()>> {
        let lock = self.storage_lock(storage_id);
        tokio::time::timeout(self.lock_wait_timeout, lock.lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout(storage_id))
    }

    /// Acquire the advisory lock for `storage_id`, waiting indefinitely.
    pub(crate) async fn lock_storage(&self, storage_id: StorageId) -> OwnedMutexGuard<()> {
        self.storage_lock(storage_id).lock_owned().await
    }
}

struct TxnInner {
    subxid_stack: Vec<SubXid>,
    next_subxid: SubXid,
    finished: bool,
}

/// One open transaction. Obtained from [`TransactionManager::begin`];
/// finished through the engine's commit/abort entry points, which run the
/// write-state and row-mask lifecycle hooks before flipping the state here.
pub struct Transaction {
    xid: TxnId,
    mgr: Arc<TransactionManager>,
    inner: Mutex<TxnInner>,
    aborted_subxids: Arc<RwLock<HashSet<SubXid>>>,
    pending_manifest: Mutex<Vec<ManifestOp>>,
    storage_locks: Mutex<HashMap<StorageId, OwnedMutexGuard<()>>>,
}

impl Transaction {
    pub fn xid(&self) -> TxnId {
        self.xid
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.mgr
    }

    /// Subtransaction currently accepting work.
    pub fn current_subxid(&self) -> SubXid {
        *self.inner.lock().subxid_stack.last().unwrap()
    }

    /// All open subtransaction ids, outermost first.
    pub fn subxid_stack(&self) -> Vec<SubXid> {
        self.inner.lock().subxid_stack.clone()
    }

    /// Open a new subtransaction scope.
    pub fn begin_subtransaction(&self) -> SubXid {
        let mut inner = self.inner.lock();
        let subxid = inner.next_subxid;
        inner.next_subxid += 1;
        inner.subxid_stack.push(subxid);
        subxid
    }

    /// Pop the innermost subtransaction on commit; the engine re-tags its
    /// caches to the parent scope. Returns `(child, parent)`.
    pub(crate) fn pop_subtransaction_commit(&self) -> (SubXid, SubXid) {
        let mut inner = self.inner.lock();
        assert!(inner.subxid_stack.len() > 1, "no open subtransaction");
        let child = inner.subxid_stack.pop().unwrap();
        let parent = *inner.subxid_stack.last().unwrap();
        (child, parent)
    }

    /// Pop the innermost subtransaction on abort. Everything it inserted
    /// becomes invisible.
    pub(crate) fn pop_subtransaction_abort(&self) -> SubXid {
        let mut inner = self.inner.lock();
        assert!(inner.subxid_stack.len() > 1, "no open subtransaction");
        let child = inner.subxid_stack.pop().unwrap();
        self.aborted_subxids.write().insert(child);
        child
    }

    /// An MVCC snapshot that additionally sees this transaction's own
    /// non-aborted work.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.mgr.committed_set(),
            self.mgr.aborted_set(),
            false,
            Some(SnapshotObserver {
                xid: self.xid,
                aborted_subxids: self.aborted_subxids.clone(),
            }),
        )
    }

    /// A dirty snapshot for existence checks: sees in-progress transactions.
    pub fn dirty_snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.mgr.committed_set(),
            self.mgr.aborted_set(),
            true,
            Some(SnapshotObserver {
                xid: self.xid,
                aborted_subxids: self.aborted_subxids.clone(),
            }),
        )
    }

    /// Take the advisory lock on `storage_id` and hold it until transaction
    /// end. Re-acquisition by the holder is a no-op.
    pub(crate) async fn acquire_storage_lock(&self, storage_id: StorageId) {
        if self.storage_locks.lock().contains_key(&storage_id) {
            return;
        }
        let guard = self.mgr.lock_storage(storage_id).await;
        self.storage_locks.lock().insert(storage_id, guard);
    }

    /// Like [`Self::acquire_storage_lock`] but bounded by the host lock wait
    /// timeout. Used on the vacuum path.
    pub(crate) async fn acquire_storage_lock_with_timeout(
        &self,
        storage_id: StorageId,
    ) -> StorageResult<()> {
        if self.storage_locks.lock().contains_key(&storage_id) {
            return Ok(());
        }
        let guard = self.mgr.lock_storage_with_timeout(storage_id).await?;
        self.storage_locks.lock().insert(storage_id, guard);
        Ok(())
    }

    pub(crate) fn push_manifest_op(&self, op: ManifestOp) {
        self.pending_manifest.lock().push(op);
    }

    pub(crate) fn take_manifest_ops(&self) -> Vec<ManifestOp> {
        std::mem::take(&mut *self.pending_manifest.lock())
    }

    /// Flip to finished and release advisory locks. Called by the engine
    /// after its lifecycle hooks ran.
    pub(crate) fn finish(&self, committed: bool) {
        {
            let mut inner = self.inner.lock();
            assert!(!inner.finished, "transaction finished twice");
            inner.finished = true;
        }
        if committed {
            self.mgr.mark_committed(self.xid);
        } else {
            self.mgr.mark_aborted(self.xid);
        }
        self.storage_locks.lock().clear();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.inner.lock().finished {
            warn!(xid = self.xid, "transaction dropped without commit or abort");
            self.mgr.mark_aborted(self.xid);
        }
    }
}
