// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{SubXid, TxnId};

/// Which transactions a snapshot considers visible.
///
/// `Mvcc` sees exactly the transactions committed at snapshot time plus the
/// observer's own non-aborted work. `Dirty` additionally sees in-progress
/// transactions; it is used only for constraint-style existence checks and
/// index build scans, never for regular queries.
#[derive(Clone)]
pub struct Snapshot {
    committed: Arc<HashSet<TxnId>>,
    aborted: Arc<HashSet<TxnId>>,
    dirty: bool,
    observer: Option<SnapshotObserver>,
}

#[derive(Clone)]
pub(super) struct SnapshotObserver {
    pub xid: TxnId,
    pub aborted_subxids: Arc<RwLock<HashSet<SubXid>>>,
}

impl Snapshot {
    pub(super) fn new(
        committed: Arc<HashSet<TxnId>>,
        aborted: Arc<HashSet<TxnId>>,
        dirty: bool,
        observer: Option<SnapshotObserver>,
    ) -> Self {
        Self {
            committed,
            aborted,
            dirty,
            observer,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Transaction id of the snapshot owner, if any.
    pub fn observer_xid(&self) -> Option<TxnId> {
        self.observer.as_ref().map(|o| o.xid)
    }

    /// Whether work done by `(xid, subxid)` is visible under this snapshot.
    pub fn xid_visible(&self, xid: TxnId, subxid: SubXid) -> bool {
        if let Some(observer) = &self.observer {
            if observer.xid == xid {
                return !observer.aborted_subxids.read().contains(&subxid);
            }
        }
        if self.dirty {
            // An in-progress insert exists for a dirty reader; only a known
            // rollback hides it.
            !self.aborted.contains(&xid)
        } else {
            self.committed.contains(&xid)
        }
    }

    /// Visibility of a versioned row: the insert must be visible and the
    /// delete mark, if present, must not be.
    pub fn row_visible(
        &self,
        insert: (TxnId, SubXid),
        delete: Option<(TxnId, SubXid)>,
    ) -> bool {
        if !self.xid_visible(insert.0, insert.1) {
            return false;
        }
        match delete {
            Some((xid, subxid)) => !self.xid_visible(xid, subxid),
            None => true,
        }
    }
}
