//! The engine-level transaction.
//!
//! Wraps a store transaction with the two pieces of state the replication
//! paths need: the lazily reserved shared sequence number for the current
//! operation, and the deferred backlink queue. Sequence numbers are reserved
//! only once a change is certain; a transaction that touches nothing commits
//! without consuming one.

use dsrepl_core::{ObjectGuid, Usn};

use crate::backlink::{self, BacklinkJob};
use crate::error::EngineError;
use crate::schema::Schema;
use crate::store::{DirectoryStore, Dn, StoreTxn, StoredObject};

/// An open engine transaction.
pub struct ReplTxn<'a> {
    store: &'a dyn DirectoryStore,
    pub(crate) inner: StoreTxn,
    shared_usn: Option<Usn>,
    pub(crate) backlinks: Vec<BacklinkJob>,
}

impl<'a> ReplTxn<'a> {
    pub(crate) fn begin(store: &'a dyn DirectoryStore) -> Self {
        ReplTxn {
            inner: store.begin(),
            store,
            shared_usn: None,
            backlinks: Vec::new(),
        }
    }

    /// The sequence number shared by every stamp of the current operation.
    /// Reserved on first use.
    pub(crate) fn txn_usn(&mut self) -> Usn {
        match self.shared_usn {
            Some(usn) => usn,
            None => {
                let usn = self.store.next_usn(&mut self.inner);
                self.shared_usn = Some(usn);
                usn
            }
        }
    }

    /// Reserves a fresh sequence number, distinct from the shared one. Used
    /// where each item needs its own watermark (inbound batch application).
    pub(crate) fn alloc_usn(&mut self) -> Usn {
        self.store.next_usn(&mut self.inner)
    }

    /// Starts a new operation within the same transaction: the next call to
    /// [`txn_usn`](Self::txn_usn) reserves a fresh shared sequence number.
    pub(crate) fn next_operation(&mut self) {
        self.shared_usn = None;
    }

    /// Reads an object, seeing this transaction's buffered writes.
    pub(crate) fn get(&self, guid: ObjectGuid) -> Result<Option<StoredObject>, EngineError> {
        self.store.get_by_guid(Some(&self.inner), guid)
    }

    /// Reads an object by name, seeing this transaction's buffered writes.
    pub(crate) fn get_by_dn(&self, dn: &Dn) -> Result<Option<StoredObject>, EngineError> {
        self.store.get_by_dn(Some(&self.inner), dn)
    }

    /// Buffers a create-or-replace.
    pub(crate) fn put(&mut self, obj: StoredObject) {
        self.inner.put(obj);
    }

    /// Buffers a physical removal.
    pub(crate) fn remove(&mut self, guid: ObjectGuid) {
        self.inner.remove(guid);
    }

    /// Queues a backlink fixup for the commit-time drain.
    pub(crate) fn enqueue_backlink(&mut self, job: BacklinkJob) {
        self.backlinks.push(job);
    }

    /// Drains the backlink queue and commits the write set atomically.
    pub(crate) fn commit(mut self, schema: &dyn Schema) -> Result<(), EngineError> {
        backlink::drain(&mut self, schema)?;
        self.store.commit(self.inner)
    }

    /// Discards everything, reserved sequence numbers included.
    pub(crate) fn abort(self) {
        self.store.abort(self.inner);
    }
}
