//! In-memory directory store.
//!
//! Backs the test harness and embedding hosts that bring their own
//! durability. Objects live in a concurrent map keyed by GUID with a name
//! index on the side; sequence numbers are reserved per transaction and made
//! durable on commit. Writers are expected to run one transaction at a time,
//! readers are unrestricted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use tracing::debug;

use dsrepl_core::{ObjectGuid, Usn};

use crate::error::EngineError;
use crate::store::{DirectoryStore, Dn, PartitionId, StoreTxn, StoredObject};

/// In-memory [`DirectoryStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<ObjectGuid, StoredObject>,
    dn_index: RwLock<BTreeMap<String, ObjectGuid>>,
    partitions: RwLock<Vec<(PartitionId, Dn)>>,
    committed_usn: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store with no partitions.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Creates a partition rooted at `dn`, its root object included, and
    /// returns its id. Bypasses the transaction machinery; partition layout
    /// is host configuration, not replicated data.
    pub fn add_partition(&self, dn: Dn) -> PartitionId {
        self.add_partition_with_guid(ObjectGuid::generate(), dn)
    }

    /// Like [`add_partition`](Self::add_partition) but with a caller-chosen
    /// root GUID, so replicas of the same partition share its identity.
    pub fn add_partition_with_guid(&self, guid: ObjectGuid, dn: Dn) -> PartitionId {
        let root = StoredObject::new(guid, dn.clone());
        self.objects.insert(guid, root);
        self.dn_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dn.as_str().to_string(), guid);
        let id = PartitionId(guid);
        self.partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, dn));
        id
    }

    fn index_remove(index: &mut BTreeMap<String, ObjectGuid>, dn: &Dn, guid: ObjectGuid) {
        if index.get(dn.as_str()) == Some(&guid) {
            index.remove(dn.as_str());
        }
    }
}

impl DirectoryStore for MemoryStore {
    fn begin(&self) -> StoreTxn {
        StoreTxn::new(self.committed_usn.load(Ordering::SeqCst) + 1)
    }

    fn commit(&self, txn: StoreTxn) -> Result<(), EngineError> {
        let mut index = self.dn_index.write().unwrap_or_else(|e| e.into_inner());

        for guid in &txn.removals {
            if let Some((_, old)) = self.objects.remove(guid) {
                Self::index_remove(&mut index, &old.dn, *guid);
            }
        }

        for (guid, obj) in txn.writes {
            if let Some(old) = self.objects.get(&guid) {
                if old.dn != obj.dn {
                    Self::index_remove(&mut index, &old.dn, guid);
                }
            }
            index.insert(obj.dn.as_str().to_string(), guid);
            self.objects.insert(guid, obj);
        }

        let reserved_up_to = txn.next_usn.saturating_sub(1);
        self.committed_usn.fetch_max(reserved_up_to, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self, txn: StoreTxn) {
        debug!(
            buffered = txn.writes.len() + txn.removals.len(),
            "aborting transaction"
        );
    }

    fn next_usn(&self, txn: &mut StoreTxn) -> Usn {
        let usn = Usn::new(txn.next_usn);
        txn.next_usn += 1;
        usn
    }

    fn get_by_guid(
        &self,
        txn: Option<&StoreTxn>,
        guid: ObjectGuid,
    ) -> Result<Option<StoredObject>, EngineError> {
        if let Some(txn) = txn {
            if txn.removals.contains(&guid) {
                return Ok(None);
            }
            if let Some(obj) = txn.writes.get(&guid) {
                return Ok(Some(obj.clone()));
            }
        }
        Ok(self.objects.get(&guid).map(|o| o.clone()))
    }

    fn get_by_dn(&self, txn: Option<&StoreTxn>, dn: &Dn) -> Result<Option<StoredObject>, EngineError> {
        if let Some(txn) = txn {
            if let Some(obj) = txn.writes.values().find(|o| &o.dn == dn) {
                return Ok(Some(obj.clone()));
            }
        }
        let guid = {
            let index = self.dn_index.read().unwrap_or_else(|e| e.into_inner());
            match index.get(dn.as_str()) {
                Some(g) => *g,
                None => return Ok(None),
            }
        };
        if let Some(txn) = txn {
            // the committed name points at an object this transaction has
            // already removed or renamed away
            if txn.removals.contains(&guid) || txn.writes.contains_key(&guid) {
                return Ok(None);
            }
        }
        Ok(self.objects.get(&guid).map(|o| o.clone()))
    }

    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    fn partition_of(&self, dn: &Dn) -> Result<PartitionId, EngineError> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions
            .iter()
            .filter(|(_, root)| dn.is_under(root))
            .max_by_key(|(_, root)| root.depth())
            .map(|(id, _)| *id)
            .ok_or_else(|| EngineError::DnNotFound(dn.as_str().to_string()))
    }

    fn partition_dn(&self, partition: PartitionId) -> Result<Dn, EngineError> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions
            .iter()
            .find(|(id, _)| *id == partition)
            .map(|(_, root)| root.clone())
            .ok_or_else(|| EngineError::ObjectNotFound(partition.0))
    }

    fn deleted_objects_dn(&self, partition: PartitionId) -> Result<Dn, EngineError> {
        Ok(self.partition_dn(partition)?.child("CN=Deleted Objects"))
    }

    fn objects_in_partition(&self, partition: PartitionId) -> Result<Vec<ObjectGuid>, EngineError> {
        let root = self.partition_dn(partition)?;
        let mut out: Vec<ObjectGuid> = Vec::new();
        for entry in self.objects.iter() {
            if entry.dn.is_under(&root) && self.partition_of(&entry.dn)? == partition {
                out.push(entry.guid);
            }
        }
        out.sort();
        Ok(out)
    }

    fn highest_committed_usn(&self) -> Usn {
        Usn::new(self.committed_usn.load(Ordering::SeqCst))
    }
}
