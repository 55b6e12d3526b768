//! The deletion lifecycle.
//!
//! Deletion is a forward-only state machine: Live, Deleted, Recycled,
//! Tombstone, then physical purge. Without the recycle bin a delete goes
//! straight from Live to Tombstone. Each transition is an originating write:
//! the markers it sets are stamped and replicate like any other attribute, so
//! the deletion itself converges across the replicated set.

use tracing::debug;

use dsrepl_core::{AttributeId, ObjectGuid, Timestamp};

use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::store::{DeletionState, DirectoryStore, Dn, StoredObject};
use crate::txn::ReplTxn;

/// Attributes that survive stripping regardless of schema flags.
pub const PRESERVED_ATTRIBUTES: &[AttributeId] = &[
    AttributeId::INSTANCE_TYPE,
    AttributeId::NAME,
    AttributeId::IS_DELETED,
    AttributeId::IS_RECYCLED,
    AttributeId::LAST_KNOWN_PARENT,
    AttributeId::LAST_KNOWN_RDN,
];

fn deleted_rdn(obj: &StoredObject) -> String {
    let rdn = obj.dn.rdn();
    let attr_type = rdn.split_once('=').map(|(t, _)| t).unwrap_or("CN");
    format!("{}={}\nDEL:{}", attr_type, obj.dn.rdn_value(), obj.guid)
}

impl ReplEngine {
    /// Advances an object one step along the deletion lifecycle.
    ///
    /// Live objects become Deleted (Tombstone when the recycle bin is off),
    /// Deleted become Recycled, Recycled become Tombstone. Tombstones only
    /// leave the store through [`purge_tombstone`](Self::purge_tombstone).
    pub fn delete_object(&self, guid: ObjectGuid, now: Timestamp) -> Result<(), EngineError> {
        let mut txn = self.begin();
        let result = self.delete_in_txn(&mut txn, guid, now);
        match result {
            Ok(()) => txn.commit(self.schema()),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn delete_in_txn(
        &self,
        txn: &mut ReplTxn<'_>,
        guid: ObjectGuid,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut obj = txn.get(guid)?.ok_or(EngineError::ObjectNotFound(guid))?;

        let target = match obj.deletion_state {
            DeletionState::Live if self.recycle_bin_enabled() => DeletionState::Deleted,
            DeletionState::Live => DeletionState::Tombstone,
            DeletionState::Deleted => DeletionState::Recycled,
            DeletionState::Recycled => DeletionState::Tombstone,
            DeletionState::Tombstone => {
                return Err(EngineError::DeletionStateViolation(guid));
            }
        };
        debug!(object = %guid, from = ?obj.deletion_state, to = ?target, "deletion transition");

        if obj.deletion_state == DeletionState::Live {
            self.first_delete(txn, &mut obj, now)?;
        }
        if matches!(target, DeletionState::Recycled | DeletionState::Tombstone)
            && obj.deletion_state < DeletionState::Recycled
        {
            self.strip(txn, &mut obj, now)?;
        }
        if target == DeletionState::Recycled {
            let usn = txn.txn_usn();
            obj.attributes.insert(AttributeId::IS_RECYCLED, vec![1]);
            obj.metadata
                .stamp_local_write(AttributeId::IS_RECYCLED, self.replica_id(), now, usn);
        }

        obj.deletion_state = target;
        obj.metadata
            .sort_for_storage(self.schema().naming_attribute());
        txn.put(obj);
        Ok(())
    }

    /// First transition out of Live: mark deleted, record the old parent and
    /// move under the deleted-objects container with a mangled name.
    fn first_delete(
        &self,
        txn: &mut ReplTxn<'_>,
        obj: &mut StoredObject,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let usn = txn.txn_usn();
        let replica = self.replica_id();

        obj.attributes.insert(AttributeId::IS_DELETED, vec![1]);
        obj.metadata
            .stamp_local_write(AttributeId::IS_DELETED, replica, now, usn);

        if let Some(parent) = obj.dn.parent() {
            obj.attributes.insert(
                AttributeId::LAST_KNOWN_PARENT,
                parent.as_str().as_bytes().to_vec(),
            );
            obj.metadata
                .stamp_local_write(AttributeId::LAST_KNOWN_PARENT, replica, now, usn);
        }

        let rdn = deleted_rdn(obj);
        let new_dn = if obj.disallow_move_on_delete {
            match obj.dn.parent() {
                Some(parent) => parent.child(&rdn),
                None => Dn::new(rdn),
            }
        } else {
            let partition = self.store().partition_of(&obj.dn)?;
            self.store().deleted_objects_dn(partition)?.child(&rdn)
        };
        obj.dn = new_dn.clone();
        let naming = self.schema().naming_attribute();
        obj.attributes
            .insert(naming, new_dn.rdn_value().as_bytes().to_vec());
        obj.metadata.stamp_local_write(naming, replica, now, usn);
        Ok(())
    }

    /// Entering Recycled or Tombstone: snapshot the last-known naming value,
    /// drop every attribute off the preserved allowlist and tear down all
    /// forward links in both directions.
    fn strip(
        &self,
        txn: &mut ReplTxn<'_>,
        obj: &mut StoredObject,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let usn = txn.txn_usn();
        let replica = self.replica_id();

        obj.attributes.insert(
            AttributeId::LAST_KNOWN_RDN,
            obj.dn.rdn_value().as_bytes().to_vec(),
        );
        obj.metadata
            .stamp_local_write(AttributeId::LAST_KNOWN_RDN, replica, now, usn);

        let stripped: Vec<AttributeId> = obj
            .attributes
            .keys()
            .copied()
            .filter(|id| !PRESERVED_ATTRIBUTES.contains(id))
            .filter(|id| {
                self.schema()
                    .attribute(*id)
                    .map(|d| !d.preserved_on_delete)
                    .unwrap_or(true)
            })
            .collect();
        for id in stripped {
            obj.attributes.remove(&id);
            let replicated = self
                .schema()
                .attribute(id)
                .map(|d| d.replicated)
                .unwrap_or(false);
            if replicated {
                obj.metadata.stamp_local_write(id, replica, now, usn);
            }
        }

        // own forward links: deactivate every active value
        let forward: Vec<(AttributeId, Vec<ObjectGuid>)> = obj
            .links
            .iter()
            .map(|(id, values)| {
                (
                    *id,
                    values
                        .iter()
                        .filter(|v| v.active)
                        .map(|v| v.target)
                        .collect(),
                )
            })
            .collect();
        for (attr, targets) in forward {
            for target in targets {
                self.local_link_delete(obj, attr, target, now, txn)?;
            }
        }

        // inbound links: deactivate the forward value on each source object
        let inbound: Vec<ObjectGuid> = obj.backlinks.values().flatten().copied().collect();
        for source_guid in inbound {
            if let Some(mut source) = txn.get(source_guid)? {
                self.retract_links_to(&mut source, obj.guid, now, txn)?;
                txn.put(source);
            }
        }
        obj.backlinks.clear();

        Ok(())
    }

    /// Deactivates every active forward-link value on `source` that targets
    /// `gone`.
    fn retract_links_to(
        &self,
        source: &mut StoredObject,
        gone: ObjectGuid,
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) -> Result<(), EngineError> {
        let attrs: Vec<AttributeId> = source
            .links
            .iter()
            .filter(|(_, values)| values.iter().any(|v| v.active && v.target == gone))
            .map(|(id, _)| *id)
            .collect();
        for attr in attrs {
            self.local_link_delete(source, attr, gone, now, txn)?;
        }
        Ok(())
    }

    /// Physically removes a stripped object. Requires system privilege; only
    /// garbage collection and explicit administrative removal qualify.
    pub fn purge_tombstone(
        &self,
        guid: ObjectGuid,
        privileged: bool,
    ) -> Result<(), EngineError> {
        if !privileged {
            return Err(EngineError::PermissionDenied);
        }
        let mut txn = self.begin();
        let result = (|| {
            let obj = txn.get(guid)?.ok_or(EngineError::ObjectNotFound(guid))?;
            if !matches!(
                obj.deletion_state,
                DeletionState::Recycled | DeletionState::Tombstone
            ) {
                return Err(EngineError::DeletionStateViolation(guid));
            }
            txn.remove(guid);
            Ok(())
        })();
        match result {
            Ok(()) => txn.commit(self.schema()),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }
}
