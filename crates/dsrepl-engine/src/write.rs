//! Local originating writes: create, modify, rename.
//!
//! Every mutation that goes through here is stamped against this replica's
//! identity. All stamps produced by one call share a single sequence number,
//! reserved only once the first real change is certain; a modify whose every
//! change is suppressed commits without consuming one.

use tracing::debug;

use dsrepl_core::{AttributeId, ObjectGuid, Timestamp};

use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::store::{AttrChange, DeletionState, DirectoryStore, Dn, StoredObject};
use crate::txn::ReplTxn;

impl ReplEngine {
    /// Creates an object at `dn` with the given plain attribute values.
    ///
    /// The naming attribute is derived from the name's first component and
    /// stamped along with every replicated attribute supplied. Link values
    /// are added through [`modify_object`](Self::modify_object) afterwards.
    pub fn create_object(
        &self,
        dn: &Dn,
        guid: ObjectGuid,
        attributes: Vec<(AttributeId, Vec<u8>)>,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin();
        let result = self.create_in_txn(&mut txn, dn, guid, attributes, now);
        match result {
            Ok(()) => txn.commit(self.schema()),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn create_in_txn(
        &self,
        txn: &mut ReplTxn<'_>,
        dn: &Dn,
        guid: ObjectGuid,
        attributes: Vec<(AttributeId, Vec<u8>)>,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        self.store().partition_of(dn)?;
        if txn.get_by_dn(dn)?.is_some() {
            return Err(EngineError::DnExists(dn.as_str().to_string()));
        }
        if let Some(parent) = dn.parent() {
            if txn.get_by_dn(&parent)?.is_none() {
                return Err(EngineError::DnNotFound(parent.as_str().to_string()));
            }
        }

        let naming = self.schema().naming_attribute();
        let mut obj = StoredObject::new(guid, dn.clone());
        let usn = txn.txn_usn();

        for (id, value) in attributes {
            let def = self.schema().attribute(id)?;
            obj.attributes.insert(id, value);
            // the naming attribute is stamped once below, even when the
            // caller supplies its value explicitly
            if def.replicated && id != naming {
                obj.metadata
                    .stamp_local_write(id, self.replica_id(), now, usn);
            }
        }
        obj.attributes
            .entry(naming)
            .or_insert_with(|| dn.rdn_value().as_bytes().to_vec());
        obj.metadata
            .stamp_local_write(naming, self.replica_id(), now, usn);

        obj.metadata.sort_for_storage(naming);
        txn.put(obj);
        Ok(())
    }

    /// Applies a set of changes to an object as one originating write.
    ///
    /// Unchanged plain values are suppressed without a version bump.
    /// Non-replicated attributes are written but never stamped. Objects in
    /// the Recycled or Tombstone states reject all modification.
    pub fn modify_object(
        &self,
        guid: ObjectGuid,
        changes: &[AttrChange],
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin();
        let result = self.modify_in_txn(&mut txn, guid, changes, now);
        match result {
            Ok(()) => txn.commit(self.schema()),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn modify_in_txn(
        &self,
        txn: &mut ReplTxn<'_>,
        guid: ObjectGuid,
        changes: &[AttrChange],
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut obj = txn.get(guid)?.ok_or(EngineError::ObjectNotFound(guid))?;
        if matches!(
            obj.deletion_state,
            DeletionState::Recycled | DeletionState::Tombstone
        ) {
            return Err(EngineError::DeletionStateViolation(guid));
        }

        let mut changed = false;
        for change in changes {
            match change {
                AttrChange::Put { attribute, value } => {
                    if obj.attributes.get(attribute) == Some(value) {
                        debug!(object = %guid, attribute = %attribute, "suppressing no-op value write");
                        continue;
                    }
                    let def = self.schema().attribute(*attribute)?;
                    obj.attributes.insert(*attribute, value.clone());
                    if def.replicated {
                        let usn = txn.txn_usn();
                        obj.metadata
                            .stamp_local_write(*attribute, self.replica_id(), now, usn);
                    }
                    changed = true;
                }
                AttrChange::Remove { attribute } => {
                    if obj.attributes.remove(attribute).is_none() {
                        continue;
                    }
                    let def = self.schema().attribute(*attribute)?;
                    if def.replicated {
                        let usn = txn.txn_usn();
                        obj.metadata
                            .stamp_local_write(*attribute, self.replica_id(), now, usn);
                    }
                    changed = true;
                }
                AttrChange::LinkAdd {
                    attribute,
                    target,
                    target_name,
                } => {
                    self.schema().link_pair(*attribute)?;
                    self.local_link_add(&mut obj, *attribute, *target, target_name, now, txn)?;
                    changed = true;
                }
                AttrChange::LinkDelete { attribute, target } => {
                    self.schema().link_pair(*attribute)?;
                    self.local_link_delete(&mut obj, *attribute, *target, now, txn)?;
                    changed = true;
                }
                AttrChange::LinkReplace { attribute, targets } => {
                    self.schema().link_pair(*attribute)?;
                    self.local_link_replace(&mut obj, *attribute, targets, now, txn)?;
                    changed = true;
                }
            }
        }

        if changed {
            obj.metadata
                .sort_for_storage(self.schema().naming_attribute());
            txn.put(obj);
        }
        Ok(())
    }

    /// Renames an object, restamping the naming attribute.
    pub fn rename_object(
        &self,
        guid: ObjectGuid,
        new_dn: &Dn,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin();
        let result = self.rename_in_txn(&mut txn, guid, new_dn, now);
        match result {
            Ok(()) => txn.commit(self.schema()),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn rename_in_txn(
        &self,
        txn: &mut ReplTxn<'_>,
        guid: ObjectGuid,
        new_dn: &Dn,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut obj = txn.get(guid)?.ok_or(EngineError::ObjectNotFound(guid))?;
        if obj.deletion_state.is_deleted() {
            return Err(EngineError::DeletionStateViolation(guid));
        }
        if &obj.dn == new_dn {
            return Ok(());
        }
        if txn.get_by_dn(new_dn)?.is_some() {
            return Err(EngineError::DnExists(new_dn.as_str().to_string()));
        }
        if let Some(parent) = new_dn.parent() {
            if txn.get_by_dn(&parent)?.is_none() {
                return Err(EngineError::DnNotFound(parent.as_str().to_string()));
            }
        }

        let naming = self.schema().naming_attribute();
        let usn = txn.txn_usn();
        obj.dn = new_dn.clone();
        obj.attributes
            .insert(naming, new_dn.rdn_value().as_bytes().to_vec());
        obj.metadata
            .stamp_local_write(naming, self.replica_id(), now, usn);
        obj.metadata.sort_for_storage(naming);
        txn.put(obj);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::memstore::MemoryStore;
    use crate::schema::TestSchema;
    use dsrepl_core::{ReplicaId, Usn};

    fn build(schema: TestSchema) -> (ReplEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.add_partition(Dn::new("DC=example"));
        let engine = ReplEngine::new(
            store.clone(),
            Arc::new(schema),
            EngineConfig {
                replica_id: ReplicaId::from_bytes([1; 16]),
                recycle_bin_enabled: false,
            },
        );
        (engine, store)
    }

    fn engine() -> (ReplEngine, Arc<MemoryStore>, AttributeId) {
        let mut schema = TestSchema::new(AttributeId::NAME);
        let descr = schema.plain(0x200, "description");
        let (engine, store) = build(schema);
        (engine, store, descr)
    }

    fn t(v: u64) -> Timestamp {
        Timestamp::new(v)
    }

    #[test]
    fn create_stamps_naming_and_attributes() {
        let (engine, store, descr) = engine();
        let guid = ObjectGuid::generate();
        let dn = Dn::new("CN=Alice,DC=example");
        engine
            .create_object(&dn, guid, vec![(descr, b"hi".to_vec())], t(10))
            .unwrap();

        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert_eq!(obj.attributes.get(&descr).unwrap(), b"hi");
        assert_eq!(obj.attributes.get(&AttributeId::NAME).unwrap(), b"Alice");
        let naming = obj.metadata.find(AttributeId::NAME).unwrap();
        assert_eq!(naming.version, 1);
        // naming attribute pinned last
        assert_eq!(
            obj.metadata.stamps().last().unwrap().attribute_id,
            AttributeId::NAME
        );
        // both stamps share one sequence number
        assert_eq!(
            obj.metadata.find(descr).unwrap().local_usn,
            naming.local_usn
        );
    }

    #[test]
    fn create_with_explicit_naming_value_stamps_it_once() {
        let (engine, store, _) = engine();
        let guid = ObjectGuid::generate();
        engine
            .create_object(
                &Dn::new("CN=Alice,DC=example"),
                guid,
                vec![(AttributeId::NAME, b"Alice".to_vec())],
                t(10),
            )
            .unwrap();
        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert_eq!(obj.attributes.get(&AttributeId::NAME).unwrap(), b"Alice");
        // a first write starts at version 1, caller-supplied or not
        assert_eq!(obj.metadata.find(AttributeId::NAME).unwrap().version, 1);
        assert_eq!(obj.metadata.stamps().len(), 1);
    }

    #[test]
    fn create_rejects_duplicate_dn() {
        let (engine, _, descr) = engine();
        let dn = Dn::new("CN=Alice,DC=example");
        engine
            .create_object(&dn, ObjectGuid::generate(), vec![(descr, b"a".to_vec())], t(1))
            .unwrap();
        let err = engine
            .create_object(&dn, ObjectGuid::generate(), vec![], t(2))
            .unwrap_err();
        assert!(matches!(err, EngineError::DnExists(_)));
    }

    #[test]
    fn create_requires_parent() {
        let (engine, _, _) = engine();
        let err = engine
            .create_object(
                &Dn::new("CN=X,OU=Missing,DC=example"),
                ObjectGuid::generate(),
                vec![],
                t(1),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::DnNotFound(_)));
    }

    #[test]
    fn modify_bumps_version_and_suppresses_noops() {
        let (engine, store, descr) = engine();
        let guid = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=A,DC=example"), guid, vec![(descr, b"v1".to_vec())], t(1))
            .unwrap();

        engine
            .modify_object(
                guid,
                &[AttrChange::Put {
                    attribute: descr,
                    value: b"v2".to_vec(),
                }],
                t(2),
            )
            .unwrap();
        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert_eq!(obj.metadata.find(descr).unwrap().version, 2);
        let usn_after = obj.metadata.find(descr).unwrap().local_usn;

        // identical value: no bump, no new sequence number
        engine
            .modify_object(
                guid,
                &[AttrChange::Put {
                    attribute: descr,
                    value: b"v2".to_vec(),
                }],
                t(3),
            )
            .unwrap();
        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert_eq!(obj.metadata.find(descr).unwrap().version, 2);
        assert_eq!(obj.metadata.find(descr).unwrap().local_usn, usn_after);
        assert_eq!(store.highest_committed_usn(), usn_after);
    }

    #[test]
    fn modify_skips_stamp_for_non_replicated() {
        let mut schema = TestSchema::new(AttributeId::NAME);
        let cons = schema.constructed(0x300, "derived");
        let (engine, store) = build(schema);
        let guid = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=B,DC=example"), guid, vec![], t(1))
            .unwrap();
        engine
            .modify_object(
                guid,
                &[AttrChange::Put {
                    attribute: cons,
                    value: b"x".to_vec(),
                }],
                t(2),
            )
            .unwrap();
        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert!(obj.attributes.contains_key(&cons));
        assert!(obj.metadata.find(cons).is_none());
    }

    #[test]
    fn rename_restamps_naming_attribute() {
        let (engine, store, _) = engine();
        let guid = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=Old,DC=example"), guid, vec![], t(1))
            .unwrap();
        engine
            .rename_object(guid, &Dn::new("CN=New,DC=example"), t(2))
            .unwrap();
        let obj = store.get_by_guid(None, guid).unwrap().unwrap();
        assert_eq!(obj.dn, Dn::new("CN=New,DC=example"));
        assert_eq!(obj.attributes.get(&AttributeId::NAME).unwrap(), b"New");
        assert_eq!(obj.metadata.find(AttributeId::NAME).unwrap().version, 2);
    }

    #[test]
    fn link_add_creates_backlink_at_commit() {
        let mut schema = TestSchema::new(AttributeId::NAME);
        let member = schema.link(0x100, "member", 0x101, "memberOf");
        let back = AttributeId::new(0x101);
        let (engine, store) = build(schema);

        let group = ObjectGuid::generate();
        let user = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=G,DC=example"), group, vec![], t(1))
            .unwrap();
        engine
            .create_object(&Dn::new("CN=U,DC=example"), user, vec![], t(1))
            .unwrap();

        engine
            .modify_object(
                group,
                &[AttrChange::LinkAdd {
                    attribute: member,
                    target: user,
                    target_name: "CN=U,DC=example".to_string(),
                }],
                t(2),
            )
            .unwrap();

        let u = store.get_by_guid(None, user).unwrap().unwrap();
        assert!(u.backlinks.get(&back).unwrap().contains(&group));

        engine
            .modify_object(
                group,
                &[AttrChange::LinkDelete {
                    attribute: member,
                    target: user,
                }],
                t(3),
            )
            .unwrap();
        let u = store.get_by_guid(None, user).unwrap().unwrap();
        assert!(u.backlinks.get(&back).is_none());
        // the forward value survives deactivated, stamp intact
        let g = store.get_by_guid(None, group).unwrap().unwrap();
        let v = &g.link_values(member)[0];
        assert!(!v.active);
        assert_eq!(v.stamp.unwrap().version, 2);
    }

    #[test]
    fn duplicate_link_add_is_an_error_and_aborts() {
        let mut schema = TestSchema::new(AttributeId::NAME);
        let member = schema.link(0x100, "member", 0x101, "memberOf");
        let (engine, store) = build(schema);
        let group = ObjectGuid::generate();
        let user = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=G,DC=example"), group, vec![], t(1))
            .unwrap();
        engine
            .create_object(&Dn::new("CN=U,DC=example"), user, vec![], t(1))
            .unwrap();
        let add = AttrChange::LinkAdd {
            attribute: member,
            target: user,
            target_name: "CN=U,DC=example".to_string(),
        };
        engine.modify_object(group, std::slice::from_ref(&add), t(2)).unwrap();
        let before = store.highest_committed_usn();
        let err = engine
            .modify_object(group, std::slice::from_ref(&add), t(3))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLinkValue { .. }));
        // the aborted transaction's sequence numbers were reused, not burned
        assert_eq!(store.highest_committed_usn(), before);
    }

    #[test]
    fn empty_modify_consumes_no_usn() {
        let (engine, store, descr) = engine();
        let guid = ObjectGuid::generate();
        engine
            .create_object(&Dn::new("CN=A,DC=example"), guid, vec![(descr, b"v".to_vec())], t(1))
            .unwrap();
        let before = store.highest_committed_usn();
        engine.modify_object(guid, &[], t(2)).unwrap();
        assert_eq!(store.highest_committed_usn(), before);
        assert!(before > Usn::ZERO);
    }
}
