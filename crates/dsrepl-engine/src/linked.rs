//! Linked-attribute values and the engine that maintains them.
//!
//! Forward links carry their own embedded stamp and are never physically
//! removed by a delete: they are deactivated in place so the stamp survives
//! for future tie-breaks. Every mutation enqueues an equivalent backlink job
//! on the owning transaction, drained once at commit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use dsrepl_core::conflict::update_is_newer;
use dsrepl_core::{AttributeId, ObjectGuid, ReplicaId, Timestamp, Usn};

use crate::backlink::BacklinkJob;
use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::store::StoredObject;
use crate::txn::ReplTxn;

/// The embedded version stamp of one link value. Absent on values written by
/// legacy peers; synthesized lazily the first time the value is touched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStamp {
    /// Monotonically increasing per-value version.
    pub version: u32,
    /// Wall-clock time of the originating change.
    pub change_time: Timestamp,
    /// Replica that performed the originating change.
    pub originating_replica_id: ReplicaId,
    /// Sequence number the originating replica assigned.
    pub originating_usn: Usn,
    /// Sequence number this replica assigned when the value landed locally.
    pub local_usn: Usn,
}

/// One value of a forward-link attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkValue {
    /// The target object's GUID. May be the all-zero sentinel on values from
    /// legacy peers, in which case `target_name` identifies the target.
    pub target: ObjectGuid,
    /// The target's name as last known; used for the legacy fallback.
    pub target_name: String,
    /// False means logically deleted, retained for tie-breaking.
    pub active: bool,
    /// When the value was first added.
    pub add_time: Timestamp,
    /// The embedded stamp; `None` only for legacy values not yet upgraded.
    pub stamp: Option<LinkStamp>,
}

impl LinkValue {
    /// Builds a freshly originated active value.
    pub fn originate(
        target: ObjectGuid,
        target_name: String,
        replica: ReplicaId,
        now: Timestamp,
        usn: Usn,
    ) -> Self {
        LinkValue {
            target,
            target_name,
            active: true,
            add_time: now,
            stamp: Some(LinkStamp {
                version: 1,
                change_time: now,
                originating_replica_id: replica,
                originating_usn: usn,
                local_usn: usn,
            }),
        }
    }

    /// Synthesizes a stamp for a legacy value. The version/time are those of
    /// the upgrade, not of the original creation; a known approximation kept
    /// for wire compatibility with older peers.
    pub fn upgrade(&mut self, replica: ReplicaId, now: Timestamp, usn: Usn) {
        if self.stamp.is_none() {
            self.stamp = Some(LinkStamp {
                version: 1,
                change_time: now,
                originating_replica_id: replica,
                originating_usn: usn,
                local_usn: usn,
            });
        }
    }

    fn restamp(&mut self, active: bool, replica: ReplicaId, now: Timestamp, usn: Usn) {
        let version = self.stamp.map(|s| s.version + 1).unwrap_or(1);
        self.active = active;
        self.stamp = Some(LinkStamp {
            version,
            change_time: now,
            originating_replica_id: replica,
            originating_usn: usn,
            local_usn: usn,
        });
    }
}

/// Outcome of applying one replicated link value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkApplyStatus {
    /// The incoming value won and was stored.
    Applied,
    /// The incoming value was older and dropped.
    Rejected,
}

fn find_value_mut<'a>(
    values: &'a mut [LinkValue],
    target: ObjectGuid,
    target_name: &str,
) -> Option<&'a mut LinkValue> {
    if target.is_nil() {
        // legacy compatibility path: no target GUID on the wire
        values.iter_mut().find(|v| v.target_name == target_name)
    } else {
        values.iter_mut().find(|v| v.target == target)
    }
}

impl ReplEngine {
    /// Upgrades every legacy value of `attribute` in place. Runs before any
    /// comparison logic touches the value list.
    pub(crate) fn upgrade_links(
        &self,
        obj: &mut StoredObject,
        attribute: AttributeId,
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) {
        let Some(values) = obj.links.get_mut(&attribute) else {
            return;
        };
        if values.iter().all(|v| v.stamp.is_some()) {
            return;
        }
        let usn = txn.txn_usn();
        for v in values.iter_mut() {
            v.upgrade(self.replica_id(), now, usn);
        }
    }

    /// Adds a forward-link value as a local originating write.
    ///
    /// If an inactive value for the same target exists it is reactivated
    /// (version bumped) rather than duplicated; a duplicate active value is
    /// an error.
    pub(crate) fn local_link_add(
        &self,
        obj: &mut StoredObject,
        attribute: AttributeId,
        target: ObjectGuid,
        target_name: &str,
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) -> Result<(), EngineError> {
        self.upgrade_links(obj, attribute, now, txn);
        let usn = txn.txn_usn();
        let replica = self.replica_id();
        let values = obj.links.entry(attribute).or_default();

        match find_value_mut(values, target, target_name) {
            Some(existing) if existing.active => {
                return Err(EngineError::DuplicateLinkValue { attribute, target });
            }
            Some(existing) => {
                existing.restamp(true, replica, now, usn);
                existing.target_name = target_name.to_string();
            }
            None => {
                values.push(LinkValue::originate(
                    target,
                    target_name.to_string(),
                    replica,
                    now,
                    usn,
                ));
            }
        }

        txn.enqueue_backlink(BacklinkJob::new(obj.guid, target, attribute, true));
        Ok(())
    }

    /// Deactivates a forward-link value as a local originating write. The
    /// value and its stamp stay behind for future tie-breaks.
    pub(crate) fn local_link_delete(
        &self,
        obj: &mut StoredObject,
        attribute: AttributeId,
        target: ObjectGuid,
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) -> Result<(), EngineError> {
        self.upgrade_links(obj, attribute, now, txn);
        let usn = txn.txn_usn();
        let replica = self.replica_id();
        let values = obj.links.entry(attribute).or_default();

        match find_value_mut(values, target, "") {
            Some(existing) if existing.active => {
                existing.restamp(false, replica, now, usn);
            }
            _ => return Err(EngineError::NoSuchLinkValue { attribute, target }),
        }

        txn.enqueue_backlink(BacklinkJob::new(obj.guid, target, attribute, false));
        Ok(())
    }

    /// Replaces the active value set of a forward-link attribute: values not
    /// in the new set are deactivated, new values are added, both through the
    /// add/delete primitives above.
    pub(crate) fn local_link_replace(
        &self,
        obj: &mut StoredObject,
        attribute: AttributeId,
        targets: &[(ObjectGuid, String)],
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) -> Result<(), EngineError> {
        self.upgrade_links(obj, attribute, now, txn);

        let existing_active: Vec<ObjectGuid> = obj
            .link_values(attribute)
            .iter()
            .filter(|v| v.active)
            .map(|v| v.target)
            .collect();

        for gone in existing_active
            .iter()
            .filter(|t| !targets.iter().any(|(g, _)| g == *t))
        {
            self.local_link_delete(obj, attribute, *gone, now, txn)?;
        }

        for (target, name) in targets
            .iter()
            .filter(|(g, _)| !existing_active.contains(g))
        {
            self.local_link_add(obj, attribute, *target, name, now, txn)?;
        }

        Ok(())
    }

    /// Applies one replicated link value to its source object, resolving the
    /// existing value by target GUID (by name when the GUID is the legacy
    /// all-zero sentinel) and deciding with the shared conflict comparator.
    pub(crate) fn apply_remote_link(
        &self,
        obj: &mut StoredObject,
        attribute: AttributeId,
        incoming: &crate::apply::ReplicatedLink,
        now: Timestamp,
        txn: &mut ReplTxn<'_>,
    ) -> Result<LinkApplyStatus, EngineError> {
        self.upgrade_links(obj, attribute, now, txn);
        let values = obj.links.entry(attribute).or_default();

        match find_value_mut(values, incoming.target, &incoming.target_name) {
            Some(existing) => {
                // upgrade_links ran above, the stamp is always present here
                let Some(cur) = existing.stamp else {
                    return Ok(LinkApplyStatus::Rejected);
                };
                if !update_is_newer(
                    cur.version,
                    incoming.version,
                    cur.change_time,
                    incoming.change_time,
                    cur.originating_replica_id,
                    incoming.originating_replica_id,
                ) {
                    debug!(
                        object = %obj.guid,
                        attribute = %attribute,
                        from = %incoming.originating_replica_id,
                        "discarding older replicated linked-attribute update"
                    );
                    return Ok(LinkApplyStatus::Rejected);
                }

                let usn = txn.alloc_usn();
                let was_active = existing.active;
                existing.active = incoming.active;
                if !incoming.target.is_nil() {
                    existing.target = incoming.target;
                }
                existing.target_name = incoming.target_name.clone();
                existing.stamp = Some(LinkStamp {
                    version: incoming.version,
                    change_time: incoming.change_time,
                    originating_replica_id: incoming.originating_replica_id,
                    originating_usn: incoming.originating_usn,
                    local_usn: usn,
                });
                let target = existing.target;

                if was_active && !incoming.active {
                    txn.enqueue_backlink(BacklinkJob::new(obj.guid, target, attribute, false));
                } else if incoming.active {
                    txn.enqueue_backlink(BacklinkJob::new(obj.guid, target, attribute, true));
                }
            }
            None => {
                let usn = txn.alloc_usn();
                values.push(LinkValue {
                    target: incoming.target,
                    target_name: incoming.target_name.clone(),
                    active: incoming.active,
                    add_time: incoming.add_time,
                    stamp: Some(LinkStamp {
                        version: incoming.version,
                        change_time: incoming.change_time,
                        originating_replica_id: incoming.originating_replica_id,
                        originating_usn: incoming.originating_usn,
                        local_usn: usn,
                    }),
                });
                if incoming.active {
                    txn.enqueue_backlink(BacklinkJob::new(
                        obj.guid,
                        incoming.target,
                        attribute,
                        true,
                    ));
                }
            }
        }

        Ok(LinkApplyStatus::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(target: ObjectGuid, active: bool, version: u32) -> LinkValue {
        LinkValue {
            target,
            target_name: "CN=T".to_string(),
            active,
            add_time: Timestamp::new(1),
            stamp: Some(LinkStamp {
                version,
                change_time: Timestamp::new(1),
                originating_replica_id: ReplicaId::from_bytes([1; 16]),
                originating_usn: Usn::new(1),
                local_usn: Usn::new(1),
            }),
        }
    }

    #[test]
    fn upgrade_fills_missing_stamp_only() {
        let mut v = value(ObjectGuid::generate(), true, 5);
        let original = v.stamp;
        v.upgrade(ReplicaId::from_bytes([9; 16]), Timestamp::new(99), Usn::new(9));
        assert_eq!(v.stamp, original);

        let mut legacy = LinkValue {
            stamp: None,
            ..v.clone()
        };
        legacy.upgrade(ReplicaId::from_bytes([9; 16]), Timestamp::new(99), Usn::new(9));
        let s = legacy.stamp.unwrap();
        assert_eq!(s.version, 1);
        assert_eq!(s.change_time, Timestamp::new(99));
    }

    #[test]
    fn restamp_bumps_version() {
        let mut v = value(ObjectGuid::generate(), true, 5);
        v.restamp(false, ReplicaId::from_bytes([2; 16]), Timestamp::new(7), Usn::new(3));
        assert!(!v.active);
        let s = v.stamp.unwrap();
        assert_eq!(s.version, 6);
        assert_eq!(s.local_usn, Usn::new(3));
    }

    #[test]
    fn find_by_name_when_guid_is_nil() {
        let t = ObjectGuid::generate();
        let mut values = vec![value(t, true, 1)];
        assert!(find_value_mut(&mut values, ObjectGuid::NIL, "CN=T").is_some());
        assert!(find_value_mut(&mut values, ObjectGuid::NIL, "CN=Other").is_none());
        assert!(find_value_mut(&mut values, t, "ignored").is_some());
    }
}
