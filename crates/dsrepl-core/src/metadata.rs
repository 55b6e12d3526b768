//! Per-object metadata vector: the array of attribute version stamps kept on
//! every replicated object, plus the newer-wins merge over it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::is_newer;
use crate::stamp::AttributeStamp;
use crate::types::{AttributeId, ObjectGuid, ReplicaId, Timestamp, Usn};

/// Result of merging a peer's stamp array into the local one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Attributes whose incoming value must be applied to the store.
    pub accepted: Vec<AttributeId>,
    /// Attributes whose incoming value was older and must be dropped from the
    /// write (not applied, not erased from future re-evaluation).
    pub rejected: Vec<AttributeId>,
}

/// The stamp array for one object.
///
/// Unique by attribute id, kept sorted ascending by attribute id with exactly
/// one exception: the object's relative naming attribute is pinned last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    stamps: Vec<AttributeStamp>,
}

impl ObjectMetadata {
    /// Creates an empty metadata vector.
    pub fn new() -> Self {
        ObjectMetadata { stamps: Vec::new() }
    }

    /// Rebuilds a vector from decoded stamps (wire order is preserved).
    pub fn from_stamps(stamps: Vec<AttributeStamp>) -> Self {
        ObjectMetadata { stamps }
    }

    /// The stamps in storage order.
    pub fn stamps(&self) -> &[AttributeStamp] {
        &self.stamps
    }

    /// Number of stamped attributes.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True if no attribute has been stamped yet.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Finds the stamp for `attribute_id`, if any.
    pub fn find(&self, attribute_id: AttributeId) -> Option<&AttributeStamp> {
        self.stamps.iter().find(|s| s.attribute_id == attribute_id)
    }

    /// Highest `local_usn` across all stamps; the object's change watermark.
    pub fn max_local_usn(&self) -> Usn {
        self.stamps
            .iter()
            .map(|s| s.local_usn)
            .max()
            .unwrap_or(Usn::ZERO)
    }

    /// Stamps a local originating write of `attribute_id`.
    ///
    /// Looks up or creates the entry, bumps the version and replaces the
    /// originating fields with (now, replica, usn). The caller must write the
    /// attribute's new value in the same transaction; the USN it passes here
    /// must come from the transaction's deferred allocation so an abort never
    /// exposes it.
    pub fn stamp_local_write(
        &mut self,
        attribute_id: AttributeId,
        replica: ReplicaId,
        now: Timestamp,
        usn: Usn,
    ) -> AttributeStamp {
        match self
            .stamps
            .iter_mut()
            .find(|s| s.attribute_id == attribute_id)
        {
            Some(existing) => {
                existing.bump(replica, now, usn);
                *existing
            }
            None => {
                let stamp = AttributeStamp::originate(attribute_id, replica, now, usn);
                self.stamps.push(stamp);
                stamp
            }
        }
    }

    /// Merges a peer's stamp array into this one, newer-wins per attribute.
    ///
    /// Accepted stamps keep their originating fields verbatim. Once the merge
    /// is decided, every entry's `local_usn` is rewritten to `local_usn` (one
    /// fresh sequence number covers the whole merge, matching the single
    /// store modify it produces). Rejections are logged per attribute unless
    /// the attribute is the structural `instanceType`.
    pub fn merge_remote(
        &mut self,
        object: ObjectGuid,
        incoming: &[AttributeStamp],
        local_usn: Usn,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for inc in incoming {
            match self
                .stamps
                .iter_mut()
                .find(|s| s.attribute_id == inc.attribute_id)
            {
                Some(cur) => {
                    if is_newer(cur, inc) {
                        *cur = *inc;
                        outcome.accepted.push(inc.attribute_id);
                    } else {
                        if inc.attribute_id != AttributeId::INSTANCE_TYPE {
                            debug!(
                                %object,
                                attribute = %inc.attribute_id,
                                from = %inc.originating_replica_id,
                                "discarding older replicated attribute update"
                            );
                        }
                        outcome.rejected.push(inc.attribute_id);
                    }
                }
                None => {
                    self.stamps.push(*inc);
                    outcome.accepted.push(inc.attribute_id);
                }
            }
        }

        for s in &mut self.stamps {
            s.local_usn = local_usn;
        }

        outcome
    }

    /// Re-establishes storage order: ascending attribute id, with the naming
    /// attribute pinned last. Must run after every merge before persisting.
    pub fn sort_for_storage(&mut self, naming_attribute: AttributeId) {
        self.stamps.sort_by(|a, b| {
            let a_naming = a.attribute_id == naming_attribute;
            let b_naming = b.attribute_id == naming_attribute;
            a_naming
                .cmp(&b_naming)
                .then(a.attribute_id.cmp(&b.attribute_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(b: u8) -> ReplicaId {
        ReplicaId::from_bytes([b; 16])
    }

    fn attr(id: u32) -> AttributeId {
        AttributeId::new(id)
    }

    fn remote_stamp(id: u32, version: u32, time: u64, replica: u8, usn: u64) -> AttributeStamp {
        AttributeStamp {
            attribute_id: attr(id),
            version,
            originating_change_time: Timestamp::new(time),
            originating_replica_id: rid(replica),
            originating_usn: Usn::new(usn),
            local_usn: Usn::new(usn),
        }
    }

    #[test]
    fn local_write_creates_then_bumps() {
        let mut md = ObjectMetadata::new();
        let s1 = md.stamp_local_write(attr(5), rid(1), Timestamp::new(10), Usn::new(10));
        assert_eq!(s1.version, 1);
        let s2 = md.stamp_local_write(attr(5), rid(1), Timestamp::new(20), Usn::new(11));
        assert_eq!(s2.version, 2);
        assert_eq!(md.len(), 1);
        assert!(crate::conflict::is_newer(&s1, &s2));
    }

    #[test]
    fn merge_accepts_unknown_attribute() {
        let mut md = ObjectMetadata::new();
        let out = md.merge_remote(
            ObjectGuid::generate(),
            &[remote_stamp(5, 1, 10, 2, 100)],
            Usn::new(7),
        );
        assert_eq!(out.accepted, vec![attr(5)]);
        assert!(out.rejected.is_empty());
        // originating fields preserved, local_usn reassigned
        let s = md.find(attr(5)).unwrap();
        assert_eq!(s.originating_usn, Usn::new(100));
        assert_eq!(s.local_usn, Usn::new(7));
    }

    #[test]
    fn merge_rejects_older_stamp() {
        let mut md = ObjectMetadata::new();
        md.stamp_local_write(attr(5), rid(9), Timestamp::new(50), Usn::new(3));
        md.stamp_local_write(attr(5), rid(9), Timestamp::new(60), Usn::new(4));
        let out = md.merge_remote(
            ObjectGuid::generate(),
            &[remote_stamp(5, 1, 10, 2, 100)],
            Usn::new(8),
        );
        assert_eq!(out.rejected, vec![attr(5)]);
        let s = md.find(attr(5)).unwrap();
        assert_eq!(s.version, 2);
        assert_eq!(s.originating_replica_id, rid(9));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut md = ObjectMetadata::new();
        let guid = ObjectGuid::generate();
        let inc = [remote_stamp(5, 3, 30, 2, 100)];
        md.merge_remote(guid, &inc, Usn::new(7));
        let first = md.clone();
        let out = md.merge_remote(guid, &inc, Usn::new(8));
        assert!(out.accepted.is_empty());
        assert_eq!(out.rejected, vec![attr(5)]);
        let s = md.find(attr(5)).unwrap();
        let f = first.find(attr(5)).unwrap();
        assert_eq!(s.version, f.version);
        assert_eq!(s.originating_usn, f.originating_usn);
        assert_eq!(s.originating_replica_id, f.originating_replica_id);
    }

    #[test]
    fn merge_rewrites_all_local_usns() {
        let mut md = ObjectMetadata::new();
        md.stamp_local_write(attr(1), rid(1), Timestamp::new(10), Usn::new(1));
        md.merge_remote(
            ObjectGuid::generate(),
            &[remote_stamp(2, 1, 10, 2, 50)],
            Usn::new(9),
        );
        for s in md.stamps() {
            assert_eq!(s.local_usn, Usn::new(9));
        }
    }

    #[test]
    fn sort_pins_naming_attribute_last() {
        let mut md = ObjectMetadata::new();
        let naming = attr(3);
        md.stamp_local_write(attr(9), rid(1), Timestamp::new(1), Usn::new(1));
        md.stamp_local_write(naming, rid(1), Timestamp::new(1), Usn::new(1));
        md.stamp_local_write(attr(1), rid(1), Timestamp::new(1), Usn::new(1));
        md.sort_for_storage(naming);
        let order: Vec<u32> = md.stamps().iter().map(|s| s.attribute_id.as_u32()).collect();
        assert_eq!(order, vec![1, 9, 3]);
    }

    #[test]
    fn max_local_usn_tracks_highest() {
        let mut md = ObjectMetadata::new();
        assert_eq!(md.max_local_usn(), Usn::ZERO);
        md.stamp_local_write(attr(1), rid(1), Timestamp::new(1), Usn::new(4));
        md.stamp_local_write(attr(2), rid(1), Timestamp::new(1), Usn::new(6));
        assert_eq!(md.max_local_usn(), Usn::new(6));
    }

    #[test]
    fn instance_type_rejection_is_silent_but_counted() {
        let mut md = ObjectMetadata::new();
        md.stamp_local_write(
            AttributeId::INSTANCE_TYPE,
            rid(9),
            Timestamp::new(99),
            Usn::new(5),
        );
        let mut older = remote_stamp(0, 1, 1, 1, 1);
        older.attribute_id = AttributeId::INSTANCE_TYPE;
        let out = md.merge_remote(ObjectGuid::generate(), &[older], Usn::new(6));
        assert_eq!(out.rejected, vec![AttributeId::INSTANCE_TYPE]);
    }
}
