//! Attribute version stamps: the per-attribute vector-clock entry that every
//! replicated write carries.

use serde::{Deserialize, Serialize};

use crate::types::{AttributeId, ReplicaId, Timestamp, Usn};

/// Version stamp attached to one replicated attribute of one object.
///
/// `originating_*` fields identify where and when the value was last
/// authoritatively set anywhere in the replicated set; `local_usn` is the
/// logical time the value last landed on this replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeStamp {
    /// The attribute this stamp covers.
    pub attribute_id: AttributeId,
    /// Monotonically increasing per-attribute version.
    pub version: u32,
    /// Wall-clock time of the originating write.
    pub originating_change_time: Timestamp,
    /// Replica that performed the originating write.
    pub originating_replica_id: ReplicaId,
    /// Sequence number the originating replica assigned.
    pub originating_usn: Usn,
    /// Sequence number this replica assigned when the value landed locally.
    pub local_usn: Usn,
}

impl AttributeStamp {
    /// Builds the stamp for a brand-new originating write of `attribute_id`.
    pub fn originate(
        attribute_id: AttributeId,
        replica: ReplicaId,
        now: Timestamp,
        usn: Usn,
    ) -> Self {
        AttributeStamp {
            attribute_id,
            version: 1,
            originating_change_time: now,
            originating_replica_id: replica,
            originating_usn: usn,
            local_usn: usn,
        }
    }

    /// Re-stamps this entry for a fresh originating write on `replica`:
    /// version bumped, all originating fields replaced.
    pub fn bump(&mut self, replica: ReplicaId, now: Timestamp, usn: Usn) {
        self.version += 1;
        self.originating_change_time = now;
        self.originating_replica_id = replica;
        self.originating_usn = usn;
        self.local_usn = usn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(id: u32) -> AttributeId {
        AttributeId::new(id)
    }

    #[test]
    fn originate_starts_at_version_one() {
        let r = ReplicaId::generate();
        let s = AttributeStamp::originate(attr(7), r, Timestamp::new(100), Usn::new(5));
        assert_eq!(s.version, 1);
        assert_eq!(s.originating_usn, Usn::new(5));
        assert_eq!(s.local_usn, Usn::new(5));
        assert_eq!(s.originating_replica_id, r);
    }

    #[test]
    fn bump_replaces_originating_fields() {
        let a = ReplicaId::generate();
        let b = ReplicaId::generate();
        let mut s = AttributeStamp::originate(attr(7), a, Timestamp::new(100), Usn::new(5));
        s.bump(b, Timestamp::new(200), Usn::new(9));
        assert_eq!(s.version, 2);
        assert_eq!(s.originating_replica_id, b);
        assert_eq!(s.originating_change_time, Timestamp::new(200));
        assert_eq!(s.originating_usn, Usn::new(9));
        assert_eq!(s.local_usn, Usn::new(9));
    }
}
