//! The per-partition up-to-dateness vector.
//!
//! One cursor per originating replica: the highest sequence number already
//! known from it, and when we last synchronized with it directly. Used to
//! filter outbound changes and merged at the end of every inbound cycle.

use serde::{Deserialize, Serialize};

use crate::stamp::AttributeStamp;
use crate::types::{ReplicaId, Timestamp, Usn};

/// One entry of the up-to-dateness vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// The originating replica this cursor covers.
    pub replica_id: ReplicaId,
    /// Highest originating USN already known from that replica.
    pub highest_usn: Usn,
    /// Last successful direct synchronization with that replica. Not updated
    /// for knowledge learned transitively.
    pub last_sync_success: Timestamp,
}

/// Up-to-dateness vector for one replicated partition.
///
/// Kept sorted by replica id for stable wire encoding and binary-search
/// lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpToDateVector {
    cursors: Vec<Cursor>,
}

impl UpToDateVector {
    /// Creates an empty vector.
    pub fn new() -> Self {
        UpToDateVector {
            cursors: Vec::new(),
        }
    }

    /// Rebuilds a vector from decoded cursors, restoring sort order.
    pub fn from_cursors(mut cursors: Vec<Cursor>) -> Self {
        cursors.sort_by_key(|c| c.replica_id);
        UpToDateVector { cursors }
    }

    /// The cursors in replica-id order.
    pub fn cursors(&self) -> &[Cursor] {
        &self.cursors
    }

    /// Looks up the cursor for `replica_id`.
    pub fn find(&self, replica_id: ReplicaId) -> Option<&Cursor> {
        self.cursors
            .binary_search_by_key(&replica_id, |c| c.replica_id)
            .ok()
            .map(|i| &self.cursors[i])
    }

    /// True if the holder of this vector already knows the change behind
    /// `stamp`, i.e. sending or re-applying it would be redundant.
    pub fn filter(&self, stamp: &AttributeStamp) -> bool {
        match self.find(stamp.originating_replica_id) {
            Some(cursor) => cursor.highest_usn >= stamp.originating_usn,
            None => false,
        }
    }

    /// Inserts or updates the cursor for `replica_id`, keeping the maximum
    /// `highest_usn`. `last_sync_success` is only touched when `direct` is
    /// set: transitive knowledge says nothing about direct contact.
    fn upsert_max(&mut self, replica_id: ReplicaId, usn: Usn, direct: Option<Timestamp>) {
        match self
            .cursors
            .binary_search_by_key(&replica_id, |c| c.replica_id)
        {
            Ok(i) => {
                let c = &mut self.cursors[i];
                if usn > c.highest_usn {
                    c.highest_usn = usn;
                }
                if let Some(now) = direct {
                    c.highest_usn = usn;
                    c.last_sync_success = now;
                }
            }
            Err(i) => {
                self.cursors.insert(
                    i,
                    Cursor {
                        replica_id,
                        highest_usn: usn,
                        last_sync_success: direct.unwrap_or_default(),
                    },
                );
            }
        }
    }

    /// Merges knowledge gained from a completed replication cycle.
    ///
    /// Unions `peer_vector` into this one keeping the maximum `highest_usn`
    /// per replica id (entries for our own id are skipped), then upserts the
    /// direct peer's cursor with `peer_contact_usn`, the sequence number just
    /// synchronized, and `last_sync_success = now`.
    pub fn merge(
        &mut self,
        our_id: ReplicaId,
        peer_vector: &UpToDateVector,
        peer_identity: ReplicaId,
        peer_contact_usn: Usn,
        now: Timestamp,
    ) {
        for c in &peer_vector.cursors {
            if c.replica_id == our_id {
                continue;
            }
            self.upsert_max(c.replica_id, c.highest_usn, None);
        }
        self.upsert_max(peer_identity, peer_contact_usn, Some(now));
    }
}
