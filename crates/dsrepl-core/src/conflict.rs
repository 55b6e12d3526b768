//! The shared conflict comparator.
//!
//! Plain-attribute merge and linked-attribute merge both resolve conflicts
//! through [`is_newer`]. There is exactly one comparator: a divergence between
//! the two paths would silently split the replicated set.

use crate::stamp::AttributeStamp;
use crate::types::{ReplicaId, Timestamp};

/// Returns true if `candidate` supersedes `current`.
///
/// Priority order: higher version wins; on equal versions the later
/// originating change time wins; on equal times the higher replica id (byte
/// order) wins. Total over distinct stamps: two stamps that differ anywhere
/// in (version, time, replica) order one way or the other, never both.
pub fn is_newer(current: &AttributeStamp, candidate: &AttributeStamp) -> bool {
    update_is_newer(
        current.version,
        candidate.version,
        current.originating_change_time,
        candidate.originating_change_time,
        current.originating_replica_id,
        candidate.originating_replica_id,
    )
}

/// Field-level form of [`is_newer`], for callers holding an embedded linked
/// value stamp rather than an [`AttributeStamp`].
pub fn update_is_newer(
    current_version: u32,
    candidate_version: u32,
    current_time: Timestamp,
    candidate_time: Timestamp,
    current_replica: ReplicaId,
    candidate_replica: ReplicaId,
) -> bool {
    if candidate_version != current_version {
        return candidate_version > current_version;
    }
    if candidate_time != current_time {
        return candidate_time > current_time;
    }
    candidate_replica > current_replica
}
