//! Outbound change enumeration.
//!
//! A resumable cursor over one partition: objects changed past the caller's
//! watermark are selected once, then drained in bounded batches with a fresh
//! re-read per object. Linked attributes are collected into one globally
//! sorted list and paginated on their own offset after the objects. The
//! final batch carries the vector the peer should adopt.

use std::collections::BTreeSet;

use tracing::debug;

use dsrepl_core::{
    AttributeId, AttributeStamp, Cursor, ObjectGuid, ReplicaId, Timestamp, UpToDateVector, Usn,
};

use crate::apply::{ReplicatedLink, ReplicatedObject};
use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::extended::{ExtendedOp, ExtendedReply};
use crate::store::{DirectoryStore, PartitionId, StoredObject};

/// Parameters of one enumeration session.
#[derive(Clone, Debug)]
pub struct EnumerationRequest {
    /// Partition to enumerate.
    pub partition: PartitionId,
    /// The requesting peer's identity.
    pub peer: ReplicaId,
    /// Client-asserted watermark: only changes past it are sent.
    pub watermark: Usn,
    /// The peer's up-to-dateness vector, used to suppress known changes.
    pub peer_udv: UpToDateVector,
    /// Objects per batch.
    pub max_objects: usize,
    /// Linked-attribute values per batch.
    pub max_links: usize,
    /// Order parents before children instead of by sequence number.
    pub ancestor_order: bool,
    /// Optional explicit attribute allow-list.
    pub attribute_allowlist: Option<BTreeSet<AttributeId>>,
    /// Attributes sent even when the peer's vector claims knowledge of them
    /// (the secret-replication exception).
    pub forced_attributes: BTreeSet<AttributeId>,
    /// One-shot operation carried instead of an enumeration.
    pub extended_op: Option<ExtendedOp>,
    /// Whether the transport authenticated the caller as privileged.
    pub privileged: bool,
}

impl EnumerationRequest {
    /// An unbounded request with no filtering extras.
    pub fn new(
        partition: PartitionId,
        peer: ReplicaId,
        watermark: Usn,
        peer_udv: UpToDateVector,
    ) -> Self {
        EnumerationRequest {
            partition,
            peer,
            watermark,
            peer_udv,
            max_objects: usize::MAX,
            max_links: usize::MAX,
            ancestor_order: false,
            attribute_allowlist: None,
            forced_attributes: BTreeSet::new(),
            extended_op: None,
            privileged: false,
        }
    }
}

/// Progress of a session, private to it. Holding it across batches is the
/// caller's job; abandoning it between batches needs no cleanup.
#[derive(Clone, Debug, Default)]
pub struct EnumerationCursor {
    selected: Vec<ObjectGuid>,
    object_index: usize,
    links: Vec<ReplicatedLink>,
    link_index: usize,
    high_usn: Usn,
}

/// One batch of enumeration output.
#[derive(Clone, Debug)]
pub struct EnumerationResponse {
    /// Object snapshots with their stamp subsets.
    pub objects: Vec<ReplicatedObject>,
    /// Linked-attribute values, only once objects are exhausted.
    pub links: Vec<ReplicatedLink>,
    /// Session progress to pass back on the next call.
    pub cursor: EnumerationCursor,
    /// The watermark the peer should assert next time.
    pub new_watermark: Usn,
    /// Vector for the peer to merge; present only on the final batch.
    pub new_udv: Option<UpToDateVector>,
    /// True while more batches remain.
    pub more_data: bool,
    /// Reply to an extended operation, when one was carried.
    pub extended: Option<ExtendedReply>,
}

fn link_stamp(attr: AttributeId, v: &crate::linked::LinkValue) -> Option<AttributeStamp> {
    let st = v.stamp?;
    Some(AttributeStamp {
        attribute_id: attr,
        version: st.version,
        originating_change_time: st.change_time,
        originating_replica_id: st.originating_replica_id,
        originating_usn: st.originating_usn,
        local_usn: st.local_usn,
    })
}

impl ReplEngine {
    /// Starts or continues an enumeration session.
    ///
    /// Pass `None` for a fresh session; pass the cursor from the previous
    /// response to continue. An extended operation in the request
    /// short-circuits enumeration entirely.
    pub fn begin_or_resume_enumeration(
        &self,
        request: &EnumerationRequest,
        cursor: Option<EnumerationCursor>,
        now: Timestamp,
    ) -> Result<EnumerationResponse, EngineError> {
        if let Some(op) = request.extended_op {
            let reply = self.extended_operation(request.partition, op, request.privileged, now)?;
            return Ok(EnumerationResponse {
                objects: Vec::new(),
                links: Vec::new(),
                cursor: EnumerationCursor::default(),
                new_watermark: request.watermark,
                new_udv: None,
                more_data: false,
                extended: Some(reply),
            });
        }

        let mut cursor = match cursor {
            Some(c) => c,
            None => self.build_cursor(request)?,
        };

        let mut objects = Vec::new();
        while objects.len() < request.max_objects && cursor.object_index < cursor.selected.len() {
            let guid = cursor.selected[cursor.object_index];
            cursor.object_index += 1;
            // fresh re-read per object to bound memory
            let Some(obj) = self.store().get_by_guid(None, guid)? else {
                continue;
            };
            if let Some(snapshot) = self.snapshot_for_peer(request, &obj) {
                objects.push(snapshot);
            } else {
                debug!(object = %guid, "peer already holds every sendable attribute, skipping");
            }
        }

        let mut links = Vec::new();
        if cursor.object_index == cursor.selected.len() {
            while links.len() < request.max_links && cursor.link_index < cursor.links.len() {
                links.push(cursor.links[cursor.link_index].clone());
                cursor.link_index += 1;
            }
        }

        let done = cursor.object_index == cursor.selected.len()
            && cursor.link_index == cursor.links.len();
        let new_udv = if done {
            Some(self.udv_for_peer(request.partition, cursor.high_usn, now)?)
        } else {
            None
        };

        Ok(EnumerationResponse {
            objects,
            links,
            new_watermark: cursor.high_usn,
            new_udv,
            more_data: !done,
            extended: None,
            cursor,
        })
    }

    /// Selects the enumeration set: objects whose metadata or link stamps
    /// moved past the watermark, ordered as requested, plus the globally
    /// sorted linked-attribute list for the whole watermark range.
    fn build_cursor(&self, request: &EnumerationRequest) -> Result<EnumerationCursor, EngineError> {
        let high_usn = self.store().highest_committed_usn();
        let mut selected: Vec<(ObjectGuid, usize, String, Usn)> = Vec::new();
        let mut links: Vec<ReplicatedLink> = Vec::new();

        for guid in self.store().objects_in_partition(request.partition)? {
            let Some(obj) = self.store().get_by_guid(None, guid)? else {
                continue;
            };
            let link_high = obj
                .links
                .values()
                .flatten()
                .filter_map(|v| v.stamp.map(|s| s.local_usn))
                .max()
                .unwrap_or(Usn::ZERO);
            if obj.metadata.max_local_usn() <= request.watermark && link_high <= request.watermark
            {
                continue;
            }
            selected.push((
                guid,
                obj.dn.depth(),
                obj.dn.as_str().to_string(),
                obj.metadata.max_local_usn(),
            ));

            for (attr, values) in &obj.links {
                for v in values {
                    let Some(stamp) = link_stamp(*attr, v) else {
                        continue;
                    };
                    if stamp.local_usn <= request.watermark {
                        continue;
                    }
                    if request.peer_udv.filter(&stamp) {
                        continue;
                    }
                    links.push(ReplicatedLink {
                        source: obj.guid,
                        attribute: *attr,
                        target: v.target,
                        target_name: v.target_name.clone(),
                        active: v.active,
                        add_time: v.add_time,
                        version: stamp.version,
                        change_time: stamp.originating_change_time,
                        originating_replica_id: stamp.originating_replica_id,
                        originating_usn: stamp.originating_usn,
                    });
                }
            }
        }

        if request.ancestor_order {
            // parents are strictly shallower than children
            selected.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
        } else {
            selected.sort_by_key(|s| s.3);
        }
        links.sort_by(|a, b| {
            (a.source, a.attribute, a.active, a.target).cmp(&(
                b.source,
                b.attribute,
                b.active,
                b.target,
            ))
        });

        Ok(EnumerationCursor {
            selected: selected.into_iter().map(|s| s.0).collect(),
            object_index: 0,
            links,
            link_index: 0,
            high_usn,
        })
    }

    /// Computes the attribute subset to send for one object, or `None` when
    /// the peer already knows everything non-structural.
    fn snapshot_for_peer(
        &self,
        request: &EnumerationRequest,
        obj: &StoredObject,
    ) -> Option<ReplicatedObject> {
        let stamps: Vec<AttributeStamp> = obj
            .metadata
            .stamps()
            .iter()
            .filter(|s| {
                s.attribute_id == AttributeId::INSTANCE_TYPE
                    || s.local_usn > request.watermark
            })
            .filter(|s| {
                request.forced_attributes.contains(&s.attribute_id)
                    || !request.peer_udv.filter(s)
            })
            .filter(|s| {
                request
                    .attribute_allowlist
                    .as_ref()
                    .map(|set| set.contains(&s.attribute_id))
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        if stamps
            .iter()
            .all(|s| s.attribute_id == AttributeId::INSTANCE_TYPE)
        {
            return None;
        }

        let values = stamps
            .iter()
            .map(|s| (s.attribute_id, obj.attributes.get(&s.attribute_id).cloned()))
            .collect();
        Some(ReplicatedObject {
            guid: obj.guid,
            dn: obj.dn.clone(),
            sid: obj.sid.clone(),
            metadata: dsrepl_core::wire::encode_stamp_array(&stamps),
            values,
        })
    }

    /// The vector handed to the peer on completion: our partition vector
    /// with our own cursor raised to this cycle's high watermark.
    fn udv_for_peer(
        &self,
        partition: PartitionId,
        high_usn: Usn,
        now: Timestamp,
    ) -> Result<UpToDateVector, EngineError> {
        let udv = self.partition_udv(partition)?;
        let mut cursors = udv.cursors().to_vec();
        match cursors
            .iter_mut()
            .find(|c| c.replica_id == self.replica_id())
        {
            Some(c) => {
                if high_usn > c.highest_usn {
                    c.highest_usn = high_usn;
                }
                c.last_sync_success = now;
            }
            None => cursors.push(Cursor {
                replica_id: self.replica_id(),
                highest_usn: high_usn,
                last_sync_success: now,
            }),
        }
        Ok(UpToDateVector::from_cursors(cursors))
    }
}
