//! Inbound application of a peer's replicated batch.
//!
//! Objects arrive as snapshots with their stamp arrays; each is merged
//! through the shared comparator, surviving values are written, linked
//! attributes are fed to the linked-attribute engine, and the cycle finishes
//! by folding the peer's knowledge into the partition's up-to-dateness
//! vector. Decode failures are fatal to the single object they concern, never
//! to the batch.

use tracing::{debug, warn};

use dsrepl_core::{
    is_newer, wire, AttributeId, AttributeStamp, CoreError, ObjectGuid, ReplicaId, Timestamp,
    UpToDateVector, Usn,
};

use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::linked::LinkApplyStatus;
use crate::repsfrom::RepsFrom;
use crate::store::{DeletionState, Dn, PartitionId, StoredObject};
use crate::txn::ReplTxn;

/// One object snapshot as received from a peer.
#[derive(Clone, Debug)]
pub struct ReplicatedObject {
    /// The object's identity.
    pub guid: ObjectGuid,
    /// The object's name on the sending replica.
    pub dn: Dn,
    /// Optional security identifier.
    pub sid: Option<Vec<u8>>,
    /// Serialized attribute stamp array.
    pub metadata: Vec<u8>,
    /// Attribute values paired with the stamps; `None` means the attribute
    /// was removed at the origin.
    pub values: Vec<(AttributeId, Option<Vec<u8>>)>,
}

/// One linked-attribute value as received from a peer.
#[derive(Clone, Debug)]
pub struct ReplicatedLink {
    /// Object owning the forward link.
    pub source: ObjectGuid,
    /// The forward-link attribute.
    pub attribute: AttributeId,
    /// Link target; the all-zero sentinel on values from legacy peers.
    pub target: ObjectGuid,
    /// Target name, used for legacy resolution.
    pub target_name: String,
    /// False means logically deleted.
    pub active: bool,
    /// When the value was first added.
    pub add_time: Timestamp,
    /// Embedded stamp fields.
    pub version: u32,
    /// Originating change time.
    pub change_time: Timestamp,
    /// Originating replica.
    pub originating_replica_id: ReplicaId,
    /// Originating sequence number.
    pub originating_usn: Usn,
}

impl ReplicatedLink {
    /// Serializes the value in its fixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        wire::encode_link_value(&wire::LinkValueRecord {
            source: self.source,
            attribute_id: self.attribute,
            target: self.target,
            target_name: self.target_name.clone(),
            active: self.active,
            add_time: self.add_time,
            version: self.version,
            change_time: self.change_time,
            originating_replica_id: self.originating_replica_id,
            originating_usn: self.originating_usn,
            // the receiver reassigns its own local watermark on apply
            local_usn: self.originating_usn,
        })
    }

    /// Deserializes a value from its wire form.
    pub fn decode(blob: &[u8]) -> Result<Self, EngineError> {
        let rec = wire::decode_link_value(blob)?;
        Ok(ReplicatedLink {
            source: rec.source,
            attribute: rec.attribute_id,
            target: rec.target,
            target_name: rec.target_name,
            active: rec.active,
            add_time: rec.add_time,
            version: rec.version,
            change_time: rec.change_time,
            originating_replica_id: rec.originating_replica_id,
            originating_usn: rec.originating_usn,
        })
    }
}

/// What one [`apply_replicated_batch`](ReplEngine::apply_replicated_batch)
/// call did.
#[derive(Debug, Default, Clone)]
pub struct ApplyReport {
    /// Objects whose merge changed local state.
    pub objects_applied: usize,
    /// Objects already fully known (suppressed by the vector or all-rejected).
    pub objects_skipped: usize,
    /// Link values accepted.
    pub links_applied: usize,
    /// Link values dropped as older or unresolvable.
    pub links_rejected: usize,
    /// Per-object protocol failures; the rest of the batch still applied.
    pub failures: Vec<(ObjectGuid, String)>,
}

fn conflict_rdn(dn: &Dn, guid: ObjectGuid) -> String {
    let rdn = dn.rdn();
    let attr_type = rdn.split_once('=').map(|(t, _)| t).unwrap_or("CN");
    format!("{}={}\nCNF:{}", attr_type, dn.rdn_value(), guid)
}

fn link_stamp_for_filter(link: &ReplicatedLink) -> AttributeStamp {
    AttributeStamp {
        attribute_id: link.attribute,
        version: link.version,
        originating_change_time: link.change_time,
        originating_replica_id: link.originating_replica_id,
        originating_usn: link.originating_usn,
        local_usn: link.originating_usn,
    }
}

impl ReplEngine {
    /// Applies one replicated batch from `peer` against `partition`.
    ///
    /// Commits atomically; any error other than a per-object protocol failure
    /// aborts the whole batch. On success the partition's up-to-dateness
    /// vector has absorbed `peer_udv` and the peer's reps-from record has
    /// been replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_replicated_batch(
        &self,
        partition: PartitionId,
        peer: ReplicaId,
        objects: &[ReplicatedObject],
        links: &[ReplicatedLink],
        peer_udv: &UpToDateVector,
        peer_high_usn: Usn,
        now: Timestamp,
    ) -> Result<ApplyReport, EngineError> {
        let mut txn = self.begin();
        let result = self.apply_in_txn(
            &mut txn,
            partition,
            peer,
            objects,
            links,
            peer_udv,
            peer_high_usn,
            now,
        );
        match result {
            Ok(report) => {
                txn.commit(self.schema())?;
                Ok(report)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_in_txn(
        &self,
        txn: &mut ReplTxn<'_>,
        partition: PartitionId,
        peer: ReplicaId,
        objects: &[ReplicatedObject],
        links: &[ReplicatedLink],
        peer_udv: &UpToDateVector,
        peer_high_usn: Usn,
        now: Timestamp,
    ) -> Result<ApplyReport, EngineError> {
        let root = txn
            .get(partition.0)?
            .ok_or(EngineError::ObjectNotFound(partition.0))?;
        let local_udv = Self::decode_udv(&root)?;

        let mut report = ApplyReport::default();

        for incoming in objects {
            txn.next_operation();
            match self.apply_object(txn, &local_udv, incoming, peer, peer_high_usn, now) {
                Ok(true) => report.objects_applied += 1,
                Ok(false) => report.objects_skipped += 1,
                Err(EngineError::Core(e)) => {
                    warn!(object = %incoming.guid, error = %e, "dropping replicated object that failed a protocol check");
                    report.failures.push((incoming.guid, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        for link in links {
            txn.next_operation();
            if local_udv.filter(&link_stamp_for_filter(link)) {
                report.links_rejected += 1;
                continue;
            }
            let Some(mut source) = txn.get(link.source)? else {
                debug!(source = %link.source, "dropping link for unknown source object");
                report.links_rejected += 1;
                continue;
            };
            self.schema().link_pair(link.attribute)?;
            match self.apply_remote_link(&mut source, link.attribute, link, now, txn)? {
                LinkApplyStatus::Applied => {
                    source
                        .metadata
                        .sort_for_storage(self.schema().naming_attribute());
                    txn.put(source);
                    report.links_applied += 1;
                }
                LinkApplyStatus::Rejected => report.links_rejected += 1,
            }
        }

        self.finish_cycle(txn, partition, peer, peer_udv, peer_high_usn, now)?;
        Ok(report)
    }

    /// Merges one object snapshot. Returns false when nothing changed.
    fn apply_object(
        &self,
        txn: &mut ReplTxn<'_>,
        local_udv: &UpToDateVector,
        incoming: &ReplicatedObject,
        peer: ReplicaId,
        peer_high_usn: Usn,
        now: Timestamp,
    ) -> Result<bool, EngineError> {
        let stamps = wire::decode_stamp_array(incoming.guid, &incoming.metadata)?;
        // a stamp originating at the sender cannot sit past the watermark
        // the sender itself advertised for this cycle
        if let Some(s) = stamps
            .iter()
            .find(|s| s.originating_replica_id == peer && s.originating_usn > peer_high_usn)
        {
            return Err(CoreError::OrderingViolation {
                object: incoming.guid,
                claimed: s.originating_usn.as_u64(),
                advertised: peer_high_usn.as_u64(),
            }
            .into());
        }
        let naming = self.schema().naming_attribute();

        match txn.get(incoming.guid)? {
            Some(mut obj) => {
                let surviving: Vec<AttributeStamp> = stamps
                    .into_iter()
                    .filter(|s| !local_udv.filter(s))
                    .collect();
                if surviving.is_empty() {
                    return Ok(false);
                }

                // dry-run against a copy so a fully rejected merge neither
                // consumes a sequence number nor rewrites the watermark
                let mut probe = obj.metadata.clone();
                if probe
                    .merge_remote(obj.guid, &surviving, Usn::ZERO)
                    .accepted
                    .is_empty()
                {
                    return Ok(false);
                }

                let usn = txn.txn_usn();
                let outcome = obj.metadata.merge_remote(obj.guid, &surviving, usn);
                for (id, value) in &incoming.values {
                    if !outcome.accepted.contains(id) {
                        continue;
                    }
                    match value {
                        Some(v) => {
                            obj.attributes.insert(*id, v.clone());
                        }
                        None => {
                            obj.attributes.remove(id);
                        }
                    }
                }

                if outcome.accepted.contains(&naming) && obj.dn != incoming.dn {
                    obj.dn = incoming.dn.clone();
                    self.resolve_name_collision(txn, &mut obj, now)?;
                }
                if let Some(sid) = &incoming.sid {
                    obj.sid = Some(sid.clone());
                }

                self.settle_deletion_state(&mut obj);
                obj.metadata.sort_for_storage(naming);
                txn.put(obj);
                Ok(true)
            }
            None => {
                let usn = txn.txn_usn();
                let mut obj = StoredObject::new(incoming.guid, incoming.dn.clone());
                obj.sid = incoming.sid.clone();
                obj.metadata.merge_remote(incoming.guid, &stamps, usn);
                for (id, value) in &incoming.values {
                    if let Some(v) = value {
                        obj.attributes.insert(*id, v.clone());
                    }
                }
                self.resolve_name_collision(txn, &mut obj, now)?;
                self.settle_deletion_state(&mut obj);
                obj.metadata.sort_for_storage(naming);
                txn.put(obj);
                Ok(true)
            }
        }
    }

    /// Resolves a name collision between a replicated object and a different
    /// local object at the same name. The naming stamps decide; the loser is
    /// renamed with a conflict-mangled relative name. A missing naming stamp
    /// concedes to the incoming object.
    fn resolve_name_collision(
        &self,
        txn: &mut ReplTxn<'_>,
        incoming_obj: &mut StoredObject,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let Some(occupant) = txn.get_by_dn(&incoming_obj.dn)? else {
            return Ok(());
        };
        if occupant.guid == incoming_obj.guid {
            return Ok(());
        }

        let naming = self.schema().naming_attribute();
        let incoming_wins = match (
            occupant.metadata.find(naming),
            incoming_obj.metadata.find(naming),
        ) {
            (Some(cur), Some(cand)) => is_newer(cur, cand),
            _ => true,
        };
        debug!(
            name = %incoming_obj.dn,
            incoming = %incoming_obj.guid,
            occupant = %occupant.guid,
            incoming_wins,
            "resolving name collision"
        );

        if incoming_wins {
            // mangle the local occupant with an originating rename
            let mut occupant = occupant;
            let mangled = conflict_rdn(&occupant.dn, occupant.guid);
            let new_dn = match occupant.dn.parent() {
                Some(parent) => parent.child(&mangled),
                None => Dn::new(mangled),
            };
            let usn = txn.alloc_usn();
            occupant.dn = new_dn.clone();
            occupant
                .attributes
                .insert(naming, new_dn.rdn_value().as_bytes().to_vec());
            occupant
                .metadata
                .stamp_local_write(naming, self.replica_id(), now, usn);
            occupant.metadata.sort_for_storage(naming);
            txn.put(occupant);
        } else {
            // store the incoming object under a mangled name; its metadata
            // stays as sent so the true name can still win elsewhere
            let mangled = conflict_rdn(&incoming_obj.dn, incoming_obj.guid);
            incoming_obj.dn = match incoming_obj.dn.parent() {
                Some(parent) => parent.child(&mangled),
                None => Dn::new(mangled),
            };
            incoming_obj
                .attributes
                .insert(naming, incoming_obj.dn.rdn_value().as_bytes().to_vec());
        }
        Ok(())
    }

    /// Re-derives the deletion state from the replicated markers.
    fn settle_deletion_state(&self, obj: &mut StoredObject) {
        let deleted = obj.attributes.contains_key(&AttributeId::IS_DELETED);
        let recycled = obj.attributes.contains_key(&AttributeId::IS_RECYCLED);
        let state = if recycled {
            DeletionState::Recycled
        } else if deleted && self.recycle_bin_enabled() {
            DeletionState::Deleted
        } else if deleted {
            DeletionState::Tombstone
        } else {
            DeletionState::Live
        };
        // transitions only move forward; a stale marker never resurrects
        if state > obj.deletion_state {
            obj.deletion_state = state;
        }
    }

    /// Closes a replication cycle: folds the peer's vector into ours and
    /// replaces the peer's reps-from record on the partition root.
    fn finish_cycle(
        &self,
        txn: &mut ReplTxn<'_>,
        partition: PartitionId,
        peer: ReplicaId,
        peer_udv: &UpToDateVector,
        peer_high_usn: Usn,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let mut root = txn
            .get(partition.0)?
            .ok_or(EngineError::ObjectNotFound(partition.0))?;
        let mut udv = Self::decode_udv(&root)?;
        udv.merge(self.replica_id(), peer_udv, peer, peer_high_usn, now);
        root.udv_blob = Some(Self::encode_udv(&udv));

        let record = RepsFrom {
            peer,
            highest_usn: peer_high_usn,
            last_success: now,
        };
        root.reps_from.insert(peer, record.encode()?);
        txn.put(root);
        Ok(())
    }
}
