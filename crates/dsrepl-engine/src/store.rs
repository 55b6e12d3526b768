//! The directory-store collaborator boundary.
//!
//! The engine never allocates or frees objects; it annotates them inside the
//! caller's transaction. This module defines the object view the engine works
//! on, the transaction handle with its buffered write set, and the narrow
//! trait the underlying store must implement. Sequence numbers are a store
//! capability: transaction-scoped, durable only on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use dsrepl_core::{AttributeId, ObjectGuid, ObjectMetadata, ReplicaId, Usn};

use crate::error::EngineError;
use crate::linked::LinkValue;

/// A distinguished name. Components are comma-separated, most specific first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dn(String);

impl Dn {
    /// Creates a DN from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Dn(s.into())
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first (most specific) component, e.g. `CN=Alice`.
    pub fn rdn(&self) -> &str {
        self.0.split(',').next().unwrap_or(&self.0)
    }

    /// The value part of the first component.
    pub fn rdn_value(&self) -> &str {
        let rdn = self.rdn();
        rdn.split_once('=').map(|(_, v)| v).unwrap_or(rdn)
    }

    /// The DN with the first component removed, if any remains.
    pub fn parent(&self) -> Option<Dn> {
        self.0.split_once(',').map(|(_, rest)| Dn::new(rest))
    }

    /// A child DN with `rdn` prepended.
    pub fn child(&self, rdn: &str) -> Dn {
        Dn(format!("{},{}", rdn, self.0))
    }

    /// Number of components; parents are strictly shallower than children.
    pub fn depth(&self) -> usize {
        self.0.split(',').count()
    }

    /// True if `self` is `ancestor` or lies below it.
    pub fn is_under(&self, ancestor: &Dn) -> bool {
        self == ancestor || self.0.ends_with(&format!(",{}", ancestor.0))
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a replicated partition by its root object's GUID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub ObjectGuid);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Deletion lifecycle position of an object. Transitions only move forward;
/// physical removal (purge) takes the object out of the store entirely.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum DeletionState {
    /// Normal object.
    #[default]
    Live,
    /// Deleted but restorable (recycle-bin deployments only).
    Deleted,
    /// Stripped, awaiting garbage collection (recycle-bin deployments only).
    Recycled,
    /// Stripped remnant kept so the deletion itself replicates.
    Tombstone,
}

impl DeletionState {
    /// True for any state past Live.
    pub fn is_deleted(&self) -> bool {
        !matches!(self, DeletionState::Live)
    }
}

/// The engine's view of one object in the directory store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredObject {
    /// Immutable identity.
    pub guid: ObjectGuid,
    /// Current name; mutable via rename.
    pub dn: Dn,
    /// Optional security identifier, carried opaquely.
    pub sid: Option<Vec<u8>>,
    /// Plain attribute values, opaque to the engine.
    pub attributes: BTreeMap<AttributeId, Vec<u8>>,
    /// Forward-link values with their embedded stamps.
    pub links: BTreeMap<AttributeId, Vec<LinkValue>>,
    /// Derived backlinks, recomputed from peers' forward links.
    pub backlinks: BTreeMap<AttributeId, BTreeSet<ObjectGuid>>,
    /// The attribute version-stamp array.
    pub metadata: ObjectMetadata,
    /// Position in the deletion lifecycle.
    pub deletion_state: DeletionState,
    /// Serialized up-to-dateness vector; partition roots only.
    pub udv_blob: Option<Vec<u8>>,
    /// Serialized reps-from record per known peer; partition roots only.
    pub reps_from: BTreeMap<ReplicaId, Vec<u8>>,
    /// System flag: keep the object under its parent when deleted.
    pub disallow_move_on_delete: bool,
}

impl StoredObject {
    /// Creates an empty live object.
    pub fn new(guid: ObjectGuid, dn: Dn) -> Self {
        StoredObject {
            guid,
            dn,
            sid: None,
            attributes: BTreeMap::new(),
            links: BTreeMap::new(),
            backlinks: BTreeMap::new(),
            metadata: ObjectMetadata::new(),
            deletion_state: DeletionState::Live,
            udv_blob: None,
            reps_from: BTreeMap::new(),
            disallow_move_on_delete: false,
        }
    }

    /// All link values for `attribute`, empty slice if none.
    pub fn link_values(&self, attribute: AttributeId) -> &[LinkValue] {
        self.links.get(&attribute).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A store transaction: a buffered write set plus the sequence numbers
/// reserved so far. Nothing is observable until commit; an abort discards
/// everything including the reservation.
#[derive(Debug)]
pub struct StoreTxn {
    pub(crate) writes: BTreeMap<ObjectGuid, StoredObject>,
    pub(crate) removals: BTreeSet<ObjectGuid>,
    pub(crate) next_usn: u64,
}

impl StoreTxn {
    pub(crate) fn new(next_usn: u64) -> Self {
        StoreTxn {
            writes: BTreeMap::new(),
            removals: BTreeSet::new(),
            next_usn,
        }
    }

    /// Buffers a create-or-replace of `obj`.
    pub fn put(&mut self, obj: StoredObject) {
        self.removals.remove(&obj.guid);
        self.writes.insert(obj.guid, obj);
    }

    /// Buffers a physical removal.
    pub fn remove(&mut self, guid: ObjectGuid) {
        self.writes.remove(&guid);
        self.removals.insert(guid);
    }
}

/// Operations the engine consumes from the directory store.
///
/// Reads take an optional transaction so callers inside a transaction see
/// their own buffered writes.
pub trait DirectoryStore: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> StoreTxn;

    /// Applies a transaction's write set atomically and makes its reserved
    /// sequence numbers durable.
    fn commit(&self, txn: StoreTxn) -> Result<(), EngineError>;

    /// Discards a transaction. Reserved sequence numbers are never observable.
    fn abort(&self, txn: StoreTxn);

    /// Reserves the next sequence number within `txn`.
    fn next_usn(&self, txn: &mut StoreTxn) -> Usn;

    /// Reads an object by GUID, seeing `txn`'s buffered writes if given.
    fn get_by_guid(
        &self,
        txn: Option<&StoreTxn>,
        guid: ObjectGuid,
    ) -> Result<Option<StoredObject>, EngineError>;

    /// Reads an object by name, seeing `txn`'s buffered writes if given.
    fn get_by_dn(&self, txn: Option<&StoreTxn>, dn: &Dn) -> Result<Option<StoredObject>, EngineError>;

    /// All partitions hosted by this store.
    fn partitions(&self) -> Vec<PartitionId>;

    /// The partition an object name belongs to.
    fn partition_of(&self, dn: &Dn) -> Result<PartitionId, EngineError>;

    /// The root DN of a partition.
    fn partition_dn(&self, partition: PartitionId) -> Result<Dn, EngineError>;

    /// The well-known deleted-objects container of a partition.
    fn deleted_objects_dn(&self, partition: PartitionId) -> Result<Dn, EngineError>;

    /// GUIDs of all objects in a partition, root included.
    fn objects_in_partition(&self, partition: PartitionId) -> Result<Vec<ObjectGuid>, EngineError>;

    /// Highest sequence number made durable by a committed transaction.
    fn highest_committed_usn(&self) -> Usn;
}

/// One change requested against an object by the local-write path.
#[derive(Clone, Debug)]
pub enum AttrChange {
    /// Set a plain attribute value.
    Put {
        /// The attribute to set.
        attribute: AttributeId,
        /// The new value.
        value: Vec<u8>,
    },
    /// Remove a plain attribute.
    Remove {
        /// The attribute to remove.
        attribute: AttributeId,
    },
    /// Add a forward-link value.
    LinkAdd {
        /// The forward-link attribute.
        attribute: AttributeId,
        /// Link target.
        target: ObjectGuid,
        /// Target's name at link time, for legacy-peer resolution.
        target_name: String,
    },
    /// Deactivate a forward-link value.
    LinkDelete {
        /// The forward-link attribute.
        attribute: AttributeId,
        /// Link target.
        target: ObjectGuid,
    },
    /// Replace the active value set of a forward-link attribute.
    LinkReplace {
        /// The forward-link attribute.
        attribute: AttributeId,
        /// The new active target set.
        targets: Vec<(ObjectGuid, String)>,
    },
}
