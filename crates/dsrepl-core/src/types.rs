//! Identifier newtypes shared across the replication engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one replica (DSA) in the replicated set.
///
/// Ordering is the byte-order comparison of the underlying GUID; the conflict
/// comparator relies on this being total and identical on every replica.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Creates a replica id from a raw UUID.
    pub fn new(id: Uuid) -> Self {
        ReplicaId(id)
    }

    /// Generates a fresh random replica id.
    pub fn generate() -> Self {
        ReplicaId(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the 16 raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuilds a replica id from 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ReplicaId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a replicated object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectGuid(Uuid);

impl ObjectGuid {
    /// The all-zero sentinel used by legacy peers that send links without a
    /// target GUID. Resolution falls back to matching by name.
    pub const NIL: ObjectGuid = ObjectGuid(Uuid::nil());

    /// Creates an object GUID from a raw UUID.
    pub fn new(id: Uuid) -> Self {
        ObjectGuid(id)
    }

    /// Generates a fresh random object GUID.
    pub fn generate() -> Self {
        ObjectGuid(Uuid::new_v4())
    }

    /// Returns true if this is the all-zero sentinel.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the 16 raw bytes of the GUID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuilds an object GUID from 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectGuid(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ObjectGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric identifier of a schema attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId(u32);

impl AttributeId {
    /// Structural attribute describing how the object is instantiated in the
    /// partition. Exempt from rejection logging and watermark filtering.
    pub const INSTANCE_TYPE: AttributeId = AttributeId(0x00020001);
    /// The relative naming attribute. Always sorted last in a stamp array.
    pub const NAME: AttributeId = AttributeId(0x00090001);
    /// Deletion marker.
    pub const IS_DELETED: AttributeId = AttributeId(0x00020030);
    /// Recycle marker, present only with the recycle-bin feature.
    pub const IS_RECYCLED: AttributeId = AttributeId(0x0002002a);
    /// GUID of the parent container at deletion time.
    pub const LAST_KNOWN_PARENT: AttributeId = AttributeId(0x0002002b);
    /// Snapshot of the naming value taken when the object is stripped.
    pub const LAST_KNOWN_RDN: AttributeId = AttributeId(0x0002002c);
    /// Next available relative-id pool boundary, kept on the partition root.
    pub const RID_AVAILABLE_POOL: AttributeId = AttributeId(0x00090074);
    /// Current holder of the partition's operational role.
    pub const ROLE_OWNER: AttributeId = AttributeId(0x00090171);

    /// Creates an attribute id from a raw u32 value.
    pub const fn new(id: u32) -> Self {
        AttributeId(id)
    }

    /// Returns the raw u32 value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr-{:#x}", self.0)
    }
}

/// A per-replica update sequence number: monotonically increasing logical time
/// of a local write.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Usn(u64);

impl Usn {
    /// The zero watermark: nothing has been seen yet.
    pub const ZERO: Usn = Usn(0);

    /// Creates a USN from a raw u64 value.
    pub const fn new(v: u64) -> Self {
        Usn(v)
    }

    /// Returns the raw u64 value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Usn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timestamp carried in stamps, in 100ns ticks since 1601 (the
/// peer protocol's epoch). Only compared, never interpreted.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from raw ticks.
    pub const fn new(ticks: u64) -> Self {
        Timestamp(ticks)
    }

    /// Returns the raw tick value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
