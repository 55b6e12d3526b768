//! Fixed binary blob codecs for replication metadata.
//!
//! The layouts are bit-compatible across replicas: packed little-endian
//! fields, a version tag (1 for stamp arrays, 2 for the up-to-dateness
//! vector) and a trailing CRC32. Decode failures are protocol errors scoped
//! to the single object being processed, never fatal to the engine.

use crate::error::CoreError;
use crate::stamp::AttributeStamp;
use crate::types::{AttributeId, ObjectGuid, ReplicaId, Timestamp, Usn};
use crate::udv::{Cursor, UpToDateVector};

/// Version tag carried by serialized stamp arrays.
pub const STAMP_ARRAY_VERSION: u32 = 1;
/// Version tag carried by serialized up-to-dateness vectors.
pub const UDV_VERSION: u32 = 2;

/// Packed size of one attribute stamp on the wire.
const STAMP_WIRE_LEN: usize = 48;
/// Packed size of one vector cursor on the wire.
const CURSOR_WIRE_LEN: usize = 32;

/// CRC32, IEEE 802.3 polynomial.
fn compute_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.buf.len() - self.pos < n {
            return Err(CoreError::Truncated {
                needed: n,
                had: self.buf.len() - self.pos,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CoreError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn guid(&mut self) -> Result<[u8; 16], CoreError> {
        let b = self.take(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(b);
        Ok(out)
    }
}

fn push_stamp(out: &mut Vec<u8>, s: &AttributeStamp) {
    out.extend_from_slice(&s.attribute_id.as_u32().to_le_bytes());
    out.extend_from_slice(&s.version.to_le_bytes());
    out.extend_from_slice(&s.originating_change_time.as_u64().to_le_bytes());
    out.extend_from_slice(s.originating_replica_id.as_bytes());
    out.extend_from_slice(&s.originating_usn.as_u64().to_le_bytes());
    out.extend_from_slice(&s.local_usn.as_u64().to_le_bytes());
}

fn pull_stamp(r: &mut Reader<'_>) -> Result<AttributeStamp, CoreError> {
    Ok(AttributeStamp {
        attribute_id: AttributeId::new(r.u32()?),
        version: r.u32()?,
        originating_change_time: Timestamp::new(r.u64()?),
        originating_replica_id: ReplicaId::from_bytes(r.guid()?),
        originating_usn: Usn::new(r.u64()?),
        local_usn: Usn::new(r.u64()?),
    })
}

/// Serializes a stamp array in its storage order.
pub fn encode_stamp_array(stamps: &[AttributeStamp]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + stamps.len() * 48 + 4);
    out.extend_from_slice(&STAMP_ARRAY_VERSION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(&(stamps.len() as u32).to_le_bytes());
    for s in stamps {
        push_stamp(&mut out, s);
    }
    let crc = compute_crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Deserializes a stamp array blob. `object` is only used for error context.
pub fn decode_stamp_array(object: ObjectGuid, blob: &[u8]) -> Result<Vec<AttributeStamp>, CoreError> {
    if blob.len() < 4 {
        return Err(CoreError::Truncated {
            needed: 4,
            had: blob.len(),
        });
    }
    let (body, crc_bytes) = blob.split_at(blob.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if compute_crc32(body) != stored_crc {
        return Err(CoreError::ChecksumMismatch { object });
    }

    let mut r = Reader::new(body);
    let version = r.u32()?;
    if version != STAMP_ARRAY_VERSION {
        return Err(CoreError::BadBlobVersion {
            expected: STAMP_ARRAY_VERSION,
            got: version,
        });
    }
    let _reserved = r.u32()?;
    let count = r.u32()? as usize;
    // the declared count must fit in the bytes that are actually present
    // before it sizes any allocation
    let remaining = body.len() - r.pos;
    if count.saturating_mul(STAMP_WIRE_LEN) > remaining {
        return Err(CoreError::Truncated {
            needed: count.saturating_mul(STAMP_WIRE_LEN),
            had: remaining,
        });
    }
    let mut stamps = Vec::with_capacity(count);
    for _ in 0..count {
        let s = pull_stamp(&mut r)?;
        if stamps
            .iter()
            .any(|p: &AttributeStamp| p.attribute_id == s.attribute_id)
        {
            return Err(CoreError::DuplicateStamp {
                attribute: s.attribute_id,
                object,
            });
        }
        stamps.push(s);
    }
    Ok(stamps)
}

/// Serializes an up-to-dateness vector.
pub fn encode_udv(udv: &UpToDateVector) -> Vec<u8> {
    let cursors = udv.cursors();
    let mut out = Vec::with_capacity(12 + cursors.len() * 32 + 4);
    out.extend_from_slice(&UDV_VERSION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(&(cursors.len() as u32).to_le_bytes());
    for c in cursors {
        out.extend_from_slice(c.replica_id.as_bytes());
        out.extend_from_slice(&c.highest_usn.as_u64().to_le_bytes());
        out.extend_from_slice(&c.last_sync_success.as_u64().to_le_bytes());
    }
    let crc = compute_crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// One linked-attribute value in its wire form.
///
/// Unlike the stamp array and vector blobs this record carries no version
/// tag; its layout is fixed by the peer protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkValueRecord {
    /// The source object owning the forward link.
    pub source: ObjectGuid,
    /// The forward-link attribute.
    pub attribute_id: AttributeId,
    /// Link target; all-zero on values from legacy peers.
    pub target: ObjectGuid,
    /// Target name, for legacy resolution.
    pub target_name: String,
    /// False means logically deleted.
    pub active: bool,
    /// When the value was first added.
    pub add_time: Timestamp,
    /// Embedded stamp version.
    pub version: u32,
    /// Originating change time.
    pub change_time: Timestamp,
    /// Originating replica.
    pub originating_replica_id: ReplicaId,
    /// Originating sequence number.
    pub originating_usn: Usn,
    /// Local sequence number of the sender.
    pub local_usn: Usn,
}

/// Serializes one linked-attribute value.
pub fn encode_link_value(v: &LinkValueRecord) -> Vec<u8> {
    let name = v.target_name.as_bytes();
    let mut out = Vec::with_capacity(80 + name.len() + 4);
    out.extend_from_slice(v.source.as_bytes());
    out.extend_from_slice(&v.attribute_id.as_u32().to_le_bytes());
    out.extend_from_slice(v.target.as_bytes());
    out.push(v.active as u8);
    out.extend_from_slice(&v.add_time.as_u64().to_le_bytes());
    out.extend_from_slice(&v.version.to_le_bytes());
    out.extend_from_slice(&v.change_time.as_u64().to_le_bytes());
    out.extend_from_slice(v.originating_replica_id.as_bytes());
    out.extend_from_slice(&v.originating_usn.as_u64().to_le_bytes());
    out.extend_from_slice(&v.local_usn.as_u64().to_le_bytes());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name);
    let crc = compute_crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Deserializes one linked-attribute value blob.
pub fn decode_link_value(blob: &[u8]) -> Result<LinkValueRecord, CoreError> {
    if blob.len() < 4 {
        return Err(CoreError::Truncated {
            needed: 4,
            had: blob.len(),
        });
    }
    let (body, crc_bytes) = blob.split_at(blob.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut r = Reader::new(body);
    let source = ObjectGuid::from_bytes(r.guid()?);
    if compute_crc32(body) != stored_crc {
        return Err(CoreError::ChecksumMismatch { object: source });
    }
    let attribute_id = AttributeId::new(r.u32()?);
    let target = ObjectGuid::from_bytes(r.guid()?);
    let active = r.take(1)?[0] != 0;
    let add_time = Timestamp::new(r.u64()?);
    let version = r.u32()?;
    let change_time = Timestamp::new(r.u64()?);
    let originating_replica_id = ReplicaId::from_bytes(r.guid()?);
    let originating_usn = Usn::new(r.u64()?);
    let local_usn = Usn::new(r.u64()?);
    let name_len = r.u32()? as usize;
    let target_name = String::from_utf8(r.take(name_len)?.to_vec())
        .map_err(|_| CoreError::MalformedName { object: source })?;
    Ok(LinkValueRecord {
        source,
        attribute_id,
        target,
        target_name,
        active,
        add_time,
        version,
        change_time,
        originating_replica_id,
        originating_usn,
        local_usn,
    })
}

/// Deserializes an up-to-dateness vector blob. `partition_root` is only used
/// for error context.
pub fn decode_udv(partition_root: ObjectGuid, blob: &[u8]) -> Result<UpToDateVector, CoreError> {
    if blob.len() < 4 {
        return Err(CoreError::Truncated {
            needed: 4,
            had: blob.len(),
        });
    }
    let (body, crc_bytes) = blob.split_at(blob.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if compute_crc32(body) != stored_crc {
        return Err(CoreError::ChecksumMismatch {
            object: partition_root,
        });
    }

    let mut r = Reader::new(body);
    let version = r.u32()?;
    if version != UDV_VERSION {
        return Err(CoreError::BadBlobVersion {
            expected: UDV_VERSION,
            got: version,
        });
    }
    let _reserved = r.u32()?;
    let count = r.u32()? as usize;
    let remaining = body.len() - r.pos;
    if count.saturating_mul(CURSOR_WIRE_LEN) > remaining {
        return Err(CoreError::Truncated {
            needed: count.saturating_mul(CURSOR_WIRE_LEN),
            had: remaining,
        });
    }
    let mut cursors = Vec::with_capacity(count);
    for _ in 0..count {
        cursors.push(Cursor {
            replica_id: ReplicaId::from_bytes(r.guid()?),
            highest_usn: Usn::new(r.u64()?),
            last_sync_success: Timestamp::new(r.u64()?),
        });
    }
    Ok(UpToDateVector::from_cursors(cursors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(b: u8) -> ReplicaId {
        ReplicaId::from_bytes([b; 16])
    }

    fn stamp(id: u32) -> AttributeStamp {
        AttributeStamp {
            attribute_id: AttributeId::new(id),
            version: 3,
            originating_change_time: Timestamp::new(1234),
            originating_replica_id: rid(7),
            originating_usn: Usn::new(55),
            local_usn: Usn::new(56),
        }
    }

    #[test]
    fn stamp_array_round_trip() {
        let obj = ObjectGuid::generate();
        let stamps = vec![stamp(1), stamp(2), stamp(9)];
        let blob = encode_stamp_array(&stamps);
        let decoded = decode_stamp_array(obj, &blob).unwrap();
        assert_eq!(decoded, stamps);
    }

    #[test]
    fn stamp_array_rejects_wrong_version() {
        let mut blob = encode_stamp_array(&[stamp(1)]);
        blob[0] = 9;
        // refresh crc so the version check is what fires
        let body_len = blob.len() - 4;
        let crc = compute_crc32(&blob[..body_len]);
        blob[body_len..].copy_from_slice(&crc.to_le_bytes());
        let err = decode_stamp_array(ObjectGuid::generate(), &blob).unwrap_err();
        assert!(matches!(err, CoreError::BadBlobVersion { expected: 1, got: 9 }));
    }

    #[test]
    fn stamp_array_rejects_corruption() {
        let mut blob = encode_stamp_array(&[stamp(1)]);
        let mid = blob.len() / 2;
        blob[mid] ^= 0xff;
        let err = decode_stamp_array(ObjectGuid::generate(), &blob).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn stamp_array_rejects_truncation() {
        let blob = encode_stamp_array(&[stamp(1)]);
        let err = decode_stamp_array(ObjectGuid::generate(), &blob[..3]).unwrap_err();
        assert!(matches!(err, CoreError::Truncated { .. }));
    }

    #[test]
    fn stamp_array_rejects_duplicate_attribute() {
        // craft a body with the same attid twice
        let mut out = Vec::new();
        out.extend_from_slice(&STAMP_ARRAY_VERSION.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..2 {
            push_stamp(&mut out, &stamp(5));
        }
        let crc = compute_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        let err = decode_stamp_array(ObjectGuid::generate(), &out).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateStamp { .. }));
    }

    #[test]
    fn stamp_array_rejects_oversized_count() {
        // checksummed header claiming u32::MAX stamps with no payload; the
        // decoder must report truncation rather than size an allocation
        // from the declared count
        let mut out = Vec::new();
        out.extend_from_slice(&STAMP_ARRAY_VERSION.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        let crc = compute_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        let err = decode_stamp_array(ObjectGuid::generate(), &out).unwrap_err();
        assert!(matches!(err, CoreError::Truncated { had: 0, .. }));
    }

    #[test]
    fn udv_rejects_oversized_count() {
        let mut out = Vec::new();
        out.extend_from_slice(&UDV_VERSION.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        let crc = compute_crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        let err = decode_udv(ObjectGuid::generate(), &out).unwrap_err();
        assert!(matches!(err, CoreError::Truncated { had: 0, .. }));
    }

    #[test]
    fn udv_round_trip() {
        let udv = UpToDateVector::from_cursors(vec![
            Cursor {
                replica_id: rid(2),
                highest_usn: Usn::new(10),
                last_sync_success: Timestamp::new(5),
            },
            Cursor {
                replica_id: rid(1),
                highest_usn: Usn::new(20),
                last_sync_success: Timestamp::new(6),
            },
        ]);
        let blob = encode_udv(&udv);
        let decoded = decode_udv(ObjectGuid::generate(), &blob).unwrap();
        assert_eq!(decoded, udv);
    }

    #[test]
    fn udv_rejects_wrong_version() {
        let mut blob = encode_udv(&UpToDateVector::new());
        blob[0] = 1;
        let body_len = blob.len() - 4;
        let crc = compute_crc32(&blob[..body_len]);
        blob[body_len..].copy_from_slice(&crc.to_le_bytes());
        let err = decode_udv(ObjectGuid::generate(), &blob).unwrap_err();
        assert!(matches!(err, CoreError::BadBlobVersion { expected: 2, got: 1 }));
    }

    #[test]
    fn link_value_round_trip() {
        let v = LinkValueRecord {
            source: ObjectGuid::generate(),
            attribute_id: AttributeId::new(0x100),
            target: ObjectGuid::generate(),
            target_name: "CN=U,DC=example".to_string(),
            active: false,
            add_time: Timestamp::new(3),
            version: 2,
            change_time: Timestamp::new(9),
            originating_replica_id: rid(4),
            originating_usn: Usn::new(11),
            local_usn: Usn::new(12),
        };
        let blob = encode_link_value(&v);
        assert_eq!(decode_link_value(&blob).unwrap(), v);
    }

    #[test]
    fn link_value_rejects_corruption() {
        let v = LinkValueRecord {
            source: ObjectGuid::generate(),
            attribute_id: AttributeId::new(0x100),
            target: ObjectGuid::NIL,
            target_name: String::new(),
            active: true,
            add_time: Timestamp::new(1),
            version: 1,
            change_time: Timestamp::new(1),
            originating_replica_id: rid(1),
            originating_usn: Usn::new(1),
            local_usn: Usn::new(1),
        };
        let mut blob = encode_link_value(&v);
        let mid = blob.len() / 2;
        blob[mid] ^= 0xff;
        assert!(matches!(
            decode_link_value(&blob).unwrap_err(),
            CoreError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn empty_stamp_array_round_trips() {
        let blob = encode_stamp_array(&[]);
        let decoded = decode_stamp_array(ObjectGuid::generate(), &blob).unwrap();
        assert!(decoded.is_empty());
    }
}
