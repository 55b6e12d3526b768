//! Per-peer synchronization records kept on the partition root.
//!
//! One record per direct peer: who we pulled from, how far we got and when it
//! last worked. Serialized with bincode; a record for an already-known peer
//! replaces the previous one.

use serde::{Deserialize, Serialize};

use dsrepl_core::{ReplicaId, Timestamp, Usn};

use crate::error::EngineError;

/// One peer's synchronization state for a partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepsFrom {
    /// The peer replica.
    pub peer: ReplicaId,
    /// Highest sequence number of the peer applied here.
    pub highest_usn: Usn,
    /// When the last cycle with this peer completed.
    pub last_success: Timestamp,
}

impl RepsFrom {
    /// Serializes the record.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a record.
    pub fn decode(blob: &[u8]) -> Result<RepsFrom, EngineError> {
        Ok(bincode::deserialize(blob)?)
    }
}
