//! Error types for the core metadata structures.

use crate::types::{AttributeId, ObjectGuid};
use thiserror::Error;

/// Errors produced by stamp, vector and wire-blob handling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A serialized blob carried an unexpected version tag.
    #[error("bad blob version: expected {expected}, got {got}")]
    BadBlobVersion {
        /// The version tag this decoder accepts.
        expected: u32,
        /// The version tag found in the blob.
        got: u32,
    },

    /// A serialized blob ended before its declared contents.
    #[error("truncated blob: needed {needed} bytes, had {had}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually available.
        had: usize,
    },

    /// A blob failed its checksum.
    #[error("blob checksum mismatch for object {object}")]
    ChecksumMismatch {
        /// The object whose metadata blob is corrupt.
        object: ObjectGuid,
    },

    /// Two stamps for the same attribute id appeared in one stamp array.
    #[error("duplicate stamp for {attribute} on object {object}")]
    DuplicateStamp {
        /// The duplicated attribute.
        attribute: AttributeId,
        /// The owning object.
        object: ObjectGuid,
    },

    /// A wire blob carried a name field that is not valid UTF-8.
    #[error("malformed name field in blob for object {object}")]
    MalformedName {
        /// The object whose blob is malformed.
        object: ObjectGuid,
    },

    /// An incoming stamp claimed a sequence number past what its sender
    /// advertised as committed for the cycle.
    #[error("ordering violation on object {object}: stamp usn {claimed} exceeds the advertised watermark {advertised}")]
    OrderingViolation {
        /// The object whose update is being applied.
        object: ObjectGuid,
        /// Sequence number claimed by the incoming stamp.
        claimed: u64,
        /// High-water mark the sender advertised.
        advertised: u64,
    },
}
