//! Error types for the replication engine.

use dsrepl_core::{AttributeId, CoreError, ObjectGuid};
use thiserror::Error;

/// Errors surfaced by the replication engine.
///
/// Protocol/decode errors are scoped to a single object or batch item;
/// schema-lookup failures and backlink failures abort the enclosing
/// transaction; store errors propagate unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed stamp or vector blob (fatal to one object only).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Attribute id not known to the schema. Internal consistency error.
    #[error("unknown attribute {0}")]
    UnknownAttribute(AttributeId),

    /// Attribute is not a forward link, or its reciprocal link id is missing.
    #[error("attribute {0} has no reciprocal link")]
    UnknownLink(AttributeId),

    /// Object not present in the directory store.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectGuid),

    /// No object with the given name.
    #[error("no object named {0}")]
    DnNotFound(String),

    /// An object with the given name already exists.
    #[error("an object named {0} already exists")]
    DnExists(String),

    /// A second active link value for the same target was added.
    #[error("duplicate active link value for target {target} on attribute {attribute}")]
    DuplicateLinkValue {
        /// The forward-link attribute.
        attribute: AttributeId,
        /// The duplicated link target.
        target: ObjectGuid,
    },

    /// A link delete named a value that does not exist or is already inactive.
    #[error("no active link value for target {target} on attribute {attribute}")]
    NoSuchLinkValue {
        /// The forward-link attribute.
        attribute: AttributeId,
        /// The missing link target.
        target: ObjectGuid,
    },

    /// A backlink job could not resolve its target object. Fatal to the
    /// owning transaction.
    #[error("backlink target {0} not found")]
    BacklinkTargetNotFound(ObjectGuid),

    /// The caller lacks the privilege for this operation (tombstone purge,
    /// role transfer).
    #[error("operation requires system privilege")]
    PermissionDenied,

    /// A deletion-state transition that would move backward was requested.
    #[error("object {0} cannot move backward in the deletion lifecycle")]
    DeletionStateViolation(ObjectGuid),

    /// The store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// Persisted reps-from record could not be decoded.
    #[error("reps-from record corrupt: {0}")]
    RepsFrom(#[from] bincode::Error),
}
