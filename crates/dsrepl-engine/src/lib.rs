#![warn(missing_docs)]

//! dsrepl engine: intercepts local directory writes to stamp replication
//! metadata, maintains linked attributes and their backlinks, drives the
//! tombstone lifecycle, applies replicated batches from peers and serves
//! resumable outbound change enumerations.

pub mod apply;
pub mod backlink;
pub mod engine;
pub mod error;
pub mod extended;
pub mod linked;
pub mod memstore;
pub mod outbound;
pub mod repsfrom;
pub mod schema;
pub mod store;
pub mod tombstone;
pub mod txn;
pub mod write;

pub use apply::{ApplyReport, ReplicatedLink, ReplicatedObject};
pub use engine::{EngineConfig, ReplEngine};
pub use error::EngineError;
pub use extended::{ExtendedOp, ExtendedReply};
pub use linked::{LinkStamp, LinkValue};
pub use memstore::MemoryStore;
pub use outbound::{EnumerationCursor, EnumerationRequest, EnumerationResponse};
pub use schema::{AttributeDef, Schema, TestSchema};
pub use store::{AttrChange, DeletionState, DirectoryStore, Dn, PartitionId, StoredObject};
pub use tombstone::PRESERVED_ATTRIBUTES;
