//! The engine handle: configuration plus the store and schema collaborators.
//!
//! All replication operations hang off [`ReplEngine`] and are grouped by
//! path: local originating writes in `write`, the deletion lifecycle in
//! `tombstone`, inbound application in `apply`, outbound enumeration in
//! `outbound` and one-shot requests in `extended`. Wall-clock time is always
//! an explicit parameter; the engine never reads a clock.

use std::sync::Arc;

use dsrepl_core::{wire, ReplicaId, UpToDateVector};

use crate::error::EngineError;
use crate::schema::Schema;
use crate::store::{DirectoryStore, PartitionId, StoredObject};
use crate::txn::ReplTxn;

/// Static engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// This replica's identity, stamped on every originating write.
    pub replica_id: ReplicaId,
    /// Enables the Deleted and Recycled lifecycle states. Without it a delete
    /// goes straight to Tombstone.
    pub recycle_bin_enabled: bool,
}

/// The replication metadata engine.
pub struct ReplEngine {
    store: Arc<dyn DirectoryStore>,
    schema: Arc<dyn Schema>,
    config: EngineConfig,
}

impl ReplEngine {
    /// Creates an engine over the given store and schema.
    pub fn new(store: Arc<dyn DirectoryStore>, schema: Arc<dyn Schema>, config: EngineConfig) -> Self {
        ReplEngine {
            store,
            schema,
            config,
        }
    }

    /// This replica's identity.
    pub fn replica_id(&self) -> ReplicaId {
        self.config.replica_id
    }

    /// True if the Deleted/Recycled lifecycle states are enabled.
    pub fn recycle_bin_enabled(&self) -> bool {
        self.config.recycle_bin_enabled
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn DirectoryStore {
        self.store.as_ref()
    }

    /// The schema collaborator.
    pub fn schema(&self) -> &dyn Schema {
        self.schema.as_ref()
    }

    pub(crate) fn begin(&self) -> ReplTxn<'_> {
        ReplTxn::begin(self.store.as_ref())
    }

    /// Loads a partition's up-to-dateness vector from its root object. An
    /// absent blob is an empty vector.
    pub fn partition_udv(&self, partition: PartitionId) -> Result<UpToDateVector, EngineError> {
        let root = self
            .store
            .get_by_guid(None, partition.0)?
            .ok_or(EngineError::ObjectNotFound(partition.0))?;
        Self::decode_udv(&root)
    }

    pub(crate) fn decode_udv(root: &StoredObject) -> Result<UpToDateVector, EngineError> {
        match &root.udv_blob {
            Some(blob) => Ok(wire::decode_udv(root.guid, blob)?),
            None => Ok(UpToDateVector::new()),
        }
    }

    pub(crate) fn encode_udv(udv: &UpToDateVector) -> Vec<u8> {
        wire::encode_udv(udv)
    }
}
