//! One-shot extended operations.
//!
//! These ride the replication transport but bypass enumeration entirely:
//! a privileged store side effect on the partition root and a tiny fixed
//! reply. They play no part in the convergence protocol.

use tracing::info;

use dsrepl_core::{AttributeId, ReplicaId, Timestamp};

use crate::engine::ReplEngine;
use crate::error::EngineError;
use crate::store::PartitionId;

/// A one-shot request carried instead of an enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtendedOp {
    /// Allocate a block of relative ids from the partition's pool.
    RidPoolAllocation {
        /// Number of ids requested.
        pool_size: u64,
    },
    /// Hand the partition's operational role to another replica.
    RoleTransfer {
        /// The replica taking the role.
        new_owner: ReplicaId,
    },
}

/// Fixed reply to an extended operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtendedReply {
    /// An allocated relative-id range, inclusive on both ends.
    RidPool {
        /// First id of the block.
        start: u64,
        /// Last id of the block.
        end: u64,
    },
    /// The role now belongs to this replica.
    RoleTransferred {
        /// The new role owner.
        owner: ReplicaId,
    },
}

impl ReplEngine {
    /// Performs a one-shot extended operation against a partition root.
    /// Requires system privilege; the side effect is a normal originating
    /// write and replicates like any other.
    pub fn extended_operation(
        &self,
        partition: PartitionId,
        op: ExtendedOp,
        privileged: bool,
        now: Timestamp,
    ) -> Result<ExtendedReply, EngineError> {
        if !privileged {
            return Err(EngineError::PermissionDenied);
        }
        let mut txn = self.begin();
        let result = (|| {
            let mut root = txn
                .get(partition.0)?
                .ok_or(EngineError::ObjectNotFound(partition.0))?;
            let usn = txn.txn_usn();

            let reply = match op {
                ExtendedOp::RidPoolAllocation { pool_size } => {
                    let next = root
                        .attributes
                        .get(&AttributeId::RID_AVAILABLE_POOL)
                        .and_then(|v| v.as_slice().try_into().ok())
                        .map(u64::from_le_bytes)
                        .unwrap_or(1);
                    let size = pool_size.max(1);
                    let start = next;
                    let end = start + size - 1;
                    root.attributes.insert(
                        AttributeId::RID_AVAILABLE_POOL,
                        (end + 1).to_le_bytes().to_vec(),
                    );
                    root.metadata.stamp_local_write(
                        AttributeId::RID_AVAILABLE_POOL,
                        self.replica_id(),
                        now,
                        usn,
                    );
                    info!(%partition, start, end, "allocated relative-id pool");
                    ExtendedReply::RidPool { start, end }
                }
                ExtendedOp::RoleTransfer { new_owner } => {
                    root.attributes.insert(
                        AttributeId::ROLE_OWNER,
                        new_owner.as_bytes().to_vec(),
                    );
                    root.metadata.stamp_local_write(
                        AttributeId::ROLE_OWNER,
                        self.replica_id(),
                        now,
                        usn,
                    );
                    info!(%partition, owner = %new_owner, "transferred partition role");
                    ExtendedReply::RoleTransferred { owner: new_owner }
                }
            };

            root.metadata
                .sort_for_storage(self.schema().naming_attribute());
            txn.put(root);
            Ok(reply)
        })();
        match result {
            Ok(reply) => {
                txn.commit(self.schema())?;
                Ok(reply)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::memstore::MemoryStore;
    use crate::schema::TestSchema;
    use crate::store::{DirectoryStore, Dn};

    fn build() -> (ReplEngine, Arc<MemoryStore>, PartitionId) {
        let store = Arc::new(MemoryStore::new());
        let partition = store.add_partition(Dn::new("DC=example"));
        let engine = ReplEngine::new(
            store.clone(),
            Arc::new(TestSchema::new(AttributeId::NAME)),
            EngineConfig {
                replica_id: ReplicaId::from_bytes([1; 16]),
                recycle_bin_enabled: false,
            },
        );
        (engine, store, partition)
    }

    #[test]
    fn rid_pools_never_overlap() {
        let (engine, _, partition) = build();
        let a = engine
            .extended_operation(
                partition,
                ExtendedOp::RidPoolAllocation { pool_size: 500 },
                true,
                Timestamp::new(1),
            )
            .unwrap();
        let b = engine
            .extended_operation(
                partition,
                ExtendedOp::RidPoolAllocation { pool_size: 500 },
                true,
                Timestamp::new(2),
            )
            .unwrap();
        let (ExtendedReply::RidPool { start: s1, end: e1 }, ExtendedReply::RidPool { start: s2, .. }) =
            (a, b)
        else {
            panic!("expected rid pool replies");
        };
        assert_eq!(e1 - s1 + 1, 500);
        assert_eq!(s2, e1 + 1);
    }

    #[test]
    fn role_transfer_is_a_stamped_write() {
        let (engine, store, partition) = build();
        let owner = ReplicaId::from_bytes([5; 16]);
        engine
            .extended_operation(
                partition,
                ExtendedOp::RoleTransfer { new_owner: owner },
                true,
                Timestamp::new(1),
            )
            .unwrap();
        let root = store.get_by_guid(None, partition.0).unwrap().unwrap();
        assert_eq!(
            root.attributes.get(&AttributeId::ROLE_OWNER).unwrap(),
            owner.as_bytes()
        );
        assert!(root.metadata.find(AttributeId::ROLE_OWNER).is_some());
    }

    #[test]
    fn extended_ops_require_privilege() {
        let (engine, _, partition) = build();
        assert!(matches!(
            engine.extended_operation(
                partition,
                ExtendedOp::RidPoolAllocation { pool_size: 1 },
                false,
                Timestamp::new(1),
            ),
            Err(EngineError::PermissionDenied)
        ));
    }
}
