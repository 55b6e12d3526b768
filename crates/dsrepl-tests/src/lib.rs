//! Multi-replica test harness.
//!
//! Each [`TestReplica`] is a full engine over its own in-memory store,
//! hosting one replica of a shared partition. Replication cycles run by
//! driving the outbound enumeration of one replica straight into the
//! inbound-apply path of another, the way a transport layer would.

use std::sync::Arc;

use dsrepl_core::{AttributeId, ObjectGuid, ReplicaId, Timestamp, UpToDateVector, Usn};
use dsrepl_engine::repsfrom::RepsFrom;
use dsrepl_engine::{
    DirectoryStore, Dn, EngineConfig, EnumerationRequest, MemoryStore, PartitionId, ReplEngine,
    StoredObject, TestSchema,
};

/// Plain test attribute.
pub const DESCRIPTION: AttributeId = AttributeId::new(0x200);
/// Forward-link test attribute.
pub const MEMBER: AttributeId = AttributeId::new(0x100);
/// Its reciprocal backlink.
pub const MEMBER_OF: AttributeId = AttributeId::new(0x101);

/// Shared root GUID so every replica hosts the same partition.
pub fn partition_guid() -> ObjectGuid {
    ObjectGuid::from_bytes([0xEE; 16])
}

fn deleted_container_guid() -> ObjectGuid {
    ObjectGuid::from_bytes([0xDD; 16])
}

/// Turns on log output for a test run when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One replica: engine, store, and the shared partition.
pub struct TestReplica {
    /// The engine under test.
    pub engine: ReplEngine,
    /// Its backing store.
    pub store: Arc<MemoryStore>,
    /// The hosted partition.
    pub partition: PartitionId,
}

impl TestReplica {
    /// Builds a replica whose identity is sixteen copies of `tag`.
    pub fn new(tag: u8, recycle_bin: bool) -> Self {
        init_logging();
        let store = Arc::new(MemoryStore::new());
        let partition = store.add_partition_with_guid(partition_guid(), Dn::new("DC=example"));

        let mut schema = TestSchema::new(AttributeId::NAME);
        schema.plain(DESCRIPTION.as_u32(), "description");
        schema.link(MEMBER.as_u32(), "member", MEMBER_OF.as_u32(), "memberOf");

        let engine = ReplEngine::new(
            store.clone(),
            Arc::new(schema),
            EngineConfig {
                replica_id: ReplicaId::from_bytes([tag; 16]),
                recycle_bin_enabled: recycle_bin,
            },
        );
        // deleted-objects container, same GUID everywhere so replicas merge
        // it instead of fighting over the name
        let deleted = store.deleted_objects_dn(partition).unwrap();
        engine
            .create_object(&deleted, deleted_container_guid(), vec![], Timestamp::new(1))
            .unwrap();

        TestReplica {
            engine,
            store,
            partition,
        }
    }

    /// This replica's identity.
    pub fn id(&self) -> ReplicaId {
        self.engine.replica_id()
    }

    /// Reads an object from the committed store.
    pub fn get(&self, guid: ObjectGuid) -> Option<StoredObject> {
        self.store.get_by_guid(None, guid).unwrap()
    }

    /// The watermark recorded from the last successful pull from `peer`.
    pub fn watermark_for(&self, peer: ReplicaId) -> Usn {
        let root = self.get(self.partition.0).unwrap();
        root.reps_from
            .get(&peer)
            .map(|blob| RepsFrom::decode(blob).unwrap().highest_usn)
            .unwrap_or(Usn::ZERO)
    }

    /// Runs one full replication cycle pulling from `src`, batching with the
    /// given limits to exercise pagination.
    pub fn pull_from_batched(
        &self,
        src: &TestReplica,
        max_objects: usize,
        max_links: usize,
        now: Timestamp,
    ) {
        let watermark = self.watermark_for(src.id());
        let peer_udv: UpToDateVector = self.engine.partition_udv(self.partition).unwrap();

        let mut request = EnumerationRequest::new(src.partition, self.id(), watermark, peer_udv);
        request.max_objects = max_objects;
        request.max_links = max_links;
        request.ancestor_order = true;

        let mut cursor = None;
        let mut objects = Vec::new();
        let mut links = Vec::new();
        loop {
            let resp = src
                .engine
                .begin_or_resume_enumeration(&request, cursor, now)
                .unwrap();
            objects.extend(resp.objects);
            links.extend(resp.links);
            if !resp.more_data {
                let new_udv = resp.new_udv.expect("final batch carries the vector");
                self.engine
                    .apply_replicated_batch(
                        self.partition,
                        src.id(),
                        &objects,
                        &links,
                        &new_udv,
                        resp.new_watermark,
                        now,
                    )
                    .unwrap();
                return;
            }
            cursor = Some(resp.cursor);
        }
    }

    /// Runs one full unbatched replication cycle pulling from `src`.
    pub fn pull_from(&self, src: &TestReplica, now: Timestamp) {
        self.pull_from_batched(src, usize::MAX, usize::MAX, now);
    }
}

/// One cycle in each direction.
pub fn sync_both(a: &TestReplica, b: &TestReplica, now: Timestamp) {
    a.pull_from(b, now);
    b.pull_from(a, now);
}

/// Asserts that both replicas hold identical content for `guid`: attributes,
/// link values (by target and active flag), backlinks, name and deletion
/// state.
pub fn assert_converged(a: &TestReplica, b: &TestReplica, guid: ObjectGuid) {
    let oa = a.get(guid).expect("object on a");
    let ob = b.get(guid).expect("object on b");
    assert_eq!(oa.dn, ob.dn, "names diverge for {guid}");
    assert_eq!(oa.attributes, ob.attributes, "attributes diverge for {guid}");
    assert_eq!(
        oa.deletion_state, ob.deletion_state,
        "deletion state diverges for {guid}"
    );
    assert_eq!(oa.backlinks, ob.backlinks, "backlinks diverge for {guid}");

    let pick = |o: &StoredObject, attr: AttributeId| {
        let mut v: Vec<(ObjectGuid, bool)> = o
            .link_values(attr)
            .iter()
            .map(|l| (l.target, l.active))
            .collect();
        v.sort();
        v
    };
    for attr in oa.links.keys().chain(ob.links.keys()) {
        assert_eq!(pick(&oa, *attr), pick(&ob, *attr), "links diverge for {guid}");
    }
}
