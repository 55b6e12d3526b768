//! Cross-replica convergence of the deletion lifecycle.

use dsrepl_core::{AttributeId, ObjectGuid, Timestamp};
use dsrepl_engine::{AttrChange, DeletionState, Dn, PRESERVED_ATTRIBUTES};
use dsrepl_tests::{assert_converged, sync_both, TestReplica, DESCRIPTION, MEMBER, MEMBER_OF};

fn t(v: u64) -> Timestamp {
    Timestamp::new(v)
}

#[test]
fn a_deletion_replicates_as_a_tombstone() {
    let a = TestReplica::new(1, false);
    let b = TestReplica::new(2, false);
    let guid = ObjectGuid::generate();
    a.engine
        .create_object(
            &Dn::new("CN=O,DC=example"),
            guid,
            vec![(DESCRIPTION, b"v".to_vec())],
            t(10),
        )
        .unwrap();
    sync_both(&a, &b, t(11));

    a.engine.delete_object(guid, t(20)).unwrap();
    b.pull_from(&a, t(30));

    let obj = b.get(guid).unwrap();
    assert_eq!(obj.deletion_state, DeletionState::Tombstone);
    assert!(!obj.attributes.contains_key(&DESCRIPTION));
    assert!(obj.attributes.contains_key(&AttributeId::IS_DELETED));
    assert!(obj.dn.as_str().contains("\nDEL:"));
    // everything left is on the preserved allowlist
    for id in obj.attributes.keys() {
        assert!(PRESERVED_ATTRIBUTES.contains(id), "unexpected survivor {id}");
    }
    assert_converged(&a, &b, guid);
}

#[test]
fn deleting_a_link_target_retracts_links_on_the_peer() {
    let a = TestReplica::new(1, false);
    let b = TestReplica::new(2, false);
    let group = ObjectGuid::generate();
    let user = ObjectGuid::generate();
    a.engine
        .create_object(&Dn::new("CN=G,DC=example"), group, vec![], t(10))
        .unwrap();
    a.engine
        .create_object(&Dn::new("CN=U,DC=example"), user, vec![], t(10))
        .unwrap();
    a.engine
        .modify_object(
            group,
            &[AttrChange::LinkAdd {
                attribute: MEMBER,
                target: user,
                target_name: "CN=U,DC=example".to_string(),
            }],
            t(11),
        )
        .unwrap();
    sync_both(&a, &b, t(12));
    assert!(b
        .get(user)
        .unwrap()
        .backlinks
        .get(&MEMBER_OF)
        .unwrap()
        .contains(&group));

    a.engine.delete_object(user, t(20)).unwrap();
    b.pull_from(&a, t(30));

    let g = b.get(group).unwrap();
    assert!(!g.link_values(MEMBER)[0].active);
    assert!(b.get(user).unwrap().backlinks.is_empty());
    assert_converged(&a, &b, group);
    assert_converged(&a, &b, user);
}

#[test]
fn recycle_bin_first_delete_keeps_attributes_on_both_sides() {
    let a = TestReplica::new(1, true);
    let b = TestReplica::new(2, true);
    let guid = ObjectGuid::generate();
    a.engine
        .create_object(
            &Dn::new("CN=O,DC=example"),
            guid,
            vec![(DESCRIPTION, b"keep".to_vec())],
            t(10),
        )
        .unwrap();
    sync_both(&a, &b, t(11));

    a.engine.delete_object(guid, t(20)).unwrap();
    b.pull_from(&a, t(30));
    let obj = b.get(guid).unwrap();
    assert_eq!(obj.deletion_state, DeletionState::Deleted);
    assert_eq!(obj.attributes.get(&DESCRIPTION).unwrap(), b"keep");

    // second delete recycles and strips everywhere
    a.engine.delete_object(guid, t(40)).unwrap();
    b.pull_from(&a, t(50));
    let obj = b.get(guid).unwrap();
    assert_eq!(obj.deletion_state, DeletionState::Recycled);
    assert!(!obj.attributes.contains_key(&DESCRIPTION));
    assert_converged(&a, &b, guid);
}

#[test]
fn stale_resend_never_resurrects_a_tombstone() {
    let a = TestReplica::new(1, false);
    let b = TestReplica::new(2, false);
    let guid = ObjectGuid::generate();
    a.engine
        .create_object(&Dn::new("CN=O,DC=example"), guid, vec![], t(10))
        .unwrap();
    sync_both(&a, &b, t(11));

    // b deletes; a keeps writing to its still-live copy
    b.engine.delete_object(guid, t(20)).unwrap();
    a.engine
        .modify_object(
            guid,
            &[AttrChange::Put {
                attribute: DESCRIPTION,
                value: b"late".to_vec(),
            }],
            t(15),
        )
        .unwrap();

    sync_both(&a, &b, t(30));
    sync_both(&a, &b, t(31));

    for replica in [&a, &b] {
        let obj = replica.get(guid).unwrap();
        assert_eq!(obj.deletion_state, DeletionState::Tombstone);
    }
}

#[test]
fn purge_is_local_and_privileged() {
    let a = TestReplica::new(1, false);
    let guid = ObjectGuid::generate();
    a.engine
        .create_object(&Dn::new("CN=O,DC=example"), guid, vec![], t(10))
        .unwrap();
    a.engine.delete_object(guid, t(20)).unwrap();

    assert!(a.engine.purge_tombstone(guid, false).is_err());
    a.engine.purge_tombstone(guid, true).unwrap();
    assert!(a.get(guid).is_none());
}
