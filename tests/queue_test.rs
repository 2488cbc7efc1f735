//! Action queue laws: per-target FIFO, sentinel isolation, and replay
//! independence of the snapshot payloads.
//!
//! Run with: cargo test --test queue_test

use profile_server::queue::{backoff_delay, follower_queue_suspended};
use profile_server::store::records::{
    ActionData, ActionType, HostedIdentityRecord, NeighborIdentityRecord, ProfileSnapshot,
};
use profile_server::store::Store;
use profile_server::types::{now, IdentityId, ProfileVersion, ServerId};
use profile_server::Keypair;
use std::collections::HashMap;

fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("db")).unwrap();
    (dir, store)
}

fn hosted(keys: &Keypair, name: &str) -> HostedIdentityRecord {
    let mut record = HostedIdentityRecord::reserve(keys.public.to_vec(), now());
    record.version = ProfileVersion(1, 0, 0);
    record.name = name.into();
    record.profile_type = "person".into();
    record.initialized = true;
    record.signature = keys.sign(&record.profile_information().canonical_bytes());
    record
}

#[test]
fn queues_are_fifo_per_target_even_interleaved() {
    let (_dir, store) = open_store();
    let target_a: ServerId = [1u8; 32];
    let target_b: ServerId = [2u8; 32];

    let mut expected_a = Vec::new();
    let mut expected_b = Vec::new();
    for i in 0..6 {
        let target = if i % 2 == 0 { target_a } else { target_b };
        let action = store
            .make_action(target, &ActionData::RefreshProfiles { identity_ids: vec![] }, None, None)
            .unwrap();
        if i % 2 == 0 {
            expected_a.push(action.id);
        } else {
            expected_b.push(action.id);
        }
        store.enqueue_action(&action).unwrap();
    }

    let scanned_a: Vec<u64> =
        store.actions_for_target(&target_a).unwrap().iter().map(|a| a.id).collect();
    let scanned_b: Vec<u64> =
        store.actions_for_target(&target_b).unwrap().iter().map(|a| a.id).collect();
    assert_eq!(scanned_a, expected_a);
    assert_eq!(scanned_b, expected_b);

    // Ids are strictly increasing within each queue
    assert!(scanned_a.windows(2).all(|w| w[0] < w[1]));
    assert!(scanned_b.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn sentinel_suspends_the_follower_queue() {
    let (_dir, store) = open_store();
    let target: ServerId = [5u8; 32];

    let sentinel = store
        .make_action(target, &ActionData::InitializationProcessInProgress {}, None, None)
        .unwrap();
    store.enqueue_action(&sentinel).unwrap();

    let keys = Keypair::generate();
    let profile = ProfileSnapshot::of(&hosted(&keys, "alice"));
    let add = store
        .make_action(target, &ActionData::AddProfile { profile }, None, None)
        .unwrap();
    store.enqueue_action(&add).unwrap();

    let queue = store.actions_for_target(&target).unwrap();
    assert!(follower_queue_suspended(&queue));

    // Completing the initialization lifts the sentinel
    store.delete_action(&sentinel).unwrap();
    let queue = store.actions_for_target(&target).unwrap();
    assert!(!follower_queue_suspended(&queue));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].action_type, ActionType::AddProfile);
}

#[test]
fn backoff_schedule_gates_eligibility() {
    let (_dir, store) = open_store();
    let target: ServerId = [6u8; 32];

    let mut action = store
        .make_action(target, &ActionData::RemoveNeighbor {}, None, None)
        .unwrap();
    store.enqueue_action(&action).unwrap();
    assert!(action.is_eligible(now()));

    action.attempts = 1;
    action.execute_after = Some(now() + backoff_delay(action.attempts));
    store.update_action(&action).unwrap();

    let head = &store.actions_for_target(&target).unwrap()[0];
    assert!(!head.is_eligible(now()));
    assert!(head.is_eligible(now() + backoff_delay(1) + 1));
}

/// Replaying the snapshots against a fresh mirror converges to the same
/// state as direct application, regardless of later source mutations.
#[test]
fn snapshots_replay_independently_of_source_state() {
    let source: ServerId = [9u8; 32];

    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let carol = Keypair::generate();

    let alice_v1 = hosted(&alice, "alice");
    let mut alice_v2 = hosted(&alice, "alice-renamed");
    alice_v2.version = ProfileVersion(1, 1, 0);
    alice_v2.signature =
        alice.sign(&alice_v2.profile_information().canonical_bytes());
    let bob_v1 = hosted(&bob, "bob");
    let carol_v1 = hosted(&carol, "carol");

    // The action log as the source produced it
    let log = vec![
        ActionData::AddProfile { profile: ProfileSnapshot::of(&alice_v1) },
        ActionData::AddProfile { profile: ProfileSnapshot::of(&bob_v1) },
        ActionData::ChangeProfile { profile: ProfileSnapshot::of(&alice_v2) },
        ActionData::AddProfile { profile: ProfileSnapshot::of(&carol_v1) },
        ActionData::RemoveProfile { identity_id: bob.identity_id() },
    ];

    // Serialize through the wire the worker uses (tagged JSON), then replay
    // against a fresh follower store
    let (_dir, follower) = open_store();
    for data in &log {
        let json = serde_json::to_string(data).unwrap();
        let replayed: ActionData = serde_json::from_str(&json).unwrap();
        match replayed {
            ActionData::AddProfile { profile } | ActionData::ChangeProfile { profile } => {
                let record =
                    NeighborIdentityRecord::from_signed_profile(source, &profile.signed_profile())
                        .unwrap();
                follower.upsert_neighbor_profile(&record).unwrap();
            }
            ActionData::RemoveProfile { identity_id } => {
                follower.remove_neighbor_profile(&source, &identity_id).unwrap();
            }
            other => panic!("unexpected action in log: {other:?}"),
        }
    }

    let mirror: HashMap<IdentityId, NeighborIdentityRecord> = follower
        .neighbor_profiles_for(&source)
        .map(|r| {
            let r = r.unwrap();
            (r.identity_id, r)
        })
        .collect();

    assert_eq!(mirror.len(), 2);
    assert_eq!(mirror[&alice.identity_id()].name, "alice-renamed");
    assert_eq!(mirror[&alice.identity_id()].version, ProfileVersion(1, 1, 0));
    assert_eq!(mirror[&carol.identity_id()].name, "carol");
    assert!(!mirror.contains_key(&bob.identity_id()));
}

#[test]
fn refresh_snapshot_prunes_unlisted_profiles() {
    let (_dir, store) = open_store();
    let source: ServerId = [8u8; 32];

    let keep = Keypair::generate();
    let stale = Keypair::generate();
    for (keys, name) in [(&keep, "keep"), (&stale, "stale")] {
        let record = NeighborIdentityRecord::from_signed_profile(
            source,
            &hosted(keys, name).signed_profile(),
        )
        .unwrap();
        store.upsert_neighbor_profile(&record).unwrap();
    }

    let data = ActionData::RefreshProfiles { identity_ids: vec![keep.identity_id()] };
    let json = serde_json::to_string(&data).unwrap();
    let ActionData::RefreshProfiles { identity_ids } =
        serde_json::from_str::<ActionData>(&json).unwrap()
    else {
        panic!("wrong action kind");
    };

    let keep_set = identity_ids.into_iter().collect();
    let dropped = store.retain_neighbor_profiles(&source, &keep_set).unwrap();
    assert_eq!(dropped, 1);
    assert!(store.get_neighbor_profile(&source, &keep.identity_id()).unwrap().is_some());
    assert!(store.get_neighbor_profile(&source, &stale.identity_id()).unwrap().is_none());
}
