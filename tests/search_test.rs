//! Combined local + neighbor search behavior.
//!
//! Run with: cargo test --test search_test

use profile_server::crypto::Keypair;
use profile_server::proto::ProfileSearchRequest;
use profile_server::search::{SearchQuery, MAX_RESPONSE_RECORDS};
use profile_server::store::records::{NeighborIdentityRecord, PeerServerRecord};
use profile_server::types::{now, GpsLocation, ProfileVersion, ServerId};
use profile_server::{Config, ServerContext};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

fn test_context() -> (tempfile::TempDir, Arc<ServerContext>, watch::Sender<bool>) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        image_data_folder: dir.path().join("images"),
        temp_data_folder: dir.path().join("tmp"),
        ..Config::default()
    };
    let (tx, rx) = watch::channel(false);
    let ctx = ServerContext::build(config, rx).unwrap();
    (dir, ctx, tx)
}

async fn host_profile(ctx: &Arc<ServerContext>, name: &str, profile_type: &str) -> Keypair {
    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    let profile = profile_server::proto::ProfileInformation {
        version: vec![1, 0, 0],
        public_key: keys.public.to_vec(),
        profile_type: profile_type.into(),
        name: name.into(),
        extra_data: String::new(),
        latitude: 0,
        longitude: 0,
        profile_image_hash: Vec::new(),
        thumbnail_image_hash: Vec::new(),
    };
    let update = profile_server::proto::UpdateProfileRequest {
        version: Some(vec![1, 0, 0]),
        name: Some(name.into()),
        profile_type: Some(profile_type.into()),
        latitude: Some(0),
        longitude: Some(0),
        profile_signature: keys.sign(&profile.canonical_bytes()),
        ..Default::default()
    };
    ctx.hosting.update_profile(id, &update).await.unwrap();
    keys
}

fn mirror_profile(ctx: &Arc<ServerContext>, server_id: ServerId, name: &str) {
    let keys = Keypair::generate();
    let mut record =
        profile_server::store::records::HostedIdentityRecord::reserve(keys.public.to_vec(), now());
    record.version = ProfileVersion(1, 0, 0);
    record.name = name.into();
    record.profile_type = "person".into();
    record.location = GpsLocation { latitude: 0, longitude: 0 };
    record.signature = keys.sign(&record.profile_information().canonical_bytes());

    let mirrored =
        NeighborIdentityRecord::from_signed_profile(server_id, &record.signed_profile()).unwrap();
    ctx.store.upsert_neighbor_profile(&mirrored).unwrap();
}

fn live_neighbor(ctx: &Arc<ServerContext>, seed: u8) -> ServerId {
    let id = [seed; 32];
    ctx.store
        .put_neighbor(&PeerServerRecord {
            network_id: id,
            ip_address: "10.2.2.2".parse().unwrap(),
            primary_port: 16987,
            sr_neighbor_port: 16990,
            initialized: true,
            last_refresh_time: now(),
            location: Some(GpsLocation { latitude: 0, longitude: 0 }),
        })
        .unwrap();
    id
}

fn request(name: &str, hosted_only: bool) -> ProfileSearchRequest {
    ProfileSearchRequest {
        include_hosted_only: hosted_only,
        name: name.into(),
        max_response_record_count: 10,
        max_total_record_count: 100,
        ..Default::default()
    }
}

#[tokio::test]
async fn search_spans_hosted_and_neighbor_profiles() {
    let (_dir, ctx, _tx) = test_context();
    host_profile(&ctx, "alice-local", "person").await;

    let neighbor = live_neighbor(&ctx, 7);
    mirror_profile(&ctx, neighbor, "alice-remote");

    let query = SearchQuery::parse(&request("^alice", false)).unwrap();
    let outcome = ctx.search.search(&query).unwrap();
    assert_eq!(outcome.records.len(), 2);

    let remote = outcome
        .records
        .iter()
        .find(|r| !r.hosting_server_id.is_empty())
        .expect("a mirrored record");
    assert_eq!(remote.hosting_server_id, neighbor.to_vec());

    // Hosted-only drops the mirror
    let query = SearchQuery::parse(&request("^alice", true)).unwrap();
    let outcome = ctx.search.search(&query).unwrap();
    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.records[0].hosting_server_id.is_empty());
}

#[tokio::test]
async fn profiles_of_expired_neighbors_are_invisible() {
    let (_dir, ctx, _tx) = test_context();
    let neighbor = [3u8; 32];
    ctx.store
        .put_neighbor(&PeerServerRecord {
            network_id: neighbor,
            ip_address: "10.2.2.3".parse().unwrap(),
            primary_port: 16987,
            sr_neighbor_port: 16990,
            initialized: true,
            // Far past the expiration window
            last_refresh_time: 1,
            location: None,
        })
        .unwrap();
    mirror_profile(&ctx, neighbor, "ghost");

    let query = SearchQuery::parse(&request("ghost", false)).unwrap();
    assert!(ctx.search.search(&query).unwrap().records.is_empty());
}

#[tokio::test]
async fn uninitialized_and_cancelled_profiles_are_invisible() {
    let (_dir, ctx, _tx) = test_context();
    let visible = host_profile(&ctx, "seen", "person").await;

    // Reserved but never initialized
    let reserved = Keypair::generate();
    ctx.hosting.register(&reserved.public).await.unwrap();

    // Initialized, then cancelled
    let cancelled = host_profile(&ctx, "gone", "person").await;
    ctx.hosting.cancel_hosting(cancelled.identity_id(), None).await.unwrap();

    let query = SearchQuery::parse(&request("", true)).unwrap();
    let outcome = ctx.search.search(&query).unwrap();
    assert_eq!(outcome.records.len(), 1);
    let profile = outcome.records[0].signed_profile.as_ref().unwrap().profile.as_ref().unwrap();
    assert_eq!(profile.public_key, visible.public.to_vec());
}

#[tokio::test]
async fn pathological_regex_stays_within_the_budget() {
    let (_dir, ctx, _tx) = test_context();
    for i in 0..10 {
        host_profile(&ctx, &format!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa{i}"), "person").await;
    }

    // Classic catastrophic-backtracking shape; the engine is linear-time and
    // the aggregate budget bounds the scan either way.
    let started = Instant::now();
    let query = SearchQuery::parse(&request("(a+)+$", false)).unwrap();
    let outcome = ctx.search.search(&query).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_millis(1200));
    // Partial results are acceptable, hanging is not
    assert!(outcome.records.len() <= 10);
}

#[tokio::test]
async fn response_page_caps_are_enforced() {
    let mut req = request("", true);
    req.max_response_record_count = MAX_RESPONSE_RECORDS + 1;
    assert!(SearchQuery::parse(&req).is_err());

    let mut req = request("", true);
    req.max_total_record_count = 0;
    assert!(SearchQuery::parse(&req).is_err());
}
