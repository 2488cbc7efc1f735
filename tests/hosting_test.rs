//! Hosted-identity lifecycle: capacity, signed updates, cancellation, and
//! the follower actions every mutation must leave behind.
//!
//! Run with: cargo test --test hosting_test

use profile_server::crypto::Keypair;
use profile_server::maintenance;
use profile_server::proto::{ProfileInformation, UpdateProfileRequest};
use profile_server::store::records::{ActionType, PeerServerRecord};
use profile_server::types::now;
use profile_server::{Config, ServerContext, ServerError};
use std::sync::Arc;
use tokio::sync::watch;

fn test_context(config: Config) -> (tempfile::TempDir, Arc<ServerContext>, watch::Sender<bool>) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        image_data_folder: dir.path().join("images"),
        temp_data_folder: dir.path().join("tmp"),
        ..config
    };
    let (tx, rx) = watch::channel(false);
    let ctx = ServerContext::build(config, rx).unwrap();
    (dir, ctx, tx)
}

fn profile_for(keys: &Keypair, name: &str) -> ProfileInformation {
    ProfileInformation {
        version: vec![1, 0, 0],
        public_key: keys.public.to_vec(),
        profile_type: "person".into(),
        name: name.into(),
        extra_data: String::new(),
        latitude: 48_210_000,
        longitude: 16_370_000,
        profile_image_hash: Vec::new(),
        thumbnail_image_hash: Vec::new(),
    }
}

fn update_for(keys: &Keypair, name: &str) -> UpdateProfileRequest {
    let profile = profile_for(keys, name);
    UpdateProfileRequest {
        version: Some(vec![1, 0, 0]),
        name: Some(name.into()),
        profile_type: Some("person".into()),
        latitude: Some(profile.latitude),
        longitude: Some(profile.longitude),
        profile_signature: keys.sign(&profile.canonical_bytes()),
        ..Default::default()
    }
}

fn follower(seed: u8) -> PeerServerRecord {
    PeerServerRecord {
        network_id: [seed; 32],
        ip_address: "10.1.1.1".parse().unwrap(),
        primary_port: 16987,
        sr_neighbor_port: 16990,
        initialized: true,
        last_refresh_time: now(),
        location: None,
    }
}

#[tokio::test]
async fn hosting_cap_with_cancellation_and_reap() {
    let (_dir, ctx, _tx) = test_context(Config {
        max_hosted_identities: 1,
        cancellation_retention_secs: 0,
        ..Config::default()
    });
    let a = Keypair::generate();
    let b = Keypair::generate();

    ctx.hosting.register(&a.public).await.unwrap();
    assert!(matches!(
        ctx.hosting.register(&b.public).await,
        Err(ServerError::QuotaExceeded)
    ));

    ctx.hosting.cancel_hosting(a.identity_id(), None).await.unwrap();

    // Retention of zero makes the cancelled row immediately reapable
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let reaped = maintenance::reap_cancelled_hostings(&ctx).unwrap();
    assert_eq!(reaped, 1);
    assert!(ctx.store.get_hosted(&a.identity_id()).unwrap().is_none());

    ctx.hosting.register(&b.public).await.unwrap();
    assert_eq!(ctx.store.hosted_active_count().unwrap(), 1);
}

#[tokio::test]
async fn signed_update_changes_the_profile() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    ctx.hosting.update_profile(id, &update_for(&keys, "alice")).await.unwrap();
    ctx.hosting.update_profile(id, &update_for(&keys, "bob")).await.unwrap();

    let record = ctx.store.get_hosted(&id).unwrap().unwrap();
    assert_eq!(record.name, "bob");

    // The stored signature verifies over the canonical encoding
    let profile = record.profile_information();
    profile_server::crypto::verify(&keys.public, &profile.canonical_bytes(), &record.signature)
        .unwrap();
}

#[tokio::test]
async fn tampered_update_leaves_stored_profile_untouched() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();
    ctx.hosting.update_profile(id, &update_for(&keys, "alice")).await.unwrap();

    let mut update = update_for(&keys, "bob");
    update.profile_signature[0] ^= 0x80;
    assert!(matches!(
        ctx.hosting.update_profile(id, &update).await,
        Err(ServerError::InvalidSignature)
    ));
    assert_eq!(ctx.store.get_hosted(&id).unwrap().unwrap().name, "alice");
}

#[tokio::test]
async fn mutations_enqueue_follower_actions_in_order() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let target = follower(9);
    ctx.store.put_follower(&target).unwrap();

    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    ctx.hosting.update_profile(id, &update_for(&keys, "alice")).await.unwrap();
    ctx.hosting.update_profile(id, &update_for(&keys, "bob")).await.unwrap();
    ctx.hosting.cancel_hosting(id, None).await.unwrap();

    let kinds: Vec<ActionType> = ctx
        .store
        .actions_for_target(&target.network_id)
        .unwrap()
        .iter()
        .map(|a| a.action_type)
        .collect();
    assert_eq!(
        kinds,
        vec![ActionType::AddProfile, ActionType::ChangeProfile, ActionType::RemoveProfile]
    );
}

#[tokio::test]
async fn no_propagation_suppresses_follower_actions() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let target = follower(4);
    ctx.store.put_follower(&target).unwrap();

    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    let mut update = update_for(&keys, "quiet");
    update.no_propagation = true;
    ctx.hosting.update_profile(id, &update).await.unwrap();

    assert!(ctx.store.actions_for_target(&target.network_id).unwrap().is_empty());
}

#[tokio::test]
async fn uninitialized_followers_get_no_actions() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let mut target = follower(2);
    target.initialized = false;
    ctx.store.put_follower(&target).unwrap();

    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();
    ctx.hosting.update_profile(id, &update_for(&keys, "alice")).await.unwrap();

    assert!(ctx.store.actions_for_target(&target.network_id).unwrap().is_empty());
}

#[tokio::test]
async fn image_upload_is_staged_and_committed() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    let image = b"thumbnail bytes".to_vec();
    let hash = profile_server::sha256(&image);

    let mut profile = profile_for(&keys, "alice");
    profile.thumbnail_image_hash = hash.to_vec();

    let update = UpdateProfileRequest {
        version: Some(vec![1, 0, 0]),
        name: Some("alice".into()),
        profile_type: Some("person".into()),
        latitude: Some(profile.latitude),
        longitude: Some(profile.longitude),
        thumbnail_image: Some(image.clone()),
        thumbnail_image_hash: Some(hash.to_vec()),
        profile_signature: keys.sign(&profile.canonical_bytes()),
        ..Default::default()
    };
    ctx.hosting.update_profile(id, &update).await.unwrap();

    assert_eq!(ctx.images.get(&hash).unwrap().unwrap(), image);
    let record = ctx.store.get_hosted(&id).unwrap().unwrap();
    assert_eq!(record.thumbnail_image_hash, Some(hash));
}

#[tokio::test]
async fn declared_hash_mismatch_rejects_the_update() {
    let (_dir, ctx, _tx) = test_context(Config::default());
    let keys = Keypair::generate();
    let id = ctx.hosting.register(&keys.public).await.unwrap();

    let image = b"thumbnail bytes".to_vec();
    let wrong_hash = profile_server::sha256(b"other bytes");

    let mut update = update_for(&keys, "alice");
    update.thumbnail_image = Some(image);
    update.thumbnail_image_hash = Some(wrong_hash.to_vec());

    assert!(matches!(
        ctx.hosting.update_profile(id, &update).await,
        Err(ServerError::InvalidValue(_))
    ));
    assert!(!ctx.images.contains(&wrong_hash));
}
