//! Neighborhood replication handlers: follower registration, incremental
//! shared-profile updates, and unsubscription.
//!
//! Run with: cargo test --test neighborhood_test

use profile_server::crypto::Keypair;
use profile_server::net::conversation::{Conversation, ConversationState};
use profile_server::net::handlers::{dispatch, PostAction};
use profile_server::net::types::Role;
use profile_server::proto::shared_profile_update_item::Change;
use profile_server::proto::{
    request, NeighborhoodSharedProfileUpdateRequest, ProfileRefresh, SharedProfileUpdateItem,
    SignedProfile, StartNeighborhoodInitializationRequest, Status,
    StopNeighborhoodUpdatesRequest,
};
use profile_server::store::records::{ActionData, ActionType, PeerServerRecord};
use profile_server::types::{now, ProfileVersion, ServerId};
use profile_server::{Config, ServerContext};
use std::sync::Arc;
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

/// A conversation that already passed VerifyIdentity on the neighbor role.
fn authenticated_peer(keys: &Keypair) -> Conversation {
    let mut conv = Conversation::new(Role::SrNeighbor, "10.3.3.3:50000".parse().unwrap());
    conv.state = ConversationState::NeighborAuthenticated;
    conv.client_public_key = Some(keys.public.to_vec());
    conv.identity_id = Some(keys.identity_id());
    conv
}

fn known_neighbor(ctx: &Arc<ServerContext>, keys: &Keypair) -> ServerId {
    let id = keys.identity_id();
    ctx.store
        .put_neighbor(&PeerServerRecord {
            network_id: id,
            ip_address: "10.3.3.3".parse().unwrap(),
            primary_port: 16987,
            sr_neighbor_port: 16990,
            initialized: true,
            last_refresh_time: now(),
            location: None,
        })
        .unwrap();
    id
}

fn signed_profile(keys: &Keypair, name: &str) -> SignedProfile {
    let mut record =
        profile_server::store::records::HostedIdentityRecord::reserve(keys.public.to_vec(), now());
    record.version = ProfileVersion(1, 0, 0);
    record.name = name.into();
    record.profile_type = "person".into();
    record.signature = keys.sign(&record.profile_information().canonical_bytes());
    record.signed_profile()
}

fn update_request(
    peer: &Keypair,
    changes: Vec<Change>,
) -> request::Content {
    let mut req = NeighborhoodSharedProfileUpdateRequest {
        items: changes
            .into_iter()
            .map(|change| SharedProfileUpdateItem { change: Some(change) })
            .collect(),
        signature: Vec::new(),
    };
    profile_server::proto::sign_request(peer, &mut req);
    request::Content::NeighborhoodSharedProfileUpdate(req)
}

#[tokio::test]
async fn follower_registration_creates_the_sentinel() {
    let (_dir, ctx, _tx) = test_context();
    let peer = Keypair::generate();
    let mut conv = authenticated_peer(&peer);

    let mut req = StartNeighborhoodInitializationRequest {
        primary_port: 16987,
        sr_neighbor_port: 16990,
        signature: Vec::new(),
    };
    profile_server::proto::sign_request(&peer, &mut req);
    let (response, post) = dispatch(
        &ctx,
        &mut conv,
        &request::Content::StartNeighborhoodInitialization(req),
    )
    .await;

    assert_eq!(response.status(), Status::Ok);
    assert!(matches!(
        post,
        Some(PostAction::StreamInitialization { follower_id }) if follower_id == peer.identity_id()
    ));

    let follower = ctx.store.get_follower(&peer.identity_id()).unwrap().unwrap();
    assert!(!follower.initialized);
    assert_eq!(follower.sr_neighbor_port, 16990);

    let pending = ctx.store.actions_for_target(&peer.identity_id()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, ActionType::InitializationProcessInProgress);

    // A concurrent restart of the initialization is busy
    let mut retry = StartNeighborhoodInitializationRequest {
        primary_port: 16987,
        sr_neighbor_port: 16990,
        signature: Vec::new(),
    };
    profile_server::proto::sign_request(&peer, &mut retry);
    let (response, _) = dispatch(
        &ctx,
        &mut conv,
        &request::Content::StartNeighborhoodInitialization(retry),
    )
    .await;
    assert_eq!(response.status(), Status::ErrorBusy);
}

#[tokio::test]
async fn shared_updates_require_a_known_neighbor() {
    let (_dir, ctx, _tx) = test_context();
    let peer = Keypair::generate();
    let mut conv = authenticated_peer(&peer);

    let identity = Keypair::generate();
    let content = update_request(&peer, vec![Change::Add(signed_profile(&identity, "alice"))]);
    let (response, _) = dispatch(&ctx, &mut conv, &content).await;
    assert_eq!(response.status(), Status::ErrorRejected);
}

#[tokio::test]
async fn shared_updates_mutate_the_mirror() {
    let (_dir, ctx, _tx) = test_context();
    let peer = Keypair::generate();
    let neighbor = known_neighbor(&ctx, &peer);
    let mut conv = authenticated_peer(&peer);

    let alice = Keypair::generate();
    let bob = Keypair::generate();

    let content = update_request(
        &peer,
        vec![
            Change::Add(signed_profile(&alice, "alice")),
            Change::Add(signed_profile(&bob, "bob")),
        ],
    );
    let (response, _) = dispatch(&ctx, &mut conv, &content).await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(ctx.store.count_neighbor_profiles(&neighbor), 2);

    let content = update_request(
        &peer,
        vec![
            Change::Change(signed_profile(&alice, "alice-renamed")),
            Change::Remove(bob.identity_id().to_vec()),
        ],
    );
    let (response, _) = dispatch(&ctx, &mut conv, &content).await;
    assert_eq!(response.status(), Status::Ok);

    let mirrored =
        ctx.store.get_neighbor_profile(&neighbor, &alice.identity_id()).unwrap().unwrap();
    assert_eq!(mirrored.name, "alice-renamed");
    assert!(ctx.store.get_neighbor_profile(&neighbor, &bob.identity_id()).unwrap().is_none());

    // Refresh with only alice keeps the mirror aligned and bumps liveness
    let content = update_request(
        &peer,
        vec![Change::Refresh(ProfileRefresh {
            identity_ids: vec![alice.identity_id().to_vec()],
        })],
    );
    let (response, _) = dispatch(&ctx, &mut conv, &content).await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(ctx.store.count_neighbor_profiles(&neighbor), 1);
}

#[tokio::test]
async fn tampered_shared_profile_aborts_the_update() {
    let (_dir, ctx, _tx) = test_context();
    let peer = Keypair::generate();
    let neighbor = known_neighbor(&ctx, &peer);
    let mut conv = authenticated_peer(&peer);

    let identity = Keypair::generate();
    let mut profile = signed_profile(&identity, "alice");
    profile.profile.as_mut().unwrap().name = "mallory".into();

    let content = update_request(&peer, vec![Change::Add(profile)]);
    let (response, _) = dispatch(&ctx, &mut conv, &content).await;
    assert_eq!(response.status(), Status::ErrorInvalidSignature);
    assert_eq!(ctx.store.count_neighbor_profiles(&neighbor), 0);
}

#[tokio::test]
async fn stop_notice_unregisters_the_follower() {
    let (_dir, ctx, _tx) = test_context();
    let peer = Keypair::generate();
    ctx.store
        .put_follower(&PeerServerRecord {
            network_id: peer.identity_id(),
            ip_address: "10.3.3.4".parse().unwrap(),
            primary_port: 16987,
            sr_neighbor_port: 16990,
            initialized: true,
            last_refresh_time: now(),
            location: None,
        })
        .unwrap();
    let pending = ctx
        .store
        .make_action(
            peer.identity_id(),
            &ActionData::RefreshProfiles { identity_ids: vec![] },
            None,
            None,
        )
        .unwrap();
    ctx.store.enqueue_action(&pending).unwrap();

    let mut conv = authenticated_peer(&peer);
    let mut req = StopNeighborhoodUpdatesRequest { signature: Vec::new() };
    profile_server::proto::sign_request(&peer, &mut req);
    let (response, _) =
        dispatch(&ctx, &mut conv, &request::Content::StopNeighborhoodUpdates(req)).await;

    assert_eq!(response.status(), Status::Ok);
    assert!(ctx.store.get_follower(&peer.identity_id()).unwrap().is_none());
    assert!(ctx.store.actions_for_target(&peer.identity_id()).unwrap().is_empty());
}
