//! Conversation authentication flows exercised through the dispatch layer.
//!
//! Run with: cargo test --test conversation_test

use profile_server::crypto::Keypair;
use profile_server::net::conversation::{Conversation, ConversationState, CHALLENGE_SIZE};
use profile_server::net::handlers::dispatch;
use profile_server::net::types::Role;
use profile_server::proto::{
    request, response, CheckInRequest, HostingAgreementRequest, Response, Status,
    StartConversationRequest, VerifyIdentityRequest,
};
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

fn conversation(role: Role) -> Conversation {
    Conversation::new(role, "127.0.0.1:40000".parse().unwrap())
}

/// Run a request through the same matrix check + dispatch the server loop
/// performs.
async fn send(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    content: request::Content,
) -> Response {
    match conv.request_allowed(&content) {
        Err(e) => Response::error(e.status(), e.public_details()),
        Ok(()) => dispatch(ctx, conv, &content).await.0,
    }
}

/// StartConversation and return the server challenge.
async fn start(ctx: &Arc<ServerContext>, conv: &mut Conversation, keys: &Keypair) -> Vec<u8> {
    let response = send(
        ctx,
        conv,
        request::Content::StartConversation(StartConversationRequest {
            public_key: keys.public.to_vec(),
            client_challenge: vec![7u8; CHALLENGE_SIZE],
        }),
    )
    .await;
    assert_eq!(response.status(), Status::Ok);
    match response.content {
        Some(response::Content::StartConversation(sc)) => sc.server_challenge,
        _ => panic!("unexpected response content"),
    }
}

async fn verify(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    keys: &Keypair,
    challenge: Vec<u8>,
) -> Response {
    let mut req = VerifyIdentityRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(keys, &mut req);
    send(ctx, conv, request::Content::VerifyIdentity(req)).await
}

#[tokio::test]
async fn non_customer_flow_reaches_hosting_agreement() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    let mut conv = conversation(Role::ClientNonCustomer);

    // HostingAgreement before authentication is a state error
    let early = send(
        &ctx,
        &mut conv,
        request::Content::HostingAgreement(HostingAgreementRequest::default()),
    )
    .await;
    assert_eq!(early.status(), Status::ErrorBadConversationState);

    let challenge = start(&ctx, &mut conv, &keys).await;
    let verified = verify(&ctx, &mut conv, &keys, challenge).await;
    assert_eq!(verified.status(), Status::Ok);
    assert_eq!(conv.state, ConversationState::AuthenticatedNonCustomer);

    let mut agreement = HostingAgreementRequest::default();
    profile_server::proto::sign_request(&keys, &mut agreement);
    let registered =
        send(&ctx, &mut conv, request::Content::HostingAgreement(agreement)).await;
    assert_eq!(registered.status(), Status::Ok);
    assert!(ctx.store.get_hosted(&keys.identity_id()).unwrap().is_some());
}

#[tokio::test]
async fn tampered_verify_signature_is_rejected() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    let mut conv = conversation(Role::ClientNonCustomer);

    let challenge = start(&ctx, &mut conv, &keys).await;
    let mut req = VerifyIdentityRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(&keys, &mut req);
    req.signature[3] ^= 0x01;

    let response = send(&ctx, &mut conv, request::Content::VerifyIdentity(req)).await;
    assert_eq!(response.status(), Status::ErrorInvalidSignature);
    assert_eq!(conv.state, ConversationState::Started);
}

#[tokio::test]
async fn challenge_echo_must_match() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    let mut conv = conversation(Role::ClientNonCustomer);

    let _challenge = start(&ctx, &mut conv, &keys).await;
    let response =
        verify(&ctx, &mut conv, &keys, vec![0u8; CHALLENGE_SIZE]).await;
    assert_eq!(response.status(), Status::ErrorInvalidValue);
}

#[tokio::test]
async fn check_in_requires_a_hosted_identity() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    let mut conv = conversation(Role::ClientCustomer);

    let challenge = start(&ctx, &mut conv, &keys).await;
    let mut req = CheckInRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(&keys, &mut req);
    let response = send(&ctx, &mut conv, request::Content::CheckIn(req)).await;
    assert_eq!(response.status(), Status::ErrorNotFound);
}

#[tokio::test]
async fn second_check_in_evicts_the_first_connection() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    ctx.hosting.register(&keys.public).await.unwrap();

    let mut first = conversation(Role::ClientCustomer);
    let challenge = start(&ctx, &mut first, &keys).await;
    let mut req = CheckInRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(&keys, &mut req);
    let response = send(&ctx, &mut first, request::Content::CheckIn(req)).await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(first.state, ConversationState::AuthenticatedCustomer);
    assert!(!first.was_evicted());

    let mut second = conversation(Role::ClientCustomer);
    let challenge = start(&ctx, &mut second, &keys).await;
    let mut req = CheckInRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(&keys, &mut req);
    let response = send(&ctx, &mut second, request::Content::CheckIn(req)).await;
    assert_eq!(response.status(), Status::Ok);

    // The first connection is now evicted; the server loop answers its next
    // request with ErrorBadConversationState and closes the socket.
    assert!(first.was_evicted());
    assert!(!second.was_evicted());
}

#[tokio::test]
async fn customer_requests_rejected_on_non_customer_role() {
    let (_dir, ctx, _tx) = test_context();
    let keys = Keypair::generate();
    let mut conv = conversation(Role::ClientNonCustomer);

    let challenge = start(&ctx, &mut conv, &keys).await;
    let mut req = CheckInRequest { challenge, signature: Vec::new() };
    profile_server::proto::sign_request(&keys, &mut req);
    let response = send(&ctx, &mut conv, request::Content::CheckIn(req)).await;
    assert_eq!(response.status(), Status::ErrorBadRole);
}
