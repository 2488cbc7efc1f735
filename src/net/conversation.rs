//! Per-connection conversation state.
//!
//! ```text
//! State Transitions (client roles):
//!
//! ┌───────┐ StartConversation ┌─────────┐ VerifyIdentity  ┌──────────────────────────┐
//! │ Fresh │──────────────────►│ Started │────────────────►│ AuthenticatedNonCustomer │
//! └───────┘                   └────┬────┘  (non-customer) └──────────────────────────┘
//!                                  │
//!                                  │ CheckIn (customer role, hosted identity)
//!                                  ▼
//!                      ┌────────────────────────┐
//!                      │ AuthenticatedCustomer  │  (single live connection per identity)
//!                      └────────────────────────┘
//!
//! On the SrNeighbor role, VerifyIdentity leads to NeighborAuthenticated
//! instead, which gates the replication requests.
//! ```
//!
//! Every request is checked against a fixed request→state/role matrix before
//! dispatch: a request that can never appear on the connection's role
//! answers `ErrorBadRole`, a request sent in the wrong state answers
//! `ErrorBadConversationState`, and an empty request body answers
//! `ErrorUnsupported`.

use crate::crypto::{self, Keypair};
use crate::error::{ServerError, ServerResult};
use crate::net::types::Role;
use crate::proto::{request, StartConversationRequest, StartConversationResponse};
use crate::search::SearchCache;
use crate::types::IdentityId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Challenge length exchanged at conversation start.
pub const CHALLENGE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Fresh,
    Started,
    AuthenticatedNonCustomer,
    AuthenticatedCustomer,
    NeighborAuthenticated,
}

pub struct Conversation {
    pub role: Role,
    pub state: ConversationState,
    pub peer_addr: SocketAddr,
    pub client_public_key: Option<Vec<u8>>,
    pub identity_id: Option<IdentityId>,
    server_challenge: Option<[u8; CHALLENGE_SIZE]>,
    pub search_cache: Option<SearchCache>,
    /// Set by the registry when a newer CheckIn takes over this identity.
    pub evicted: Arc<AtomicBool>,
    /// Registration ticket held while checked in as a customer.
    pub customer_seq: Option<u64>,
}

impl Conversation {
    pub fn new(role: Role, peer_addr: SocketAddr) -> Self {
        Self {
            role,
            state: ConversationState::Fresh,
            peer_addr,
            client_public_key: None,
            identity_id: None,
            server_challenge: None,
            search_cache: None,
            evicted: Arc::new(AtomicBool::new(false)),
            customer_seq: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            ConversationState::AuthenticatedNonCustomer
                | ConversationState::AuthenticatedCustomer
                | ConversationState::NeighborAuthenticated
        )
    }

    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Fixed request→state/role matrix.
    pub fn request_allowed(&self, content: &request::Content) -> ServerResult<()> {
        use request::Content as C;
        use ConversationState as S;

        // Allowed on every role in every state.
        if matches!(content, C::Ping(_) | C::ListRoles(_)) {
            return Ok(());
        }

        let state = self.state;
        match self.role {
            // The primary role serves only the service listing.
            Role::Primary => Err(ServerError::BadRole),

            Role::ClientNonCustomer | Role::ClientCustomer => match content {
                // Public queries need no conversation.
                C::GetIdentityInformation(_)
                | C::ProfileSearch(_)
                | C::ProfileSearchPart(_)
                | C::GetIdentityRelationships(_) => Ok(()),

                C::StartConversation(_) => in_state(state == S::Fresh),
                C::VerifyIdentity(_) => {
                    if self.role != Role::ClientNonCustomer {
                        return Err(ServerError::BadRole);
                    }
                    in_state(state == S::Started)
                }
                C::CheckIn(_) => {
                    if self.role != Role::ClientCustomer {
                        return Err(ServerError::BadRole);
                    }
                    in_state(state == S::Started)
                }
                C::HostingAgreement(_) => {
                    if self.role != Role::ClientNonCustomer {
                        return Err(ServerError::BadRole);
                    }
                    in_state(state == S::AuthenticatedNonCustomer)
                }
                C::UpdateProfile(_)
                | C::CancelHosting(_)
                | C::GetProfileInformation(_)
                | C::AddRelatedIdentity(_)
                | C::RemoveRelatedIdentity(_) => {
                    if self.role != Role::ClientCustomer {
                        return Err(ServerError::BadRole);
                    }
                    in_state(state == S::AuthenticatedCustomer)
                }
                C::StartNeighborhoodInitialization(_)
                | C::FinishNeighborhoodInitialization(_)
                | C::NeighborhoodSharedProfileUpdate(_)
                | C::StopNeighborhoodUpdates(_) => Err(ServerError::BadRole),
                C::Ping(_) | C::ListRoles(_) => unreachable!(),
            },

            Role::SrNeighbor => match content {
                C::StartConversation(_) => in_state(state == S::Fresh),
                C::VerifyIdentity(_) => in_state(state == S::Started),
                C::StartNeighborhoodInitialization(_)
                | C::NeighborhoodSharedProfileUpdate(_)
                | C::StopNeighborhoodUpdates(_) => in_state(state == S::NeighborAuthenticated),
                // Finish flows only server→initiator during initialization.
                C::FinishNeighborhoodInitialization(_) => Err(ServerError::BadConversationState),
                _ => Err(ServerError::BadRole),
            },
        }
    }

    /// Handle StartConversation: record the peer key, mint the server
    /// challenge, and prove the server key by signing the client challenge.
    pub fn start(
        &mut self,
        req: &StartConversationRequest,
        server_keys: &Keypair,
    ) -> ServerResult<StartConversationResponse> {
        if req.public_key.len() != crypto::PUBLIC_KEY_SIZE {
            return Err(ServerError::invalid_value("public key must be 32 bytes"));
        }
        if req.client_challenge.len() != CHALLENGE_SIZE {
            return Err(ServerError::invalid_value("challenge must be 32 bytes"));
        }

        let server_challenge: [u8; CHALLENGE_SIZE] = rand::random();
        let identity_id = crypto::identity_id(&req.public_key);
        self.client_public_key = Some(req.public_key.clone());
        self.identity_id = Some(identity_id);
        self.server_challenge = Some(server_challenge);
        self.state = ConversationState::Started;

        debug!(
            "Conversation started with {} (identity {})",
            self.peer_addr,
            hex::encode(&identity_id[..8])
        );

        Ok(StartConversationResponse {
            public_key: server_keys.public.to_vec(),
            server_challenge: server_challenge.to_vec(),
            client_challenge_signature: server_keys.sign(&req.client_challenge),
        })
    }

    /// Check the echoed server challenge of VerifyIdentity/CheckIn.
    pub fn check_challenge(&self, challenge: &[u8]) -> ServerResult<()> {
        let expected = self.server_challenge.ok_or(ServerError::BadConversationState)?;
        if challenge != expected.as_slice() {
            return Err(ServerError::invalid_value("challenge mismatch"));
        }
        Ok(())
    }

    /// The conversation identity's public key; only present after Start.
    pub fn public_key(&self) -> ServerResult<&[u8]> {
        self.client_public_key.as_deref().ok_or(ServerError::BadConversationState)
    }

    pub fn identity(&self) -> ServerResult<IdentityId> {
        self.identity_id.ok_or(ServerError::BadConversationState)
    }
}

fn in_state(ok: bool) -> ServerResult<()> {
    if ok {
        Ok(())
    } else {
        Err(ServerError::BadConversationState)
    }
}

// =============================================================================
// CUSTOMER REGISTRY
// =============================================================================

struct CustomerSlot {
    seq: u64,
    evicted: Arc<AtomicBool>,
}

/// At most one live customer connection per identity. A new CheckIn evicts
/// the previous connection: its eviction flag flips, its next request
/// answers `ErrorBadConversationState`, and its socket closes.
pub struct CustomerRegistry {
    inner: Mutex<HashMap<IdentityId, CustomerSlot>>,
    next_seq: AtomicU64,
}

impl CustomerRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), next_seq: AtomicU64::new(1) }
    }

    /// Register a customer connection, evicting any previous one.
    pub async fn check_in(&self, identity_id: IdentityId, evicted: Arc<AtomicBool>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.insert(identity_id, CustomerSlot { seq, evicted }) {
            previous.evicted.store(true, Ordering::SeqCst);
            debug!(
                "Evicted previous customer connection for {}",
                hex::encode(&identity_id[..8])
            );
        }
        seq
    }

    /// Drop a registration on disconnect; a newer registration stays.
    pub async fn check_out(&self, identity_id: &IdentityId, seq: u64) {
        let mut inner = self.inner.lock().await;
        if inner.get(identity_id).map(|slot| slot.seq) == Some(seq) {
            inner.remove(identity_id);
        }
    }

    pub async fn is_checked_in(&self, identity_id: &IdentityId) -> bool {
        self.inner.lock().await.contains_key(identity_id)
    }
}

impl Default for CustomerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CheckInRequest, PingRequest, UpdateProfileRequest};

    fn conversation(role: Role) -> Conversation {
        Conversation::new(role, "127.0.0.1:1000".parse().unwrap())
    }

    #[test]
    fn primary_role_rejects_conversations() {
        let conv = conversation(Role::Primary);
        assert!(conv.request_allowed(&request::Content::Ping(PingRequest::default())).is_ok());
        assert!(matches!(
            conv.request_allowed(&request::Content::StartConversation(Default::default())),
            Err(ServerError::BadRole)
        ));
    }

    #[test]
    fn customer_requests_need_check_in() {
        let mut conv = conversation(Role::ClientCustomer);
        let update = request::Content::UpdateProfile(UpdateProfileRequest::default());

        assert!(matches!(
            conv.request_allowed(&update),
            Err(ServerError::BadConversationState)
        ));

        conv.state = ConversationState::AuthenticatedCustomer;
        assert!(conv.request_allowed(&update).is_ok());
    }

    #[test]
    fn check_in_is_customer_role_only() {
        let mut conv = conversation(Role::ClientNonCustomer);
        conv.state = ConversationState::Started;
        assert!(matches!(
            conv.request_allowed(&request::Content::CheckIn(CheckInRequest::default())),
            Err(ServerError::BadRole)
        ));
    }

    #[test]
    fn start_records_peer_identity_and_mints_challenge() {
        let mut conv = conversation(Role::ClientNonCustomer);
        let server_keys = Keypair::generate();
        let client_keys = Keypair::generate();

        let req = StartConversationRequest {
            public_key: client_keys.public.to_vec(),
            client_challenge: vec![5u8; CHALLENGE_SIZE],
        };
        let resp = conv.start(&req, &server_keys).unwrap();

        assert_eq!(conv.state, ConversationState::Started);
        assert_eq!(conv.identity_id, Some(client_keys.identity_id()));
        assert_eq!(resp.server_challenge.len(), CHALLENGE_SIZE);
        // The server proved its key over our challenge
        assert!(crypto::verify(
            &server_keys.public,
            &req.client_challenge,
            &resp.client_challenge_signature
        )
        .is_ok());

        assert!(conv.check_challenge(&resp.server_challenge).is_ok());
        assert!(conv.check_challenge(&[0u8; CHALLENGE_SIZE]).is_err());
    }

    #[tokio::test]
    async fn second_check_in_evicts_the_first() {
        let registry = CustomerRegistry::new();
        let identity = [1u8; 32];

        let first = Arc::new(AtomicBool::new(false));
        let seq1 = registry.check_in(identity, first.clone()).await;

        let second = Arc::new(AtomicBool::new(false));
        let _seq2 = registry.check_in(identity, second.clone()).await;

        assert!(first.load(Ordering::SeqCst));
        assert!(!second.load(Ordering::SeqCst));

        // A stale check-out must not unregister the newer connection
        registry.check_out(&identity, seq1).await;
        assert!(registry.is_checked_in(&identity).await);
    }
}
