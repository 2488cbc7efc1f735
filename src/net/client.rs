//! Outbound peer conversations.
//!
//! Used by the action queue worker and by neighborhood initialization. The
//! client drives the same conversation handshake a normal peer would:
//! StartConversation (proving the remote server key against our challenge),
//! then VerifyIdentity signed with this server's key. During initialization
//! the remote side pushes server-initiated requests over the same
//! connection; [`PeerClient::next_envelope`] surfaces them.

use crate::crypto::{self, Keypair};
use crate::error::{ServerError, ServerResult};
use crate::net::conversation::CHALLENGE_SIZE;
use crate::net::framing::{read_envelope, write_envelope};
use crate::proto::{
    envelope, request, response, Envelope, Response, ServerRole, StartConversationRequest,
    Status, VerifyIdentityRequest,
};
use crate::types::ServerId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Translate a peer-returned error status into the local taxonomy.
pub fn peer_error(status: Status) -> ServerError {
    match status {
        Status::Ok => ServerError::Internal("peer returned Ok where an error was mapped".into()),
        Status::ErrorProtocolViolation => ServerError::Protocol("peer reported a violation".into()),
        Status::ErrorUnsupported => ServerError::Unsupported,
        Status::ErrorBadRole => ServerError::BadRole,
        Status::ErrorBadConversationState => ServerError::BadConversationState,
        Status::ErrorInvalidSignature => ServerError::InvalidSignature,
        Status::ErrorInvalidValue => ServerError::InvalidValue("peer rejected a value".into()),
        Status::ErrorQuotaExceeded => ServerError::QuotaExceeded,
        Status::ErrorAlreadyExists => ServerError::AlreadyExists,
        Status::ErrorNotFound => ServerError::NotFound,
        Status::ErrorUninitialized => ServerError::Uninitialized,
        Status::ErrorRejected => ServerError::Rejected,
        Status::ErrorBusy => ServerError::Busy,
        Status::ErrorInternal => ServerError::Internal("peer internal error".into()),
    }
}

pub fn expect_ok(response: &Response) -> ServerResult<()> {
    match response.status_typed() {
        Status::Ok => Ok(()),
        status => Err(peer_error(status)),
    }
}

pub struct PeerClient<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    next_id: u32,
    server_public_key: Vec<u8>,
    server_challenge: Vec<u8>,
}

impl PeerClient<TlsStream<TcpStream>> {
    pub async fn connect_tls(connector: &TlsConnector, addr: SocketAddr) -> ServerResult<Self> {
        let stream = crate::net::tls::connect(connector, addr).await?;
        Ok(Self::new(stream))
    }
}

impl PeerClient<TcpStream> {
    pub async fn connect_plain(addr: SocketAddr) -> ServerResult<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl<S> PeerClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            next_id: 1,
            server_public_key: Vec::new(),
            server_challenge: Vec::new(),
        }
    }

    /// SHA256 of the remote server's public key; empty before the handshake.
    pub fn server_network_id(&self) -> ServerId {
        crypto::identity_id(&self.server_public_key)
    }

    /// The remote server's public key learned at StartConversation.
    pub fn server_public_key(&self) -> &[u8] {
        &self.server_public_key
    }

    pub async fn send_request(&mut self, content: request::Content) -> ServerResult<u32> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let envelope = Envelope::request(id, content);
        write_envelope(&mut self.writer, &envelope)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        Ok(id)
    }

    pub async fn next_envelope(&mut self) -> ServerResult<Envelope> {
        read_envelope(&mut self.reader)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))
    }

    /// Answer a server-initiated request.
    pub async fn respond(&mut self, id: u32, response: Response) -> ServerResult<()> {
        let envelope = Envelope::server_response(id, response);
        write_envelope(&mut self.writer, &envelope)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))
    }

    /// Send one request and read frames until its response arrives.
    pub async fn call(&mut self, content: request::Content) -> ServerResult<Response> {
        let id = self.send_request(content).await?;
        loop {
            let envelope = self.next_envelope().await?;
            match envelope.body {
                Some(envelope::Body::Response(response)) if envelope.id == id => {
                    return Ok(response)
                }
                Some(envelope::Body::Response(_)) => {
                    return Err(ServerError::Protocol("response id mismatch".into()))
                }
                _ => {
                    return Err(ServerError::Protocol(
                        "unexpected message while awaiting response".into(),
                    ))
                }
            }
        }
    }

    /// StartConversation followed by VerifyIdentity with our server key.
    pub async fn handshake(&mut self, keys: &Keypair) -> ServerResult<()> {
        self.start_conversation(keys).await?;
        self.verify_identity(keys).await
    }

    pub async fn start_conversation(&mut self, keys: &Keypair) -> ServerResult<()> {
        let challenge: [u8; CHALLENGE_SIZE] = rand::random();
        let response = self
            .call(request::Content::StartConversation(StartConversationRequest {
                public_key: keys.public.to_vec(),
                client_challenge: challenge.to_vec(),
            }))
            .await?;
        expect_ok(&response)?;

        let Some(response::Content::StartConversation(start)) = response.content else {
            return Err(ServerError::Protocol("missing StartConversation response".into()));
        };
        if start.server_challenge.len() != CHALLENGE_SIZE {
            return Err(ServerError::Protocol("bad server challenge".into()));
        }
        // The remote proves possession of its key over our challenge.
        crypto::verify(&start.public_key, &challenge, &start.client_challenge_signature)
            .map_err(|_| ServerError::InvalidSignature)?;

        self.server_public_key = start.public_key;
        self.server_challenge = start.server_challenge;
        debug!(
            "Conversation started with remote server {}",
            hex::encode(&self.server_network_id()[..8])
        );
        Ok(())
    }

    pub async fn verify_identity(&mut self, keys: &Keypair) -> ServerResult<()> {
        let mut req = VerifyIdentityRequest {
            challenge: self.server_challenge.clone(),
            signature: Vec::new(),
        };
        crate::proto::sign_request(keys, &mut req);
        let response = self.call(request::Content::VerifyIdentity(req)).await?;
        expect_ok(&response)
    }
}

/// Ask a server's plaintext primary role for its service listing.
pub async fn query_roles(addr: SocketAddr) -> ServerResult<Vec<ServerRole>> {
    let mut client = PeerClient::connect_plain(addr).await?;
    let response = client
        .call(request::Content::ListRoles(Default::default()))
        .await?;
    expect_ok(&response)?;
    match response.content {
        Some(response::Content::ListRoles(listing)) => Ok(listing.roles),
        _ => Err(ServerError::Protocol("missing ListRoles response".into())),
    }
}

/// Resolve a role's port from a service listing.
pub fn role_port(roles: &[ServerRole], wanted: crate::proto::RoleType) -> ServerResult<u16> {
    roles
        .iter()
        .find(|r| r.role == wanted as i32)
        .and_then(|r| u16::try_from(r.port).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| ServerError::Protocol("role missing from listing".into()))
}

// Callers hold one connector for the whole process.
pub fn shared_connector() -> Arc<TlsConnector> {
    Arc::new(crate::net::tls::insecure_connector())
}
