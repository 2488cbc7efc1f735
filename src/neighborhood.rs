//! Neighborhood initialization: bulk transfer of a peer's hosted profiles.
//!
//! ```text
//! Initiating side (we pull a new neighbor's database):
//!
//! ┌───────────┐ Start accepted ┌───────────┐ Finish received ┌──────────┐
//! │ Requested │───────────────►│ Streaming │────────────────►│ Finished │
//! └───────────┘                └───────────┘                 └──────────┘
//!       ▲                            │
//!       └── timeout / loss / bad record (staged profiles discarded) ──┘
//! ```
//!
//! Profiles are committed in one batch only after Finish; any failure while
//! streaming leaves the mirror untouched. Every shared profile is
//! re-verified before staging, and one failing record aborts the whole
//! initialization.
//!
//! The receiving side is the mirror image: it registers the initiator as a
//! follower behind an `InitializationProcessInProgress` sentinel and streams
//! its hosted snapshot back over the same connection using the
//! server-initiated id space.

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::net::client::{self, expect_ok, PeerClient};
use crate::net::framing::{read_envelope, write_envelope, MessageBuilder};
use crate::proto::{
    envelope, request, response, shared_profile_update_item, FinishNeighborhoodInitializationRequest,
    NeighborhoodSharedProfileUpdateRequest, Response, RoleType, SharedProfileUpdateItem,
    StartNeighborhoodInitializationRequest,
};
use crate::store::records::{ActionType, NeighborIdentityRecord, PeerServerRecord};
use crate::types::{now, GpsLocation, ServerId};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Profiles per NeighborhoodSharedProfileUpdate batch during bulk transfer.
pub const INIT_BATCH_MAX_PROFILES: usize = 1000;

/// Total deadline for one initialization attempt.
pub const INIT_TOTAL_TIMEOUT_SECS: u64 = 600;

/// Per-response deadline while streaming to a follower.
const PUSH_RESPONSE_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// INITIATING SIDE
// =============================================================================

/// Pull a newly announced neighbor's hosted profiles into the local mirror.
pub async fn initialize_from_neighbor(
    ctx: &Arc<ServerContext>,
    connector: &TlsConnector,
    neighbor_id: ServerId,
    ip_address: IpAddr,
    primary_port: u16,
    location: GpsLocation,
) -> ServerResult<()> {
    timeout(
        Duration::from_secs(INIT_TOTAL_TIMEOUT_SECS),
        pull(ctx, connector, neighbor_id, ip_address, primary_port, location),
    )
    .await
    .map_err(|_| ServerError::Internal("neighborhood initialization timed out".into()))?
}

async fn pull(
    ctx: &Arc<ServerContext>,
    connector: &TlsConnector,
    neighbor_id: ServerId,
    ip_address: IpAddr,
    primary_port: u16,
    location: GpsLocation,
) -> ServerResult<()> {
    let roles = client::query_roles(SocketAddr::new(ip_address, primary_port)).await?;
    let sr_port = client::role_port(&roles, RoleType::SrNeighbor)?;

    let mut peer = PeerClient::connect_tls(connector, SocketAddr::new(ip_address, sr_port)).await?;
    peer.start_conversation(&ctx.keys).await?;
    if peer.server_network_id() != neighbor_id {
        // Whoever answered does not hold the announced identity's key.
        return Err(ServerError::Rejected);
    }
    peer.verify_identity(&ctx.keys).await?;

    let mut start = StartNeighborhoodInitializationRequest {
        primary_port: ctx.config.primary_port as u32,
        sr_neighbor_port: ctx.config.sr_neighbor_port as u32,
        signature: Vec::new(),
    };
    crate::proto::sign_request(&ctx.keys, &mut start);
    let response = peer
        .call(request::Content::StartNeighborhoodInitialization(start))
        .await?;
    expect_ok(&response)?;

    debug!(
        "Neighborhood initialization streaming from {}",
        hex::encode(&neighbor_id[..8])
    );

    let mut staged: Vec<NeighborIdentityRecord> = Vec::new();
    loop {
        let envelope = peer.next_envelope().await?;
        let (id, request) = match envelope.body {
            Some(envelope::Body::ServerUpdateRequest(request)) => (envelope.id, request),
            _ => {
                return Err(ServerError::Protocol(
                    "unexpected message during initialization".into(),
                ))
            }
        };

        match request.content {
            Some(request::Content::NeighborhoodSharedProfileUpdate(update)) => {
                match stage_batch(ctx, &peer, neighbor_id, &update, &mut staged) {
                    Ok(()) => {
                        peer.respond(
                            id,
                            Response::ok(response::Content::NeighborhoodSharedProfileUpdate(
                                Default::default(),
                            )),
                        )
                        .await?;
                    }
                    Err(e) => {
                        let _ = peer.respond(id, Response::error(e.status(), e.public_details())).await;
                        return Err(e);
                    }
                }
            }
            Some(request::Content::FinishNeighborhoodInitialization(_)) => {
                ctx.store.replace_neighbor_profiles(&neighbor_id, &staged)?;
                ctx.store.put_neighbor(&PeerServerRecord {
                    network_id: neighbor_id,
                    ip_address,
                    primary_port,
                    sr_neighbor_port: sr_port,
                    initialized: true,
                    last_refresh_time: now(),
                    location: Some(location),
                })?;
                peer.respond(
                    id,
                    Response::ok(response::Content::FinishNeighborhoodInitialization(
                        Default::default(),
                    )),
                )
                .await?;
                info!(
                    "Neighborhood initialization from {} finished with {} profiles",
                    hex::encode(&neighbor_id[..8]),
                    staged.len()
                );
                return Ok(());
            }
            _ => {
                return Err(ServerError::Protocol(
                    "unexpected request during initialization".into(),
                ))
            }
        }
    }
}

fn stage_batch<S>(
    ctx: &Arc<ServerContext>,
    peer: &PeerClient<S>,
    neighbor_id: ServerId,
    update: &NeighborhoodSharedProfileUpdateRequest,
    staged: &mut Vec<NeighborIdentityRecord>,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    crate::proto::verify_signed_request(update, peer.server_public_key())
        .map_err(|_| ServerError::InvalidSignature)?;
    if update.items.len() > INIT_BATCH_MAX_PROFILES {
        return Err(ServerError::invalid_value("batch too large"));
    }

    for item in &update.items {
        // During bulk transfer only additions are meaningful.
        let signed = match &item.change {
            Some(shared_profile_update_item::Change::Add(signed)) => signed,
            _ => return Err(ServerError::invalid_value("initialization batches may only add")),
        };
        if staged.len() >= ctx.config.max_neighbor_identities {
            return Err(ServerError::QuotaExceeded);
        }
        staged.push(NeighborIdentityRecord::from_signed_profile(neighbor_id, signed)?);
    }
    Ok(())
}

// =============================================================================
// RECEIVING SIDE
// =============================================================================

/// Stream the hosted snapshot to a freshly registered follower over its own
/// connection, then mark it initialized and lift the queue sentinel.
pub async fn stream_snapshot_to_follower<R, W>(
    ctx: &Arc<ServerContext>,
    reader: &mut R,
    writer: &mut W,
    builder: &mut MessageBuilder,
    follower_id: ServerId,
) -> ServerResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut snapshot: Vec<SharedProfileUpdateItem> = Vec::new();
    for item in ctx.store.hosted_iter() {
        let record = item?;
        if record.initialized && !record.cancelled {
            snapshot.push(SharedProfileUpdateItem {
                change: Some(shared_profile_update_item::Change::Add(record.signed_profile())),
            });
        }
    }
    let total = snapshot.len();

    for batch in snapshot.chunks(INIT_BATCH_MAX_PROFILES) {
        let mut update = NeighborhoodSharedProfileUpdateRequest {
            items: batch.to_vec(),
            signature: Vec::new(),
        };
        crate::proto::sign_request(&ctx.keys, &mut update);
        let envelope =
            builder.server_request(request::Content::NeighborhoodSharedProfileUpdate(update));
        write_envelope(writer, &envelope)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        let response = await_update_response(reader, envelope.id).await?;
        expect_ok(&response)?;
    }

    let mut finish = FinishNeighborhoodInitializationRequest { signature: Vec::new() };
    crate::proto::sign_request(&ctx.keys, &mut finish);
    let envelope =
        builder.server_request(request::Content::FinishNeighborhoodInitialization(finish));
    write_envelope(writer, &envelope)
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
    let response = await_update_response(reader, envelope.id).await?;
    expect_ok(&response)?;

    let mut follower = ctx
        .store
        .get_follower(&follower_id)?
        .ok_or_else(|| ServerError::Internal("follower vanished during initialization".into()))?;
    follower.initialized = true;
    follower.last_refresh_time = now();
    ctx.store.put_follower(&follower)?;

    // Lift the sentinel so queued updates can flow.
    for action in ctx.store.actions_for_target(&follower_id)? {
        if action.action_type == ActionType::InitializationProcessInProgress {
            ctx.store.delete_action(&action)?;
        }
    }
    ctx.action_wakeup.notify_one();

    info!(
        "Streamed {} profiles to new follower {}",
        total,
        hex::encode(&follower_id[..8])
    );
    Ok(())
}

async fn await_update_response<R>(reader: &mut R, id: u32) -> ServerResult<Response>
where
    R: AsyncRead + Unpin,
{
    let envelope = timeout(
        Duration::from_secs(PUSH_RESPONSE_TIMEOUT_SECS),
        read_envelope(reader),
    )
    .await
    .map_err(|_| ServerError::Internal("follower stopped responding".into()))?
    .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;

    match envelope.body {
        Some(envelope::Body::ServerUpdateResponse(response)) if envelope.id == id => Ok(response),
        _ => Err(ServerError::Protocol("unexpected message during initialization push".into())),
    }
}

/// Roll back a failed inbound initialization: the follower registration and
/// its queue (sentinel included) disappear.
pub fn abort_follower_initialization(ctx: &Arc<ServerContext>, follower_id: &ServerId) {
    if let Err(e) = ctx.store.remove_follower(follower_id) {
        warn!("Failed to remove follower after aborted initialization: {e}");
    }
    if let Err(e) = ctx.store.delete_actions_for_target(follower_id) {
        warn!("Failed to clear queue after aborted initialization: {e}");
    }
}
