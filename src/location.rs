//! Location-service adapter.
//!
//! Keeps a reconnecting connection to the external location service:
//! registers this server's contact and GPS position, subscribes to the
//! neighborhood with keep-alive, and converts pushed topology changes into
//! AddNeighbor/RemoveNeighbor actions. The service is authoritative for who
//! our neighbors are; the queue worker does the actual (de)initialization.

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::net::framing::{read_frame, write_frame};
use crate::proto::loc::{
    loc_envelope, loc_request, neighbourhood_change, DeregisterServiceRequest,
    GetNeighbourNodesByDistanceRequest, LocEnvelope, LocRequest, LocResponse, LocStatus, NodeProfile,
    RegisterServiceRequest,
};
use crate::queue;
use crate::types::ServerId;
use prost::Message;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// First reconnect delay after losing the location service.
const RECONNECT_INITIAL_SECS: u64 = 10;

/// Reconnect backoff cap.
const RECONNECT_MAX_SECS: u64 = 600;

pub async fn run(ctx: Arc<ServerContext>) {
    let Some(endpoint) = ctx.config.location_service_endpoint else {
        info!("Location service not configured; neighborhood discovery disabled");
        return;
    };

    let mut shutdown = ctx.shutdown.clone();
    let mut delay = RECONNECT_INITIAL_SECS;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match session(&ctx, endpoint).await {
            Ok(()) => break, // clean shutdown inside the session
            Err(e) => warn!("Location service session ended: {e}"),
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(Duration::from_secs(delay)) => {}
        }
        delay = (delay * 2).min(RECONNECT_MAX_SECS);
    }
    info!("Location adapter stopped");
}

async fn session(ctx: &Arc<ServerContext>, endpoint: SocketAddr) -> ServerResult<()> {
    let stream = TcpStream::connect(endpoint).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut next_id = 1u32;

    let register = loc_request::Content::RegisterService(RegisterServiceRequest {
        service_id: ctx.network_id.to_vec(),
        primary_port: ctx.config.primary_port as u32,
        latitude: ctx.config.location.latitude,
        longitude: ctx.config.location.longitude,
    });
    let response = call(&mut reader, &mut writer, &mut next_id, register).await?;
    expect_loc_ok(&response)?;

    let subscribe = loc_request::Content::GetNeighbourNodesByDistance(GetNeighbourNodesByDistanceRequest {
        keep_alive_and_send_updates: true,
    });
    let response = call(&mut reader, &mut writer, &mut next_id, subscribe).await?;
    expect_loc_ok(&response)?;

    let nodes = response.neighbour_nodes.map(|n| n.nodes).unwrap_or_default();
    info!("Registered with location service, {} neighbors announced", nodes.len());
    reconcile(ctx, &nodes)?;

    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Fire-and-forget: the service drops our record either way.
                let deregister = LocEnvelope {
                    id: next_id,
                    body: Some(loc_envelope::Body::Request(LocRequest {
                        content: Some(loc_request::Content::DeregisterService(
                            DeregisterServiceRequest { service_id: ctx.network_id.to_vec() },
                        )),
                    })),
                };
                let _ = write_frame(&mut writer, &deregister.encode_to_vec()).await;
                let _ = writer.shutdown().await;
                info!("Deregistered from location service");
                return Ok(());
            }
            frame = read_frame(&mut reader) => {
                let payload = frame.map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
                let envelope = LocEnvelope::decode(payload.as_slice())?;
                handle_push(ctx, &mut writer, envelope).await?;
            }
        }
    }
}

async fn handle_push<W>(
    ctx: &Arc<ServerContext>,
    writer: &mut W,
    envelope: LocEnvelope,
) -> ServerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let request = match envelope.body {
        Some(loc_envelope::Body::Request(request)) => request,
        // Stray responses are ignorable; the stream stays usable.
        Some(loc_envelope::Body::Response(_)) | None => return Ok(()),
    };

    if let Some(loc_request::Content::NeighbourhoodChanged(notification)) = request.content {
        for change in &notification.changes {
            apply_change(ctx, change)?;
        }
        let ack = LocEnvelope {
            id: envelope.id,
            body: Some(loc_envelope::Body::Response(LocResponse {
                status: LocStatus::Ok as i32,
                neighbour_nodes: None,
            })),
        };
        write_frame(writer, &ack.encode_to_vec())
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
    }
    Ok(())
}

fn apply_change(
    ctx: &Arc<ServerContext>,
    change: &crate::proto::loc::NeighbourhoodChange,
) -> ServerResult<()> {
    match &change.change {
        Some(neighbourhood_change::Change::Added(node))
        | Some(neighbourhood_change::Change::Updated(node)) => announce_node(ctx, node),
        Some(neighbourhood_change::Change::Removed(id)) => {
            let server_id: ServerId = id
                .as_slice()
                .try_into()
                .map_err(|_| ServerError::invalid_value("bad node id from location service"))?;
            queue::enqueue_remove_neighbor(&ctx.store, &ctx.action_wakeup, server_id)
        }
        None => Ok(()),
    }
}

fn announce_node(ctx: &Arc<ServerContext>, node: &NodeProfile) -> ServerResult<()> {
    let server_id: ServerId = match node.node_id.as_slice().try_into() {
        Ok(id) => id,
        Err(_) => {
            debug!("Ignoring location-service node with malformed id");
            return Ok(());
        }
    };
    if server_id == ctx.network_id {
        return Ok(());
    }
    let ip_address = match node.ip_address.parse() {
        Ok(ip) => ip,
        Err(_) => {
            debug!("Ignoring location-service node with bad address {}", node.ip_address);
            return Ok(());
        }
    };
    let Ok(primary_port) = u16::try_from(node.primary_port) else {
        return Ok(());
    };

    if let Some(mut existing) = ctx.store.get_neighbor(&server_id)? {
        // Known neighbor: refresh its announced contact and position.
        existing.ip_address = ip_address;
        existing.primary_port = primary_port;
        existing.location =
            crate::types::GpsLocation::new(node.latitude, node.longitude).or(existing.location);
        return ctx.store.put_neighbor(&existing);
    }

    queue::enqueue_add_neighbor(
        &ctx.store,
        &ctx.action_wakeup,
        server_id,
        ip_address,
        primary_port,
        node.latitude,
        node.longitude,
    )
}

/// Align local neighbor knowledge with a full listing from the service.
fn reconcile(ctx: &Arc<ServerContext>, nodes: &[NodeProfile]) -> ServerResult<()> {
    let mut announced: HashSet<ServerId> = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if let Ok(id) = ServerId::try_from(node.node_id.as_slice()) {
            announced.insert(id);
        }
        announce_node(ctx, node)?;
    }

    for neighbor in ctx.store.neighbors()? {
        if !announced.contains(&neighbor.network_id) {
            queue::enqueue_remove_neighbor(
                &ctx.store,
                &ctx.action_wakeup,
                neighbor.network_id,
            )?;
        }
    }
    Ok(())
}

async fn call<R, W>(
    reader: &mut R,
    writer: &mut W,
    next_id: &mut u32,
    content: loc_request::Content,
) -> ServerResult<LocResponse>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let id = *next_id;
    *next_id = next_id.wrapping_add(1);

    let envelope = LocEnvelope {
        id,
        body: Some(loc_envelope::Body::Request(LocRequest { content: Some(content) })),
    };
    write_frame(writer, &envelope.encode_to_vec())
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;

    loop {
        let payload = read_frame(reader)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        let envelope = LocEnvelope::decode(payload.as_slice())?;
        match envelope.body {
            Some(loc_envelope::Body::Response(response)) if envelope.id == id => {
                return Ok(response)
            }
            // A push can interleave with our own exchange; it is
            // acknowledged and re-delivered state arrives with the next
            // notification.
            Some(loc_envelope::Body::Request(_)) => {
                let ack = LocEnvelope {
                    id: envelope.id,
                    body: Some(loc_envelope::Body::Response(LocResponse {
                        status: LocStatus::Ok as i32,
                        neighbour_nodes: None,
                    })),
                };
                write_frame(writer, &ack.encode_to_vec())
                    .await
                    .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
            }
            _ => return Err(ServerError::Protocol("unexpected location-service reply".into())),
        }
    }
}

fn expect_loc_ok(response: &LocResponse) -> ServerResult<()> {
    if response.status == LocStatus::Ok as i32 {
        Ok(())
    } else {
        Err(ServerError::Internal("location service returned an error".into()))
    }
}
