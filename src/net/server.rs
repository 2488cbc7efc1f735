//! Role listeners and per-connection tasks.
//!
//! One TCP listener per role; each accepted socket becomes a long-lived
//! task. All writes on a connection happen from its own task, so the wire
//! order of responses matches the order requests were handled in. The
//! global shutdown signal stops the accept loops first; connection tasks
//! notice it between requests and drain.

use crate::context::ServerContext;
use crate::net::conversation::Conversation;
use crate::net::framing::{read_envelope, write_envelope, MessageBuilder};
use crate::net::handlers::{self, PostAction};
use crate::net::tls;
use crate::net::types::{
    Role, IDLE_TIMEOUT_AUTHENTICATED_SECS, IDLE_TIMEOUT_FRESH_SECS, TLS_HANDSHAKE_TIMEOUT_SECS,
};
use crate::neighborhood;
use crate::proto::{envelope, Response, Status};
use crate::error::ServerResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bind every role listener and spawn the accept loops. Returns the loop
/// handles so the caller can await them during shutdown.
pub async fn start(ctx: Arc<ServerContext>) -> ServerResult<Vec<JoinHandle<()>>> {
    let tls_config = tls::server_tls_config(&ctx.config.tls_certificate_file)?;

    let mut handles = Vec::with_capacity(Role::ALL.len());
    for role in Role::ALL {
        let addr = SocketAddr::new(ctx.config.server_interface, role.port(&ctx.config));
        let listener = TcpListener::bind(addr).await?;
        let acceptor = role.is_tls().then(|| tls::acceptor(tls_config.clone()));
        info!(
            "{} role listening on {}{}",
            role,
            addr,
            if role.is_tls() { " (TLS)" } else { "" }
        );
        handles.push(tokio::spawn(accept_loop(ctx.clone(), role, listener, acceptor)));
    }
    Ok(handles)
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    role: Role,
    listener: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("{role} accept failed: {e}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            let deadline = Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS);
                            match timeout(deadline, acceptor.accept(stream)).await {
                                Ok(Ok(stream)) => {
                                    run_connection(ctx, role, stream, peer_addr).await
                                }
                                Ok(Err(e)) => {
                                    debug!("TLS handshake with {peer_addr} failed: {e}")
                                }
                                Err(_) => debug!("TLS handshake with {peer_addr} timed out"),
                            }
                        }
                        None => run_connection(ctx, role, stream, peer_addr).await,
                    }
                });
            }
        }
    }
    debug!("{role} accept loop stopped");
}

async fn run_connection<S>(ctx: Arc<ServerContext>, role: Role, stream: S, peer_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut conv = Conversation::new(role, peer_addr);
    let mut builder = MessageBuilder::new();
    let mut shutdown = ctx.shutdown.clone();

    debug!("Connection from {peer_addr} on {role}");

    loop {
        let idle = Duration::from_secs(if conv.is_authenticated() {
            IDLE_TIMEOUT_AUTHENTICATED_SECS
        } else {
            IDLE_TIMEOUT_FRESH_SECS
        });

        let envelope = tokio::select! {
            _ = shutdown.changed() => break,
            read = timeout(idle, read_envelope(&mut reader)) => match read {
                Err(_) => {
                    debug!("Idle timeout for {peer_addr} on {role}");
                    break;
                }
                Ok(Err(e)) => {
                    if e.is_protocol_violation() {
                        warn!("Protocol violation from {peer_addr} on {role}: {e}");
                        let violation = MessageBuilder::protocol_violation(e.to_string());
                        let _ = write_envelope(&mut writer, &violation).await;
                    }
                    break;
                }
                Ok(Ok(envelope)) => envelope,
            },
        };

        let (id, request) = match envelope.body {
            Some(envelope::Body::Request(request)) => (envelope.id, request),
            // Responses and server-update frames are never valid inbound on
            // a server conversation outside an initialization push.
            _ => {
                let violation = MessageBuilder::protocol_violation("unexpected message kind");
                let _ = write_envelope(&mut writer, &violation).await;
                break;
            }
        };

        if conv.was_evicted() {
            let response = Response::error(
                Status::ErrorBadConversationState,
                "evicted by a newer check-in",
            );
            let _ = write_envelope(&mut writer, &MessageBuilder::response_to(id, response)).await;
            break;
        }

        let Some(content) = request.content else {
            let response = Response::error(Status::ErrorUnsupported, "unknown request");
            if write_envelope(&mut writer, &MessageBuilder::response_to(id, response))
                .await
                .is_err()
            {
                break;
            }
            continue;
        };

        let (response, post) = match conv.request_allowed(&content) {
            Err(e) => (Response::error(e.status(), e.public_details()), None),
            Ok(()) => handlers::dispatch(&ctx, &mut conv, &content).await,
        };

        let status = response.status_typed();
        if status != Status::Ok {
            debug!(
                "Request {} (id {}, identity {}) from {} on {} -> {:?}",
                content.name(),
                id,
                conv.identity_id.map(|i| hex::encode(&i[..8])).unwrap_or_else(|| "-".into()),
                peer_addr,
                role,
                status,
            );
        }

        if write_envelope(&mut writer, &MessageBuilder::response_to(id, response))
            .await
            .is_err()
        {
            break;
        }

        match post {
            Some(PostAction::Disconnect) => break,
            Some(PostAction::StreamInitialization { follower_id }) => {
                let pushed = neighborhood::stream_snapshot_to_follower(
                    &ctx,
                    &mut reader,
                    &mut writer,
                    &mut builder,
                    follower_id,
                )
                .await;
                if let Err(e) = pushed {
                    warn!(
                        "Initialization push to follower {} failed: {e}",
                        hex::encode(&follower_id[..8])
                    );
                    neighborhood::abort_follower_initialization(&ctx, &follower_id);
                    break;
                }
            }
            None => {}
        }
    }

    if let (Some(identity), Some(seq)) = (conv.identity_id, conv.customer_seq) {
        ctx.customers.check_out(&identity, seq).await;
    }
    debug!("Connection from {peer_addr} on {role} closed");
}
