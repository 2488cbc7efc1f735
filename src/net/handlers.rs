//! Request handlers.
//!
//! The connection loop has already matched the request against the
//! conversation matrix; handlers validate payloads, verify signatures where
//! the state machine demands them, and translate every internal failure to
//! exactly one wire status.

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::net::conversation::{Conversation, ConversationState};
use crate::net::types::Role;
use crate::proto::{
    request, response, CheckInRequest, GetIdentityInformationResponse,
    GetProfileInformationResponse, NeighborhoodSharedProfileUpdateRequest, PingResponse, Response,
    SignedRequest, StartNeighborhoodInitializationRequest,
};
use crate::search::{SearchCache, SearchQuery, MAX_RESPONSE_RECORDS};
use crate::store::records::{ActionData, ActionType, NeighborIdentityRecord, PeerServerRecord};
use crate::types::{now, IdentityId, ServerId};
use std::sync::Arc;
use tracing::{debug, info};

/// Work the connection task performs after writing the response.
pub enum PostAction {
    /// Close the socket.
    Disconnect,
    /// Stream the hosted snapshot to a freshly registered follower.
    StreamInitialization { follower_id: ServerId },
}

pub async fn dispatch(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    content: &request::Content,
) -> (Response, Option<PostAction>) {
    match handle(ctx, conv, content).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let response = Response::error(e.status(), e.public_details());
            let post = e.terminates_connection().then_some(PostAction::Disconnect);
            (response, post)
        }
    }
}

async fn handle(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    content: &request::Content,
) -> ServerResult<(Response, Option<PostAction>)> {
    use request::Content as C;
    use response::Content as RC;

    let outcome = match content {
        C::Ping(req) => Response::ok(RC::Ping(PingResponse {
            payload: req.payload.clone(),
            clock: now(),
        })),

        C::ListRoles(_) => Response::ok(RC::ListRoles(crate::proto::ListRolesResponse {
            roles: ctx.role_listing(),
        })),

        C::StartConversation(req) => {
            let resp = conv.start(req, &ctx.keys)?;
            Response::ok(RC::StartConversation(resp))
        }

        C::VerifyIdentity(req) => {
            conv.check_challenge(&req.challenge)?;
            verify_signed(conv, req)?;
            conv.state = match conv.role {
                Role::ClientNonCustomer => ConversationState::AuthenticatedNonCustomer,
                Role::SrNeighbor => ConversationState::NeighborAuthenticated,
                _ => return Err(ServerError::BadRole),
            };
            Response::ok(RC::VerifyIdentity(Default::default()))
        }

        C::CheckIn(req) => {
            let resp = check_in(ctx, conv, req).await?;
            Response::ok(RC::CheckIn(resp))
        }

        C::HostingAgreement(req) => {
            verify_signed(conv, req)?;
            ctx.hosting.register(conv.public_key()?).await?;
            Response::ok(RC::HostingAgreement(Default::default()))
        }

        C::UpdateProfile(req) => {
            verify_signed(conv, req)?;
            ctx.hosting.update_profile(conv.identity()?, req).await?;
            Response::ok(RC::UpdateProfile(Default::default()))
        }

        C::CancelHosting(req) => {
            verify_signed(conv, req)?;
            let moved_to = match &req.new_hosting_server_id {
                Some(id) if !id.is_empty() => Some(
                    id.as_slice()
                        .try_into()
                        .map_err(|_| ServerError::invalid_value("server id must be 32 bytes"))?,
                ),
                _ => None,
            };
            ctx.hosting.cancel_hosting(conv.identity()?, moved_to).await?;
            Response::ok(RC::CancelHosting(Default::default()))
        }

        C::GetProfileInformation(req) => {
            let record = ctx
                .hosting
                .get_hosted(&conv.identity()?)?
                .filter(|r| !r.cancelled)
                .ok_or(ServerError::NotFound)?;
            let profile_image =
                ctx.hosting.load_image(record.profile_image_hash, req.include_profile_image)?;
            let thumbnail_image = ctx
                .hosting
                .load_image(record.thumbnail_image_hash, req.include_thumbnail_image)?;
            Response::ok(RC::GetProfileInformation(GetProfileInformationResponse {
                signed_profile: Some(record.signed_profile()),
                initialized: record.initialized,
                profile_image,
                thumbnail_image,
            }))
        }

        C::GetIdentityInformation(req) => {
            let resp = get_identity_information(ctx, req)?;
            Response::ok(RC::GetIdentityInformation(resp))
        }

        C::ProfileSearch(req) => {
            let query = SearchQuery::parse(req)?;
            let outcome = ctx.search.search(&query)?;

            let inline_count = query.max_response_records.min(outcome.records.len());
            let profiles = outcome.records[..inline_count].to_vec();
            let cache = SearchCache::new(outcome.records);
            let token =
                if cache.is_empty() { Vec::new() } else { cache.token.to_vec() };
            let total = cache.len() as u32;
            conv.search_cache = Some(cache);

            Response::ok(RC::ProfileSearch(crate::proto::ProfileSearchResponse {
                total_record_count: total,
                profiles,
                continuation_token: token,
                truncated: outcome.truncated,
            }))
        }

        C::ProfileSearchPart(req) => {
            if req.record_count > MAX_RESPONSE_RECORDS {
                return Err(ServerError::invalid_value("record count too large"));
            }
            let cache = conv.search_cache.as_ref().ok_or(ServerError::NotFound)?;
            if cache.expired() || cache.token.as_slice() != req.continuation_token.as_slice() {
                conv.search_cache = None;
                return Err(ServerError::NotFound);
            }
            let page = cache
                .page(req.record_index as usize, req.record_count as usize)
                .ok_or_else(|| ServerError::invalid_value("page out of range"))?
                .to_vec();
            Response::ok(RC::ProfileSearchPart(crate::proto::ProfileSearchPartResponse {
                record_index: req.record_index,
                profiles: page,
            }))
        }

        C::AddRelatedIdentity(req) => {
            verify_signed(conv, req)?;
            let card = req
                .card
                .as_ref()
                .ok_or_else(|| ServerError::invalid_value("card is required"))?;
            ctx.hosting.add_related(conv.identity()?, conv.public_key()?, card).await?;
            Response::ok(RC::AddRelatedIdentity(Default::default()))
        }

        C::RemoveRelatedIdentity(req) => {
            verify_signed(conv, req)?;
            ctx.hosting.remove_related(conv.identity()?, &req.application_id).await?;
            Response::ok(RC::RemoveRelatedIdentity(Default::default()))
        }

        C::GetIdentityRelationships(req) => {
            let identity: IdentityId = req
                .identity_id
                .as_slice()
                .try_into()
                .map_err(|_| ServerError::invalid_value("identity id must be 32 bytes"))?;
            let cards = ctx
                .hosting
                .relationships(&identity, req.include_invalid, &req.card_type, &req.issuer_id)?
                .iter()
                .map(|record| record.to_card())
                .collect();
            Response::ok(RC::GetIdentityRelationships(
                crate::proto::GetIdentityRelationshipsResponse { cards },
            ))
        }

        C::StartNeighborhoodInitialization(req) => {
            return start_neighborhood_initialization(ctx, conv, req).await;
        }

        C::FinishNeighborhoodInitialization(_) => {
            return Err(ServerError::BadConversationState);
        }

        C::NeighborhoodSharedProfileUpdate(req) => {
            apply_shared_profile_update(ctx, conv, req)?;
            Response::ok(RC::NeighborhoodSharedProfileUpdate(Default::default()))
        }

        C::StopNeighborhoodUpdates(req) => {
            verify_signed(conv, req)?;
            let sender = conv.identity()?;
            if !ctx.store.remove_follower(&sender)? {
                return Err(ServerError::NotFound);
            }
            let dropped = ctx.store.delete_actions_for_target(&sender)?;
            info!(
                "Follower {} unsubscribed, dropped {} pending actions",
                hex::encode(&sender[..8]),
                dropped
            );
            Response::ok(RC::StopNeighborhoodUpdates(Default::default()))
        }
    };

    Ok((outcome, None))
}

fn verify_signed<M: SignedRequest>(conv: &Conversation, msg: &M) -> ServerResult<()> {
    crate::proto::verify_signed_request(msg, conv.public_key()?)
        .map_err(|_| ServerError::InvalidSignature)
}

async fn check_in(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    req: &CheckInRequest,
) -> ServerResult<crate::proto::CheckInResponse> {
    conv.check_challenge(&req.challenge)?;
    verify_signed(conv, req)?;

    let identity = conv.identity()?;
    ctx.hosting
        .get_hosted(&identity)?
        .filter(|r| !r.cancelled)
        .ok_or(ServerError::NotFound)?;

    let seq = ctx.customers.check_in(identity, conv.evicted.clone()).await;
    conv.customer_seq = Some(seq);
    conv.state = ConversationState::AuthenticatedCustomer;

    debug!("Customer {} checked in from {}", hex::encode(&identity[..8]), conv.peer_addr);
    Ok(Default::default())
}

fn get_identity_information(
    ctx: &Arc<ServerContext>,
    req: &crate::proto::GetIdentityInformationRequest,
) -> ServerResult<GetIdentityInformationResponse> {
    let identity: IdentityId = req
        .identity_id
        .as_slice()
        .try_into()
        .map_err(|_| ServerError::invalid_value("identity id must be 32 bytes"))?;

    let record = ctx.hosting.get_hosted(&identity)?.ok_or(ServerError::NotFound)?;

    if record.cancelled {
        // The identity is gone; point at its new home when we know one.
        return Ok(GetIdentityInformationResponse {
            signed_profile: None,
            is_hosted: false,
            is_cancelled: true,
            hosting_server_id: record
                .moved_to_server_id
                .map(|id| id.to_vec())
                .unwrap_or_default(),
            profile_image: None,
            thumbnail_image: None,
        });
    }
    if !record.initialized {
        return Err(ServerError::Uninitialized);
    }

    let profile_image = ctx.hosting.load_image(record.profile_image_hash, req.include_profile_image)?;
    let thumbnail_image =
        ctx.hosting.load_image(record.thumbnail_image_hash, req.include_thumbnail_image)?;
    Ok(GetIdentityInformationResponse {
        signed_profile: Some(record.signed_profile()),
        is_hosted: true,
        is_cancelled: false,
        hosting_server_id: Vec::new(),
        profile_image,
        thumbnail_image,
    })
}

async fn start_neighborhood_initialization(
    ctx: &Arc<ServerContext>,
    conv: &mut Conversation,
    req: &StartNeighborhoodInitializationRequest,
) -> ServerResult<(Response, Option<PostAction>)> {
    verify_signed(conv, req)?;
    let follower_id = conv.identity()?;

    if follower_id == ctx.network_id {
        return Err(ServerError::Rejected);
    }
    let primary_port: u16 = req
        .primary_port
        .try_into()
        .ok()
        .filter(|p| *p != 0u16)
        .ok_or_else(|| ServerError::invalid_value("bad primary port"))?;
    let sr_neighbor_port: u16 = req
        .sr_neighbor_port
        .try_into()
        .ok()
        .filter(|p| *p != 0u16)
        .ok_or_else(|| ServerError::invalid_value("bad neighbor port"))?;

    if let Some(existing) = ctx.store.get_follower(&follower_id)? {
        if existing.initialized {
            return Err(ServerError::AlreadyExists);
        }
    }
    let pending = ctx.store.actions_for_target(&follower_id)?;
    if pending.iter().any(|a| a.action_type == ActionType::InitializationProcessInProgress) {
        return Err(ServerError::Busy);
    }
    if ctx.store.follower_count() >= ctx.config.max_followers {
        return Err(ServerError::QuotaExceeded);
    }

    let record = PeerServerRecord {
        network_id: follower_id,
        ip_address: conv.peer_addr.ip(),
        primary_port,
        sr_neighbor_port,
        initialized: false,
        last_refresh_time: now(),
        location: None,
    };
    ctx.store.put_follower(&record)?;

    // The sentinel suspends every other follower-direction action for this
    // target until the bulk transfer completes.
    let sentinel = ctx.store.make_action(
        follower_id,
        &ActionData::InitializationProcessInProgress {},
        None,
        None,
    )?;
    ctx.store.enqueue_action(&sentinel)?;

    info!(
        "Follower {} at {} starting neighborhood initialization",
        hex::encode(&follower_id[..8]),
        conv.peer_addr
    );
    Ok((
        Response::ok(response::Content::StartNeighborhoodInitialization(Default::default())),
        Some(PostAction::StreamInitialization { follower_id }),
    ))
}

fn apply_shared_profile_update(
    ctx: &Arc<ServerContext>,
    conv: &Conversation,
    req: &NeighborhoodSharedProfileUpdateRequest,
) -> ServerResult<()> {
    verify_signed(conv, req)?;
    let sender = conv.identity()?;

    let mut neighbor = ctx
        .store
        .get_neighbor(&sender)?
        .filter(|n| n.initialized)
        .ok_or(ServerError::Rejected)?;

    for (index, item) in req.items.iter().enumerate() {
        use crate::proto::shared_profile_update_item::Change;
        let bad_item =
            |detail: &str| ServerError::InvalidValue(format!("item {index}: {detail}"));

        match item.change.as_ref().ok_or_else(|| bad_item("empty"))? {
            Change::Add(signed) => {
                if ctx.store.count_neighbor_profiles(&sender)
                    >= ctx.config.max_neighbor_identities
                {
                    return Err(ServerError::QuotaExceeded);
                }
                let record = NeighborIdentityRecord::from_signed_profile(sender, signed)?;
                ctx.store.upsert_neighbor_profile(&record)?;
            }
            Change::Change(signed) => {
                let record = NeighborIdentityRecord::from_signed_profile(sender, signed)?;
                ctx.store.upsert_neighbor_profile(&record)?;
            }
            Change::Remove(identity) => {
                let identity: IdentityId = identity
                    .as_slice()
                    .try_into()
                    .map_err(|_| bad_item("identity id must be 32 bytes"))?;
                ctx.store.remove_neighbor_profile(&sender, &identity)?;
            }
            Change::Refresh(refresh) => {
                let keep = refresh
                    .identity_ids
                    .iter()
                    .map(|id| {
                        id.as_slice()
                            .try_into()
                            .map_err(|_| bad_item("identity id must be 32 bytes"))
                    })
                    .collect::<ServerResult<std::collections::HashSet<IdentityId>>>()?;
                let dropped = ctx.store.retain_neighbor_profiles(&sender, &keep)?;
                if dropped > 0 {
                    debug!(
                        "Refresh from {} dropped {} stale mirrored profiles",
                        hex::encode(&sender[..8]),
                        dropped
                    );
                }
            }
        }
    }

    neighbor.last_refresh_time = now();
    ctx.store.put_neighbor(&neighbor)?;
    Ok(())
}
