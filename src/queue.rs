//! Neighborhood action queue worker.
//!
//! One logical FIFO per `(target server, direction)`. Within a queue,
//! actions run strictly in id order; across queues the worker parallelizes
//! freely, one in-flight task per queue. A follower-direction queue whose
//! head is the `InitializationProcessInProgress` sentinel is suspended until
//! the bulk transfer lifts it.
//!
//! Failures advance the head's `execute_after` by an exponential backoff
//! (30 s doubling to 1 h). After 12 consecutive failures the target is
//! considered unreachable: the whole queue is dropped and a RemoveNeighbor
//! follow-up (or direct follower removal) cleans the remaining state.

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::net::client::{self, expect_ok, PeerClient};
use crate::proto::{
    request, NeighborhoodSharedProfileUpdateRequest, ProfileRefresh, RoleType,
    SharedProfileUpdateItem, StopNeighborhoodUpdatesRequest,
};
use crate::proto::shared_profile_update_item::Change;
use crate::store::records::{ActionData, ActionType, NeighborhoodAction, QueueDirection};
use crate::store::Store;
use crate::types::{now, ServerId};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// First retry delay after a dispatch failure.
pub const INITIAL_RETRY_SECS: u64 = 30;

/// Backoff cap.
pub const MAX_RETRY_SECS: u64 = 3600;

/// Consecutive failures before a target is declared unreachable.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 12;

/// Poll interval when no wakeup arrives.
const WORKER_TICK_SECS: u64 = 5;

/// Profile actions coalesced into one push to a follower.
const PUSH_BATCH_MAX_ITEMS: usize = 100;

/// Deadline for one push exchange with a follower.
const PUSH_CALL_TIMEOUT_SECS: u64 = 60;

/// Backoff after the Nth consecutive failure: 30s, 60s, ... capped at 1h.
pub fn backoff_delay(failures: u32) -> u64 {
    let shift = failures.saturating_sub(1).min(7);
    (INITIAL_RETRY_SECS << shift).min(MAX_RETRY_SECS)
}

/// A follower-direction queue is suspended while its head is the
/// initialization sentinel; nothing behind the sentinel may dispatch.
pub fn follower_queue_suspended(queue: &[NeighborhoodAction]) -> bool {
    queue
        .iter()
        .find(|a| a.direction() == QueueDirection::Follower)
        .map(|head| head.action_type == ActionType::InitializationProcessInProgress)
        .unwrap_or(false)
}

// =============================================================================
// ENQUEUE POLICY
// =============================================================================

/// Queue an AddNeighbor unless one is already pending for the target.
pub fn enqueue_add_neighbor(
    store: &Store,
    wakeup: &Notify,
    server_id: ServerId,
    ip_address: IpAddr,
    primary_port: u16,
    latitude: i32,
    longitude: i32,
) -> ServerResult<()> {
    let pending = store.actions_for_target(&server_id)?;
    if pending.iter().any(|a| a.action_type == ActionType::AddNeighbor) {
        return Ok(());
    }
    let action = store.make_action(
        server_id,
        &ActionData::AddNeighbor { ip_address, primary_port, latitude, longitude },
        None,
        None,
    )?;
    store.enqueue_action(&action)?;
    wakeup.notify_one();
    Ok(())
}

/// Queue a RemoveNeighbor. When the neighbor never finished initializing and
/// its AddNeighbor is still pending, the removal cancels the pending
/// addition in place instead of becoming a separate action.
pub fn enqueue_remove_neighbor(
    store: &Store,
    wakeup: &Notify,
    server_id: ServerId,
) -> ServerResult<()> {
    let pending = store.actions_for_target(&server_id)?;
    let initialized = store.get_neighbor(&server_id)?.map(|n| n.initialized).unwrap_or(false);

    if !initialized {
        let mut cancelled = false;
        for action in &pending {
            if action.action_type == ActionType::AddNeighbor {
                store.delete_action(action)?;
                cancelled = true;
            }
        }
        if cancelled {
            debug!(
                "RemoveNeighbor for {} cancelled the pending AddNeighbor in place",
                hex::encode(&server_id[..8])
            );
            store.remove_neighbor(&server_id)?;
            return Ok(());
        }
    }

    if pending.iter().any(|a| a.action_type == ActionType::RemoveNeighbor) {
        return Ok(());
    }
    let action = store.make_action(server_id, &ActionData::RemoveNeighbor {}, None, None)?;
    store.enqueue_action(&action)?;
    wakeup.notify_one();
    Ok(())
}

// =============================================================================
// WORKER
// =============================================================================

pub struct QueueWorker {
    ctx: Arc<ServerContext>,
    connector: Arc<TlsConnector>,
    in_flight: Mutex<HashSet<(ServerId, QueueDirection)>>,
}

impl QueueWorker {
    pub fn new(ctx: Arc<ServerContext>, connector: Arc<TlsConnector>) -> Arc<Self> {
        Arc::new(Self { ctx, connector, in_flight: Mutex::new(HashSet::new()) })
    }

    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.ctx.shutdown.clone();
        info!("Action queue worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.ctx.action_wakeup.notified() => {}
                _ = sleep(Duration::from_secs(WORKER_TICK_SECS)) => {}
            }
            if let Err(e) = self.dispatch_round().await {
                warn!("Queue dispatch round failed: {e}");
            }
        }
        info!("Action queue worker stopped");
    }

    /// Find eligible queue heads and spawn one task per claimable queue.
    async fn dispatch_round(self: &Arc<Self>) -> ServerResult<()> {
        let now_ts = now();
        for target in self.ctx.store.action_targets()? {
            let actions = self.ctx.store.actions_for_target(&target)?;
            for direction in [QueueDirection::Neighbor, QueueDirection::Follower] {
                let Some(head) = actions.iter().find(|a| a.direction() == direction) else {
                    continue;
                };
                if direction == QueueDirection::Follower && follower_queue_suspended(&actions) {
                    continue;
                }
                if !head.is_eligible(now_ts) {
                    continue;
                }

                {
                    let mut in_flight = self.in_flight.lock().await;
                    if !in_flight.insert((target, direction)) {
                        continue;
                    }
                }
                let worker = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = worker.process_queue(target, direction).await {
                        debug!(
                            "Queue for {} ({:?}) errored: {e}",
                            hex::encode(&target[..8]),
                            direction
                        );
                    }
                    worker.in_flight.lock().await.remove(&(target, direction));
                });
            }
        }
        Ok(())
    }

    async fn process_queue(&self, target: ServerId, direction: QueueDirection) -> ServerResult<()> {
        let now_ts = now();
        let queue: Vec<NeighborhoodAction> = self
            .ctx
            .store
            .actions_for_target(&target)?
            .into_iter()
            .filter(|a| a.direction() == direction)
            .collect();
        let Some(head) = queue.first().cloned() else { return Ok(()) };
        if !head.is_eligible(now_ts) {
            return Ok(());
        }

        match direction {
            QueueDirection::Follower => self.process_follower_queue(target, &queue, head).await,
            QueueDirection::Neighbor => self.process_neighbor_head(target, head).await,
        }
    }

    async fn process_follower_queue(
        &self,
        target: ServerId,
        queue: &[NeighborhoodAction],
        head: NeighborhoodAction,
    ) -> ServerResult<()> {
        if head.action_type == ActionType::InitializationProcessInProgress {
            return Ok(());
        }

        let now_ts = now();
        let run: Vec<NeighborhoodAction> = queue
            .iter()
            .take_while(|a| {
                a.action_type != ActionType::InitializationProcessInProgress
                    && a.is_eligible(now_ts)
            })
            .take(PUSH_BATCH_MAX_ITEMS)
            .cloned()
            .collect();

        match self.push_to_follower(&target, &run).await {
            Ok(()) => {
                for action in &run {
                    self.ctx.store.delete_action(action)?;
                }
                debug!(
                    "Pushed {} update(s) to follower {}",
                    run.len(),
                    hex::encode(&target[..8])
                );
                if run.len() == PUSH_BATCH_MAX_ITEMS {
                    self.ctx.action_wakeup.notify_one();
                }
                Ok(())
            }
            // The follower is gone or no longer recognizes us; its queue is
            // pointless.
            Err(ServerError::NotFound) | Err(ServerError::Rejected) => {
                warn!(
                    "Follower {} rejected updates; dropping its queue",
                    hex::encode(&target[..8])
                );
                self.ctx.store.delete_actions_for_target(&target)?;
                self.ctx.store.remove_follower(&target)?;
                Ok(())
            }
            Err(e) => self.record_failure(head, QueueDirection::Follower, &e).await,
        }
    }

    async fn push_to_follower(
        &self,
        target: &ServerId,
        run: &[NeighborhoodAction],
    ) -> ServerResult<()> {
        let follower = self
            .ctx
            .store
            .get_follower(target)?
            .filter(|f| f.initialized)
            .ok_or(ServerError::NotFound)?;

        let mut items = Vec::with_capacity(run.len());
        for action in run {
            let change = match action.data()? {
                ActionData::AddProfile { profile } => Change::Add(profile.signed_profile()),
                ActionData::ChangeProfile { profile } => Change::Change(profile.signed_profile()),
                ActionData::RemoveProfile { identity_id } => Change::Remove(identity_id.to_vec()),
                ActionData::RefreshProfiles { identity_ids } => Change::Refresh(ProfileRefresh {
                    identity_ids: identity_ids.iter().map(|id| id.to_vec()).collect(),
                }),
                other => {
                    return Err(ServerError::Internal(format!(
                        "action {:?} in a follower queue",
                        other.action_type()
                    )))
                }
            };
            items.push(SharedProfileUpdateItem { change: Some(change) });
        }

        timeout(Duration::from_secs(PUSH_CALL_TIMEOUT_SECS), async {
            let mut peer =
                PeerClient::connect_tls(&self.connector, follower.sr_neighbor_addr()).await?;
            peer.start_conversation(&self.ctx.keys).await?;
            if peer.server_network_id() != *target {
                return Err(ServerError::Rejected);
            }
            peer.verify_identity(&self.ctx.keys).await?;

            let mut update =
                NeighborhoodSharedProfileUpdateRequest { items, signature: Vec::new() };
            crate::proto::sign_request(&self.ctx.keys, &mut update);
            let response = peer
                .call(request::Content::NeighborhoodSharedProfileUpdate(update))
                .await?;
            expect_ok(&response)
        })
        .await
        .map_err(|_| ServerError::Internal("push to follower timed out".into()))?
    }

    async fn process_neighbor_head(
        &self,
        target: ServerId,
        head: NeighborhoodAction,
    ) -> ServerResult<()> {
        match head.data()? {
            ActionData::AddNeighbor { ip_address, primary_port, latitude, longitude } => {
                let location = crate::types::GpsLocation { latitude, longitude };
                let outcome = crate::neighborhood::initialize_from_neighbor(
                    &self.ctx,
                    &self.connector,
                    target,
                    ip_address,
                    primary_port,
                    location,
                )
                .await;
                match outcome {
                    Ok(()) => self.ctx.store.delete_action(&head),
                    // A rejection is terminal for this pairing.
                    Err(ServerError::Rejected) => {
                        warn!(
                            "Neighbor {} rejected initialization; dropping the pairing",
                            hex::encode(&target[..8])
                        );
                        self.ctx.store.delete_action(&head)?;
                        self.ctx.store.remove_neighbor(&target)?;
                        self.ctx.store.remove_neighbor_profiles_for(&target)?;
                        Ok(())
                    }
                    Err(e) => self.record_failure(head, QueueDirection::Neighbor, &e).await,
                }
            }

            ActionData::RemoveNeighbor {} => {
                let profiles = self.ctx.store.remove_neighbor_profiles_for(&target)?;
                self.ctx.store.remove_neighbor(&target)?;
                self.ctx.store.delete_action(&head)?;
                info!(
                    "Removed neighbor {} and {} mirrored profiles",
                    hex::encode(&target[..8]),
                    profiles
                );
                Ok(())
            }

            ActionData::StopNeighborhoodUpdates { ip_address, primary_port } => {
                match self.send_stop(&target, ip_address, primary_port).await {
                    Ok(())
                    // The peer not knowing us anymore is the goal state.
                    | Err(ServerError::NotFound)
                    | Err(ServerError::Rejected) => self.ctx.store.delete_action(&head),
                    Err(e) => self.record_failure(head, QueueDirection::Neighbor, &e).await,
                }
            }

            other => {
                warn!(
                    "Dropping misfiled action {:?} in a neighbor queue",
                    other.action_type()
                );
                self.ctx.store.delete_action(&head)
            }
        }
    }

    async fn send_stop(
        &self,
        target: &ServerId,
        ip_address: IpAddr,
        primary_port: u16,
    ) -> ServerResult<()> {
        timeout(Duration::from_secs(PUSH_CALL_TIMEOUT_SECS), async {
            let roles = client::query_roles(SocketAddr::new(ip_address, primary_port)).await?;
            let sr_port = client::role_port(&roles, RoleType::SrNeighbor)?;
            let mut peer =
                PeerClient::connect_tls(&self.connector, SocketAddr::new(ip_address, sr_port))
                    .await?;
            peer.start_conversation(&self.ctx.keys).await?;
            if peer.server_network_id() != *target {
                return Err(ServerError::Rejected);
            }
            peer.verify_identity(&self.ctx.keys).await?;

            let mut stop = StopNeighborhoodUpdatesRequest { signature: Vec::new() };
            crate::proto::sign_request(&self.ctx.keys, &mut stop);
            let response =
                peer.call(request::Content::StopNeighborhoodUpdates(stop)).await?;
            expect_ok(&response)
        })
        .await
        .map_err(|_| ServerError::Internal("stop notification timed out".into()))?
    }

    async fn record_failure(
        &self,
        mut head: NeighborhoodAction,
        direction: QueueDirection,
        error: &ServerError,
    ) -> ServerResult<()> {
        head.attempts += 1;

        if head.attempts >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                "Target {} unreachable after {} failures, dropping its queue ({})",
                hex::encode(&head.server_id[..8]),
                head.attempts,
                error
            );
            self.ctx.store.delete_actions_for_target(&head.server_id)?;
            match direction {
                QueueDirection::Follower => {
                    self.ctx.store.remove_follower(&head.server_id)?;
                }
                QueueDirection::Neighbor => {
                    // Local cleanup runs as a follow-up action.
                    let cleanup = self.ctx.store.make_action(
                        head.server_id,
                        &ActionData::RemoveNeighbor {},
                        None,
                        None,
                    )?;
                    self.ctx.store.enqueue_action(&cleanup)?;
                    self.ctx.action_wakeup.notify_one();
                }
            }
            return Ok(());
        }

        let delay = backoff_delay(head.attempts);
        head.execute_after = Some(now() + delay);
        self.ctx.store.update_action(&head)?;
        debug!(
            "Action {} for {} failed (attempt {}), retrying in {}s: {}",
            head.id,
            hex::encode(&head.server_id[..8]),
            head.attempts,
            delay,
            error
        );
        Ok(())
    }
}
