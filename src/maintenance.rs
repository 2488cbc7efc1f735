//! Background maintenance.
//!
//! | Job                      | Period         | Effect |
//! |--------------------------|----------------|--------|
//! | Reap cancelled hostings  | 1 h            | delete rows past their retention |
//! | Expire stale neighbors   | 1 h            | purge mirror, queue a stop notice |
//! | Refresh followers        | checked 10 min | queue RefreshProfiles every 12 h |
//! | Refresh contact record   | 17 s default   | re-publish via the CAN gateway |
//!
//! Every job is idempotent and safe to run while client traffic mutates the
//! same tables.

use crate::can::CanClient;
use crate::context::ServerContext;
use crate::error::ServerResult;
use crate::store::records::ActionData;
use crate::types::{now, IdentityId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

const HOSTING_REAP_INTERVAL_SECS: u64 = 3600;
const NEIGHBOR_EXPIRY_INTERVAL_SECS: u64 = 3600;
const FOLLOWER_REFRESH_CHECK_SECS: u64 = 600;

pub async fn run(ctx: Arc<ServerContext>, can: Arc<CanClient>) {
    let mut reap = interval(Duration::from_secs(HOSTING_REAP_INTERVAL_SECS));
    let mut neighbor_expiry = interval(Duration::from_secs(NEIGHBOR_EXPIRY_INTERVAL_SECS));
    let mut follower_refresh = interval(Duration::from_secs(FOLLOWER_REFRESH_CHECK_SECS));
    let mut can_refresh = interval(Duration::from_secs(ctx.config.can_refresh_secs.max(1)));
    let mut shutdown = ctx.shutdown.clone();

    info!("Maintenance scheduler started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = reap.tick() => {
                if let Err(e) = reap_cancelled_hostings(&ctx) {
                    warn!("Reaping cancelled hostings failed: {e}");
                }
            }
            _ = neighbor_expiry.tick() => {
                if let Err(e) = expire_stale_neighbors(&ctx) {
                    warn!("Expiring stale neighbors failed: {e}");
                }
            }
            _ = follower_refresh.tick() => {
                if let Err(e) = refresh_followers(&ctx) {
                    warn!("Scheduling follower refreshes failed: {e}");
                }
            }
            _ = can_refresh.tick(), if can.enabled() => {
                if let Err(e) = can.refresh_contact_record(&ctx).await {
                    warn!("Contact record refresh failed: {e}");
                }
            }
        }
    }

    can.delete_record(&ctx).await;
    info!("Maintenance scheduler stopped");
}

/// Delete cancelled hostings whose retention window passed.
pub fn reap_cancelled_hostings(ctx: &Arc<ServerContext>) -> ServerResult<usize> {
    let expired = ctx.store.expired_hostings(now())?;
    for (expiry_key, identity_id) in &expired {
        ctx.store.reap_hosting(expiry_key, identity_id)?;
        debug!("Reaped cancelled hosting {}", hex::encode(&identity_id[..8]));
    }
    if !expired.is_empty() {
        info!("Reaped {} expired cancelled hostings", expired.len());
    }
    Ok(expired.len())
}

/// Purge neighbors that stopped refreshing, with a stop notice so they drop
/// us from their follower lists.
pub fn expire_stale_neighbors(ctx: &Arc<ServerContext>) -> ServerResult<usize> {
    let cutoff = now().saturating_sub(ctx.config.neighborhood_expiration_secs);
    let mut expired = 0;

    for neighbor in ctx.store.neighbors()? {
        if neighbor.last_refresh_time >= cutoff {
            continue;
        }
        expired += 1;
        info!(
            "Neighbor {} expired (last refresh {}s ago)",
            hex::encode(&neighbor.network_id[..8]),
            now().saturating_sub(neighbor.last_refresh_time)
        );

        ctx.store.delete_actions_for_target(&neighbor.network_id)?;
        let profiles = ctx.store.remove_neighbor_profiles_for(&neighbor.network_id)?;
        ctx.store.remove_neighbor(&neighbor.network_id)?;
        debug!("Purged {profiles} mirrored profiles");

        let stop = ctx.store.make_action(
            neighbor.network_id,
            &ActionData::StopNeighborhoodUpdates {
                ip_address: neighbor.ip_address,
                primary_port: neighbor.primary_port,
            },
            None,
            None,
        )?;
        ctx.store.enqueue_action(&stop)?;
    }

    if expired > 0 {
        ctx.action_wakeup.notify_one();
    }
    Ok(expired)
}

/// Queue a RefreshProfiles (carrying the full hosted id set) to every
/// initialized follower whose last refresh is older than the refresh period.
pub fn refresh_followers(ctx: &Arc<ServerContext>) -> ServerResult<usize> {
    let threshold = now().saturating_sub(ctx.config.follower_refresh_secs);
    let due: Vec<_> = ctx
        .store
        .initialized_followers()?
        .into_iter()
        .filter(|f| f.last_refresh_time < threshold)
        .collect();
    if due.is_empty() {
        return Ok(0);
    }

    let mut identity_ids: Vec<IdentityId> = Vec::new();
    for item in ctx.store.hosted_iter() {
        let record = item?;
        if record.initialized && !record.cancelled {
            identity_ids.push(record.identity_id);
        }
    }

    for mut follower in due.clone() {
        let refresh = ctx.store.make_action(
            follower.network_id,
            &ActionData::RefreshProfiles { identity_ids: identity_ids.clone() },
            None,
            None,
        )?;
        ctx.store.enqueue_action(&refresh)?;
        follower.last_refresh_time = now();
        ctx.store.put_follower(&follower)?;
        debug!(
            "Queued profile refresh for follower {}",
            hex::encode(&follower.network_id[..8])
        );
    }

    ctx.action_wakeup.notify_one();
    Ok(due.len())
}
