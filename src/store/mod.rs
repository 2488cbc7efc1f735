//! Persistent entity store.
//!
//! One sled tree per table, bincode values. Keys are prefixed where a tree
//! carries a secondary index:
//!
//! | tree                | key                                   | value |
//! |---------------------|---------------------------------------|-------|
//! | `hosted`            | `id/<identity>`                       | [`HostedIdentityRecord`] |
//! | `hosted`            | `exp/<be64 expires>/<identity>`       | empty (reap index) |
//! | `actions`           | `id/<be64 action-id>`                 | [`NeighborhoodAction`] |
//! | `actions`           | `tgt/<server>/<be64 action-id>`       | empty (per-target order) |
//! | `neighbor_profiles` | `<server><identity>`                  | [`NeighborIdentityRecord`] |
//! | `neighbors`         | `<server>`                            | [`PeerServerRecord`] |
//! | `followers`         | `<server>`                            | [`PeerServerRecord`] |
//! | `related`           | `<identity><application>`             | [`RelatedIdentityRecord`] |
//! | `settings`          | name                                  | raw bytes |
//!
//! Mutations that must create follower actions atomically run as sled
//! multi-tree transactions; bulk mirror replacement uses an atomic batch.

pub mod records;

use crate::error::{ServerError, ServerResult};
use crate::types::{now, IdentityId, ServerId};
use records::{
    ActionData, HostedIdentityRecord, NeighborIdentityRecord, NeighborhoodAction,
    PeerServerRecord, RelatedIdentityRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use sled::transaction::Transactional;
use sled::Batch;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const HOSTED_PREFIX: &[u8] = b"id/";
const HOSTED_EXPIRY_PREFIX: &[u8] = b"exp/";
const ACTION_PREFIX: &[u8] = b"id/";
const ACTION_TARGET_PREFIX: &[u8] = b"tgt/";

/// Key in the hosted tree holding the count of non-cancelled identities.
/// Living in the same tree keeps admission a single-tree transaction.
const ACTIVE_COUNT_KEY: &[u8] = b"meta/active_count";

pub const SETTING_SERVER_SECRET_KEY: &str = "server_secret_key";
pub const SETTING_IPNS_SEQUENCE: &str = "ipns_sequence";
pub const SETTING_CAN_RECORD_HASH: &str = "can_record_hash";
pub const SETTING_PRIMARY_ADDRESS: &str = "primary_address";

fn enc<T: Serialize>(value: &T) -> ServerResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> ServerResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn hosted_key(id: &IdentityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(HOSTED_PREFIX.len() + 32);
    key.extend_from_slice(HOSTED_PREFIX);
    key.extend_from_slice(id);
    key
}

fn hosted_expiry_key(expires_at: u64, id: &IdentityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(HOSTED_EXPIRY_PREFIX.len() + 8 + 32);
    key.extend_from_slice(HOSTED_EXPIRY_PREFIX);
    key.extend_from_slice(&expires_at.to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn action_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACTION_PREFIX.len() + 8);
    key.extend_from_slice(ACTION_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn action_target_key(server_id: &ServerId, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACTION_TARGET_PREFIX.len() + 32 + 8);
    key.extend_from_slice(ACTION_TARGET_PREFIX);
    key.extend_from_slice(server_id);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn neighbor_profile_key(server_id: &ServerId, identity_id: &IdentityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(server_id);
    key.extend_from_slice(identity_id);
    key
}

fn related_key(identity_id: &IdentityId, application_id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + application_id.len());
    key.extend_from_slice(identity_id);
    key.extend_from_slice(application_id);
    key
}

fn decode_u64(bytes: &[u8]) -> u64 {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    hosted: sled::Tree,
    actions: sled::Tree,
    neighbors: sled::Tree,
    followers: sled::Tree,
    neighbor_profiles: sled::Tree,
    related: sled::Tree,
    settings: sled::Tree,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            hosted: db.open_tree("hosted")?,
            actions: db.open_tree("actions")?,
            neighbors: db.open_tree("neighbors")?,
            followers: db.open_tree("followers")?,
            neighbor_profiles: db.open_tree("neighbor_profiles")?,
            related: db.open_tree("related")?,
            settings: db.open_tree("settings")?,
            db,
        })
    }

    pub fn flush(&self) -> ServerResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> ServerResult<Option<Vec<u8>>> {
        Ok(self.settings.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put_setting(&self, key: &str, value: &[u8]) -> ServerResult<()> {
        self.settings.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_setting_u64(&self, key: &str) -> ServerResult<u64> {
        Ok(self.get_setting(key)?.map(|v| decode_u64(&v)).unwrap_or(0))
    }

    pub fn put_setting_u64(&self, key: &str, value: u64) -> ServerResult<()> {
        self.put_setting(key, &value.to_be_bytes())
    }

    // =========================================================================
    // HOSTED IDENTITIES
    // =========================================================================

    pub fn hosted_active_count(&self) -> ServerResult<u64> {
        Ok(self.hosted.get(ACTIVE_COUNT_KEY)?.map(|v| decode_u64(&v)).unwrap_or(0))
    }

    pub fn get_hosted(&self, id: &IdentityId) -> ServerResult<Option<HostedIdentityRecord>> {
        match self.hosted.get(hosted_key(id))? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Admit a new hosting under the capacity cap. A cancelled row for the
    /// same key is replaced; a live row fails with AlreadyExists.
    pub fn register_hosting(
        &self,
        record: &HostedIdentityRecord,
        max_hosted: usize,
    ) -> ServerResult<()> {
        let key = hosted_key(&record.identity_id);
        let value = enc(record)?;

        self.hosted
            .transaction(|hosted| {
                if let Some(existing) = hosted.get(key.as_slice())? {
                    let existing: HostedIdentityRecord =
                        dec(&existing).map_err(ConflictableTransactionError::Abort)?;
                    if !existing.cancelled {
                        return Err(ConflictableTransactionError::Abort(
                            ServerError::AlreadyExists,
                        ));
                    }
                    if let Some(at) = existing.cancelled_expires_at {
                        hosted.remove(hosted_expiry_key(at, &existing.identity_id))?;
                    }
                }

                let count = hosted
                    .get(ACTIVE_COUNT_KEY)?
                    .map(|v| decode_u64(&v))
                    .unwrap_or(0);
                if count >= max_hosted as u64 {
                    return Err(ConflictableTransactionError::Abort(ServerError::QuotaExceeded));
                }

                hosted.insert(key.as_slice(), value.as_slice())?;
                hosted.insert(ACTIVE_COUNT_KEY, &(count + 1).to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(ServerError::from)
    }

    /// Store a hosted-identity mutation together with the follower actions
    /// it caused, atomically.
    pub fn update_hosted_with_actions(
        &self,
        record: &HostedIdentityRecord,
        actions: &[NeighborhoodAction],
    ) -> ServerResult<()> {
        let key = hosted_key(&record.identity_id);
        let value = enc(record)?;
        let encoded: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = actions
            .iter()
            .map(|a| {
                Ok((
                    action_key(a.id),
                    action_target_key(&a.server_id, a.id),
                    enc(a)?,
                ))
            })
            .collect::<ServerResult<_>>()?;

        (&self.hosted, &self.actions)
            .transaction(|(hosted, action_tree)| {
                hosted.insert(key.as_slice(), value.as_slice())?;
                for (id_key, tgt_key, action_value) in &encoded {
                    action_tree.insert(id_key.as_slice(), action_value.as_slice())?;
                    action_tree.insert(tgt_key.as_slice(), &[] as &[u8])?;
                }
                Ok::<_, ConflictableTransactionError<ServerError>>(())
            })
            .map_err(ServerError::from)
    }

    /// Mark a hosting cancelled: writes the record, the reap index entry,
    /// the RemoveProfile actions, and decrements the active count in one
    /// transaction.
    pub fn cancel_hosted_with_actions(
        &self,
        record: &HostedIdentityRecord,
        actions: &[NeighborhoodAction],
    ) -> ServerResult<()> {
        let expires_at = record.cancelled_expires_at.ok_or_else(|| {
            ServerError::Internal("cancelled record without expiration".into())
        })?;
        let key = hosted_key(&record.identity_id);
        let value = enc(record)?;
        let expiry_key = hosted_expiry_key(expires_at, &record.identity_id);
        let encoded: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = actions
            .iter()
            .map(|a| {
                Ok((
                    action_key(a.id),
                    action_target_key(&a.server_id, a.id),
                    enc(a)?,
                ))
            })
            .collect::<ServerResult<_>>()?;

        (&self.hosted, &self.actions)
            .transaction(|(hosted, action_tree)| {
                hosted.insert(key.as_slice(), value.as_slice())?;
                hosted.insert(expiry_key.as_slice(), &[] as &[u8])?;
                for (id_key, tgt_key, action_value) in &encoded {
                    action_tree.insert(id_key.as_slice(), action_value.as_slice())?;
                    action_tree.insert(tgt_key.as_slice(), &[] as &[u8])?;
                }
                let count = hosted
                    .get(ACTIVE_COUNT_KEY)?
                    .map(|v| decode_u64(&v))
                    .unwrap_or(0);
                hosted.insert(ACTIVE_COUNT_KEY, &count.saturating_sub(1).to_be_bytes()[..])?;
                Ok::<_, ConflictableTransactionError<ServerError>>(())
            })
            .map_err(ServerError::from)
    }

    pub fn hosted_iter(
        &self,
    ) -> impl Iterator<Item = ServerResult<HostedIdentityRecord>> + '_ {
        self.hosted.scan_prefix(HOSTED_PREFIX).map(|item| {
            let (_, value) = item?;
            dec(&value)
        })
    }

    /// Cancelled hostings whose retention expired; returns reap keys.
    pub fn expired_hostings(&self, cutoff: u64) -> ServerResult<Vec<(Vec<u8>, IdentityId)>> {
        let mut expired = Vec::new();
        for item in self.hosted.scan_prefix(HOSTED_EXPIRY_PREFIX) {
            let (key, _) = item?;
            let rest = &key[HOSTED_EXPIRY_PREFIX.len()..];
            if rest.len() != 8 + 32 {
                continue;
            }
            let expires_at = decode_u64(&rest[..8]);
            if expires_at >= cutoff {
                break;
            }
            let identity_id: IdentityId = rest[8..]
                .try_into()
                .map_err(|_| ServerError::Internal("malformed expiry key".into()))?;
            expired.push((key.to_vec(), identity_id));
        }
        Ok(expired)
    }

    pub fn reap_hosting(&self, expiry_key: &[u8], identity_id: &IdentityId) -> ServerResult<()> {
        let mut batch = Batch::default();
        batch.remove(hosted_key(identity_id));
        batch.remove(expiry_key);
        self.hosted.apply_batch(batch)?;
        Ok(())
    }

    // =========================================================================
    // NEIGHBORS AND FOLLOWERS
    // =========================================================================

    pub fn put_neighbor(&self, record: &PeerServerRecord) -> ServerResult<()> {
        self.neighbors.insert(&record.network_id, enc(record)?)?;
        Ok(())
    }

    pub fn get_neighbor(&self, id: &ServerId) -> ServerResult<Option<PeerServerRecord>> {
        match self.neighbors.get(id)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_neighbor(&self, id: &ServerId) -> ServerResult<bool> {
        Ok(self.neighbors.remove(id)?.is_some())
    }

    pub fn neighbors(&self) -> ServerResult<Vec<PeerServerRecord>> {
        self.neighbors.iter().map(|item| {
            let (_, value) = item?;
            dec(&value)
        }).collect()
    }

    pub fn put_follower(&self, record: &PeerServerRecord) -> ServerResult<()> {
        self.followers.insert(&record.network_id, enc(record)?)?;
        Ok(())
    }

    pub fn get_follower(&self, id: &ServerId) -> ServerResult<Option<PeerServerRecord>> {
        match self.followers.get(id)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_follower(&self, id: &ServerId) -> ServerResult<bool> {
        Ok(self.followers.remove(id)?.is_some())
    }

    pub fn followers(&self) -> ServerResult<Vec<PeerServerRecord>> {
        self.followers.iter().map(|item| {
            let (_, value) = item?;
            dec(&value)
        }).collect()
    }

    pub fn initialized_followers(&self) -> ServerResult<Vec<PeerServerRecord>> {
        Ok(self.followers()?.into_iter().filter(|f| f.initialized).collect())
    }

    pub fn follower_count(&self) -> usize {
        self.followers.len()
    }

    // =========================================================================
    // NEIGHBOR PROFILE MIRROR
    // =========================================================================

    pub fn upsert_neighbor_profile(&self, record: &NeighborIdentityRecord) -> ServerResult<()> {
        let key = neighbor_profile_key(&record.hosting_server_id, &record.identity_id);
        self.neighbor_profiles.insert(key, enc(record)?)?;
        Ok(())
    }

    pub fn get_neighbor_profile(
        &self,
        server_id: &ServerId,
        identity_id: &IdentityId,
    ) -> ServerResult<Option<NeighborIdentityRecord>> {
        match self.neighbor_profiles.get(neighbor_profile_key(server_id, identity_id))? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_neighbor_profile(
        &self,
        server_id: &ServerId,
        identity_id: &IdentityId,
    ) -> ServerResult<bool> {
        Ok(self
            .neighbor_profiles
            .remove(neighbor_profile_key(server_id, identity_id))?
            .is_some())
    }

    /// Atomically replace the whole mirror for one neighbor; used when a
    /// neighborhood initialization finishes.
    pub fn replace_neighbor_profiles(
        &self,
        server_id: &ServerId,
        profiles: &[NeighborIdentityRecord],
    ) -> ServerResult<()> {
        let mut batch = Batch::default();
        for item in self.neighbor_profiles.scan_prefix(server_id) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for profile in profiles {
            let key = neighbor_profile_key(server_id, &profile.identity_id);
            batch.insert(key, enc(profile)?);
        }
        self.neighbor_profiles.apply_batch(batch)?;
        debug!(
            "Replaced neighbor mirror for {} with {} profiles",
            hex::encode(&server_id[..8]),
            profiles.len()
        );
        Ok(())
    }

    pub fn remove_neighbor_profiles_for(&self, server_id: &ServerId) -> ServerResult<usize> {
        let mut batch = Batch::default();
        let mut count = 0;
        for item in self.neighbor_profiles.scan_prefix(server_id) {
            let (key, _) = item?;
            batch.remove(key);
            count += 1;
        }
        self.neighbor_profiles.apply_batch(batch)?;
        Ok(count)
    }

    /// Drop mirrored profiles for `server_id` not present in `keep`; used
    /// when a RefreshProfiles carries the sender's full hosted set.
    pub fn retain_neighbor_profiles(
        &self,
        server_id: &ServerId,
        keep: &HashSet<IdentityId>,
    ) -> ServerResult<usize> {
        let mut batch = Batch::default();
        let mut dropped = 0;
        for item in self.neighbor_profiles.scan_prefix(server_id) {
            let (key, _) = item?;
            let identity: IdentityId = key[32..]
                .try_into()
                .map_err(|_| ServerError::Internal("malformed mirror key".into()))?;
            if !keep.contains(&identity) {
                batch.remove(key);
                dropped += 1;
            }
        }
        self.neighbor_profiles.apply_batch(batch)?;
        Ok(dropped)
    }

    pub fn neighbor_profiles_for(
        &self,
        server_id: &ServerId,
    ) -> impl Iterator<Item = ServerResult<NeighborIdentityRecord>> + '_ {
        self.neighbor_profiles.scan_prefix(server_id.to_vec()).map(|item| {
            let (_, value) = item?;
            dec(&value)
        })
    }

    pub fn neighbor_profiles_iter(
        &self,
    ) -> impl Iterator<Item = ServerResult<NeighborIdentityRecord>> + '_ {
        self.neighbor_profiles.iter().map(|item| {
            let (_, value) = item?;
            dec(&value)
        })
    }

    pub fn count_neighbor_profiles(&self, server_id: &ServerId) -> usize {
        self.neighbor_profiles.scan_prefix(server_id).count()
    }

    // =========================================================================
    // NEIGHBORHOOD ACTIONS
    // =========================================================================

    /// Build an action with a fresh monotonically increasing id.
    pub fn make_action(
        &self,
        server_id: ServerId,
        data: &ActionData,
        target_identity_id: Option<IdentityId>,
        execute_after: Option<u64>,
    ) -> ServerResult<NeighborhoodAction> {
        Ok(NeighborhoodAction {
            id: self.db.generate_id()?,
            server_id,
            action_type: data.action_type(),
            target_identity_id,
            timestamp: now(),
            execute_after,
            attempts: 0,
            additional_data: serde_json::to_string(data)?,
        })
    }

    pub fn enqueue_action(&self, action: &NeighborhoodAction) -> ServerResult<()> {
        let mut batch = Batch::default();
        batch.insert(action_key(action.id), enc(action)?);
        batch.insert(action_target_key(&action.server_id, action.id), &[] as &[u8]);
        self.actions.apply_batch(batch)?;
        Ok(())
    }

    pub fn update_action(&self, action: &NeighborhoodAction) -> ServerResult<()> {
        self.actions.insert(action_key(action.id), enc(action)?)?;
        Ok(())
    }

    pub fn delete_action(&self, action: &NeighborhoodAction) -> ServerResult<()> {
        let mut batch = Batch::default();
        batch.remove(action_key(action.id));
        batch.remove(action_target_key(&action.server_id, action.id));
        self.actions.apply_batch(batch)?;
        Ok(())
    }

    /// Pending actions for one target, in id (FIFO) order.
    pub fn actions_for_target(&self, server_id: &ServerId) -> ServerResult<Vec<NeighborhoodAction>> {
        let mut prefix = Vec::with_capacity(ACTION_TARGET_PREFIX.len() + 32);
        prefix.extend_from_slice(ACTION_TARGET_PREFIX);
        prefix.extend_from_slice(server_id);

        let mut actions = Vec::new();
        for item in self.actions.scan_prefix(&prefix) {
            let (key, _) = item?;
            let id = decode_u64(&key[prefix.len()..]);
            if let Some(bytes) = self.actions.get(action_key(id))? {
                actions.push(dec(&bytes)?);
            }
        }
        Ok(actions)
    }

    /// Every target server with at least one pending action.
    pub fn action_targets(&self) -> ServerResult<Vec<ServerId>> {
        let mut targets = Vec::new();
        let mut last: Option<ServerId> = None;
        for item in self.actions.scan_prefix(ACTION_TARGET_PREFIX) {
            let (key, _) = item?;
            let rest = &key[ACTION_TARGET_PREFIX.len()..];
            if rest.len() != 32 + 8 {
                continue;
            }
            let server: ServerId = rest[..32]
                .try_into()
                .map_err(|_| ServerError::Internal("malformed action key".into()))?;
            if last != Some(server) {
                targets.push(server);
                last = Some(server);
            }
        }
        Ok(targets)
    }

    pub fn delete_actions_for_target(&self, server_id: &ServerId) -> ServerResult<usize> {
        let actions = self.actions_for_target(server_id)?;
        let mut batch = Batch::default();
        for action in &actions {
            batch.remove(action_key(action.id));
            batch.remove(action_target_key(server_id, action.id));
        }
        self.actions.apply_batch(batch)?;
        Ok(actions.len())
    }

    pub fn pending_action_count(&self) -> usize {
        self.actions.scan_prefix(ACTION_PREFIX).count()
    }

    // =========================================================================
    // RELATED IDENTITIES
    // =========================================================================

    pub fn put_related(&self, record: &RelatedIdentityRecord) -> ServerResult<()> {
        let key = related_key(&record.identity_id, &record.application_id);
        self.related.insert(key, enc(record)?)?;
        Ok(())
    }

    pub fn get_related(
        &self,
        identity_id: &IdentityId,
        application_id: &[u8],
    ) -> ServerResult<Option<RelatedIdentityRecord>> {
        match self.related.get(related_key(identity_id, application_id))? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_related(
        &self,
        identity_id: &IdentityId,
        application_id: &[u8],
    ) -> ServerResult<bool> {
        Ok(self.related.remove(related_key(identity_id, application_id))?.is_some())
    }

    pub fn related_for(&self, identity_id: &IdentityId) -> ServerResult<Vec<RelatedIdentityRecord>> {
        self.related.scan_prefix(identity_id).map(|item| {
            let (_, value) = item?;
            dec(&value)
        }).collect()
    }
}
