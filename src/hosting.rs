//! Hosted-identity lifecycle: admission, profile updates, cancellation,
//! and relationship cards.
//!
//! Admission runs under one global agreement lock so the capacity cap holds
//! under any interleaving; profile mutation takes a per-identity row lock so
//! concurrent updates to the same identity apply in arrival order. Every
//! mutation that must reach followers enqueues its replication actions in
//! the same store transaction.

use crate::config::Config;
use crate::crypto;
use crate::error::{ServerError, ServerResult};
use crate::images::{ImageStore, StagedImage};
use crate::proto::{RelationshipCard, UpdateProfileRequest};
use crate::store::records::{
    ActionData, HostedIdentityRecord, ProfileSnapshot, RelatedIdentityRecord,
};
use crate::store::Store;
use crate::types::{
    now, GpsLocation, Hash, IdentityId, ProfileVersion, ServerId, MAX_PROFILE_EXTRA_DATA_BYTES,
    MAX_PROFILE_NAME_BYTES, MAX_PROFILE_TYPE_BYTES,
};
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Cap on relationship cards stored per hosted identity.
const MAX_RELATED_CARDS: usize = 100;

/// Cap on application id length in a relationship card.
const MAX_APPLICATION_ID_BYTES: usize = 64;

pub struct HostingManager {
    store: Store,
    images: ImageStore,
    max_hosted: usize,
    cancellation_retention_secs: u64,
    /// HostingAgreementLock: serializes capacity admission.
    agreement_lock: Mutex<()>,
    row_locks: Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>,
    action_wakeup: Arc<Notify>,
}

impl HostingManager {
    pub fn new(
        store: Store,
        images: ImageStore,
        config: &Config,
        action_wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            images,
            max_hosted: config.max_hosted_identities,
            cancellation_retention_secs: config.cancellation_retention_secs,
            agreement_lock: Mutex::new(()),
            row_locks: Mutex::new(HashMap::new()),
            action_wakeup,
        }
    }

    async fn row_lock(&self, identity_id: IdentityId) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks.entry(identity_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    // =========================================================================
    // HOSTING AGREEMENT
    // =========================================================================

    /// Reserve a hosting row for a new public key under the capacity cap.
    pub async fn register(&self, public_key: &[u8]) -> ServerResult<IdentityId> {
        if public_key.len() != crypto::PUBLIC_KEY_SIZE {
            return Err(ServerError::invalid_value("public key must be 32 bytes"));
        }

        let _admission = self.agreement_lock.lock().await;
        let record = HostedIdentityRecord::reserve(public_key.to_vec(), now());
        let identity_id = record.identity_id;
        self.store.register_hosting(&record, self.max_hosted)?;
        info!("Hosting agreement for identity {}", hex::encode(&identity_id[..8]));
        Ok(identity_id)
    }

    // =========================================================================
    // PROFILE UPDATE
    // =========================================================================

    pub async fn update_profile(
        &self,
        identity_id: IdentityId,
        req: &UpdateProfileRequest,
    ) -> ServerResult<()> {
        let row = self.row_lock(identity_id).await;
        let _guard = row.lock().await;

        let mut record = self
            .store
            .get_hosted(&identity_id)?
            .filter(|r| !r.cancelled)
            .ok_or(ServerError::NotFound)?;

        let first_update = !record.initialized;
        if first_update {
            require_initial_fields(req)?;
        }

        apply_scalar_fields(&mut record, req)?;

        let mut staged: Vec<StagedImage> = Vec::new();
        let staging = apply_image_field(
            &self.images,
            &mut staged,
            &req.profile_image_hash,
            &req.profile_image,
            &mut record.profile_image_hash,
        )
        .and_then(|()| {
            apply_image_field(
                &self.images,
                &mut staged,
                &req.thumbnail_image_hash,
                &req.thumbnail_image,
                &mut record.thumbnail_image_hash,
            )
        });
        if let Err(e) = staging {
            for image in staged {
                self.images.discard(image);
            }
            return Err(e);
        }

        // The stored signature must verify over the resulting canonical
        // profile; initialized rows always carry a valid signature.
        let canonical = record.profile_information().canonical_bytes();
        if crypto::verify(&record.public_key, &canonical, &req.profile_signature).is_err() {
            for image in staged {
                self.images.discard(image);
            }
            return Err(ServerError::InvalidSignature);
        }
        record.signature = req.profile_signature.clone();
        record.initialized = true;

        let mut actions = Vec::new();
        if !req.no_propagation {
            let snapshot = ProfileSnapshot::of(&record);
            let data = if first_update {
                ActionData::AddProfile { profile: snapshot }
            } else {
                ActionData::ChangeProfile { profile: snapshot }
            };
            for follower in self.store.initialized_followers()? {
                actions.push(self.store.make_action(
                    follower.network_id,
                    &data,
                    Some(identity_id),
                    None,
                )?);
            }
        }

        match self.store.update_hosted_with_actions(&record, &actions) {
            Ok(()) => {}
            Err(e) => {
                for image in staged {
                    self.images.discard(image);
                }
                return Err(e);
            }
        }

        for image in staged {
            self.images.commit(image)?;
        }
        if !actions.is_empty() {
            self.action_wakeup.notify_one();
        }

        debug!(
            "Profile {} for {} (version {})",
            if first_update { "initialized" } else { "updated" },
            hex::encode(&identity_id[..8]),
            record.version
        );
        Ok(())
    }

    // =========================================================================
    // CANCELLATION
    // =========================================================================

    pub async fn cancel_hosting(
        &self,
        identity_id: IdentityId,
        new_hosting_server_id: Option<ServerId>,
    ) -> ServerResult<()> {
        let row = self.row_lock(identity_id).await;
        let _guard = row.lock().await;

        let mut record = self
            .store
            .get_hosted(&identity_id)?
            .filter(|r| !r.cancelled)
            .ok_or(ServerError::NotFound)?;

        record.cancelled = true;
        record.cancelled_expires_at = Some(now() + self.cancellation_retention_secs);
        record.moved_to_server_id = new_hosting_server_id;

        let mut actions = Vec::new();
        if record.initialized {
            let data = ActionData::RemoveProfile { identity_id };
            for follower in self.store.initialized_followers()? {
                actions.push(self.store.make_action(
                    follower.network_id,
                    &data,
                    Some(identity_id),
                    None,
                )?);
            }
        }

        self.store.cancel_hosted_with_actions(&record, &actions)?;
        if !actions.is_empty() {
            self.action_wakeup.notify_one();
        }

        info!("Hosting cancelled for {}", hex::encode(&identity_id[..8]));
        Ok(())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get_hosted(&self, identity_id: &IdentityId) -> ServerResult<Option<HostedIdentityRecord>> {
        self.store.get_hosted(identity_id)
    }

    pub fn load_image(&self, hash: Option<Hash>, wanted: bool) -> ServerResult<Option<Vec<u8>>> {
        match (wanted, hash) {
            (true, Some(hash)) => self.images.get(&hash),
            _ => Ok(None),
        }
    }

    // =========================================================================
    // RELATIONSHIP CARDS
    // =========================================================================

    pub async fn add_related(
        &self,
        identity_id: IdentityId,
        identity_public_key: &[u8],
        card: &RelationshipCard,
    ) -> ServerResult<()> {
        validate_relationship_card(identity_public_key, card)?;

        let row = self.row_lock(identity_id).await;
        let _guard = row.lock().await;

        if self.store.get_related(&identity_id, &card.application_id)?.is_some() {
            return Err(ServerError::AlreadyExists);
        }
        if self.store.related_for(&identity_id)?.len() >= MAX_RELATED_CARDS {
            return Err(ServerError::QuotaExceeded);
        }

        let record =
            RelatedIdentityRecord::from_card(identity_id, card.application_id.clone(), card);
        self.store.put_related(&record)
    }

    pub async fn remove_related(
        &self,
        identity_id: IdentityId,
        application_id: &[u8],
    ) -> ServerResult<()> {
        let row = self.row_lock(identity_id).await;
        let _guard = row.lock().await;

        if self.store.remove_related(&identity_id, application_id)? {
            Ok(())
        } else {
            Err(ServerError::NotFound)
        }
    }

    pub fn relationships(
        &self,
        identity_id: &IdentityId,
        include_invalid: bool,
        card_type: &str,
        issuer_id: &[u8],
    ) -> ServerResult<Vec<RelatedIdentityRecord>> {
        let time = now();
        Ok(self
            .store
            .related_for(identity_id)?
            .into_iter()
            .filter(|card| include_invalid || card.is_valid_at(time))
            .filter(|card| card_type.is_empty() || card.card_type == card_type)
            .filter(|card| {
                issuer_id.is_empty()
                    || crypto::identity_id(&card.issuer_public_key).as_slice() == issuer_id
            })
            .collect())
    }
}

fn require_initial_fields(req: &UpdateProfileRequest) -> ServerResult<()> {
    let missing = if req.version.is_none() {
        Some("version")
    } else if req.name.is_none() {
        Some("name")
    } else if req.profile_type.is_none() {
        Some("type")
    } else if req.latitude.is_none() || req.longitude.is_none() {
        Some("location")
    } else {
        None
    };
    match missing {
        Some(field) => Err(ServerError::InvalidValue(format!(
            "first update must supply the whole profile, missing {field}"
        ))),
        None => Ok(()),
    }
}

fn apply_scalar_fields(
    record: &mut HostedIdentityRecord,
    req: &UpdateProfileRequest,
) -> ServerResult<()> {
    if let Some(version) = &req.version {
        let version = ProfileVersion::from_bytes(version)
            .ok_or_else(|| ServerError::invalid_value("version must be 3 bytes"))?;
        if version.is_zero() {
            return Err(ServerError::invalid_value("version must not be 0.0.0"));
        }
        record.version = version;
    }
    if let Some(name) = &req.name {
        if name.len() > MAX_PROFILE_NAME_BYTES {
            return Err(ServerError::invalid_value("name too long"));
        }
        record.name = name.clone();
    }
    if let Some(profile_type) = &req.profile_type {
        if profile_type.len() > MAX_PROFILE_TYPE_BYTES {
            return Err(ServerError::invalid_value("type too long"));
        }
        record.profile_type = profile_type.clone();
    }
    if let Some(extra_data) = &req.extra_data {
        if extra_data.len() > MAX_PROFILE_EXTRA_DATA_BYTES {
            return Err(ServerError::invalid_value("extraData too long"));
        }
        record.extra_data = extra_data.clone();
    }
    match (req.latitude, req.longitude) {
        (Some(latitude), Some(longitude)) => {
            record.location = GpsLocation::new(latitude, longitude)
                .ok_or_else(|| ServerError::invalid_value("location out of range"))?;
        }
        (None, None) => {}
        _ => {
            return Err(ServerError::invalid_value(
                "latitude and longitude must be set together",
            ))
        }
    }
    Ok(())
}

/// Resolve one image field of an update.
///
/// An absent hash keeps the stored image; an empty hash clears it; a hash
/// with inline bytes stages the upload; a bare hash must already exist in
/// the blob store.
fn apply_image_field(
    images: &ImageStore,
    staged: &mut Vec<StagedImage>,
    hash_field: &Option<Vec<u8>>,
    bytes_field: &Option<Vec<u8>>,
    stored: &mut Option<Hash>,
) -> ServerResult<()> {
    match (hash_field, bytes_field) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(ServerError::invalid_value("image bytes without declared hash")),
        (Some(hash), bytes) if hash.is_empty() => {
            if bytes.is_some() {
                return Err(ServerError::invalid_value("image bytes with empty hash"));
            }
            *stored = None;
            Ok(())
        }
        (Some(hash), bytes) => {
            let hash: Hash = hash
                .as_slice()
                .try_into()
                .map_err(|_| ServerError::invalid_value("image hash must be 32 bytes"))?;
            match bytes {
                Some(data) => staged.push(images.stage(&hash, data)?),
                None if !images.contains(&hash) => {
                    return Err(ServerError::invalid_value("unknown image hash"))
                }
                None => {}
            }
            *stored = Some(hash);
            Ok(())
        }
    }
}

fn validate_relationship_card(
    identity_public_key: &[u8],
    card: &RelationshipCard,
) -> ServerResult<()> {
    if card.recipient_public_key != identity_public_key {
        return Err(ServerError::invalid_value("card recipient is not this identity"));
    }
    if card.card_version.len() != 3 {
        return Err(ServerError::invalid_value("card version must be 3 bytes"));
    }
    if card.application_id.is_empty() || card.application_id.len() > MAX_APPLICATION_ID_BYTES {
        return Err(ServerError::invalid_value("bad application id"));
    }
    if card.valid_from > card.valid_to {
        return Err(ServerError::invalid_value("card validity window is inverted"));
    }

    let mut base = card.clone();
    base.card_id.clear();
    base.issuer_signature.clear();
    base.recipient_signature.clear();
    let expected_id = crypto::sha256(&base.encode_to_vec());
    if card.card_id != expected_id {
        return Err(ServerError::invalid_value("card id does not match card contents"));
    }

    crypto::verify(&card.issuer_public_key, &card.card_id, &card.issuer_signature)
        .map_err(|_| ServerError::InvalidSignature)?;

    let mut recipient_base = card.clone();
    recipient_base.recipient_signature.clear();
    let recipient_digest = crypto::sha256(&recipient_base.encode_to_vec());
    crypto::verify(
        &card.recipient_public_key,
        &recipient_digest,
        &card.recipient_signature,
    )
    .map_err(|_| ServerError::InvalidSignature)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::proto::ProfileInformation;

    fn manager() -> (tempfile::TempDir, HostingManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let images =
            ImageStore::open(&dir.path().join("images"), &dir.path().join("tmp")).unwrap();
        let config = Config { max_hosted_identities: 2, ..Config::default() };
        let manager = HostingManager::new(store, images, &config, Arc::new(Notify::new()));
        (dir, manager)
    }

    fn initial_update(keys: &Keypair, name: &str) -> UpdateProfileRequest {
        let profile = ProfileInformation {
            version: vec![1, 0, 0],
            public_key: keys.public.to_vec(),
            profile_type: "person".into(),
            name: name.into(),
            extra_data: String::new(),
            latitude: 0,
            longitude: 0,
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        };
        UpdateProfileRequest {
            version: Some(vec![1, 0, 0]),
            name: Some(name.into()),
            profile_type: Some("person".into()),
            latitude: Some(0),
            longitude: Some(0),
            profile_signature: keys.sign(&profile.canonical_bytes()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn admission_respects_the_cap() {
        let (_dir, manager) = manager();
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();

        manager.register(&a.public).await.unwrap();
        manager.register(&b.public).await.unwrap();
        assert!(matches!(
            manager.register(&c.public).await,
            Err(ServerError::QuotaExceeded)
        ));

        // Cancelling one frees a slot
        manager.cancel_hosting(a.identity_id(), None).await.unwrap();
        manager.register(&c.public).await.unwrap();
    }

    #[tokio::test]
    async fn first_update_must_be_complete() {
        let (_dir, manager) = manager();
        let keys = Keypair::generate();
        let id = manager.register(&keys.public).await.unwrap();

        let incomplete = UpdateProfileRequest {
            name: Some("alice".into()),
            ..Default::default()
        };
        assert!(matches!(
            manager.update_profile(id, &incomplete).await,
            Err(ServerError::InvalidValue(_))
        ));
        assert!(!manager.get_hosted(&id).unwrap().unwrap().initialized);

        manager.update_profile(id, &initial_update(&keys, "alice")).await.unwrap();
        let record = manager.get_hosted(&id).unwrap().unwrap();
        assert!(record.initialized);
        assert_eq!(record.name, "alice");
    }

    #[tokio::test]
    async fn tampered_profile_signature_changes_nothing() {
        let (_dir, manager) = manager();
        let keys = Keypair::generate();
        let id = manager.register(&keys.public).await.unwrap();
        manager.update_profile(id, &initial_update(&keys, "alice")).await.unwrap();

        let mut update = initial_update(&keys, "bob");
        update.profile_signature[7] ^= 1;
        assert!(matches!(
            manager.update_profile(id, &update).await,
            Err(ServerError::InvalidSignature)
        ));
        assert_eq!(manager.get_hosted(&id).unwrap().unwrap().name, "alice");
    }
}
