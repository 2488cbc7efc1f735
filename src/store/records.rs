//! Persisted entity records.
//!
//! Records are bincode-encoded sled values. Wire conversions live next to
//! each record so the store stays the single place that knows both shapes.

use crate::crypto;
use crate::error::{ServerError, ServerResult};
use crate::proto::{ProfileInformation, RelationshipCard, SignedProfile};
use crate::types::{
    GpsLocation, Hash, IdentityId, ProfileVersion, ServerId, MAX_PROFILE_EXTRA_DATA_BYTES,
    MAX_PROFILE_NAME_BYTES, MAX_PROFILE_TYPE_BYTES,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// =============================================================================
// HOSTED IDENTITY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedIdentityRecord {
    pub identity_id: IdentityId,
    pub public_key: Vec<u8>,
    pub version: ProfileVersion,
    pub name: String,
    pub profile_type: String,
    pub extra_data: String,
    pub location: GpsLocation,
    pub profile_image_hash: Option<Hash>,
    pub thumbnail_image_hash: Option<Hash>,
    /// Owner's signature over the canonical profile encoding.
    pub signature: Vec<u8>,
    pub initialized: bool,
    pub cancelled: bool,
    /// Set when cancelled; the record is reapable after this time.
    pub cancelled_expires_at: Option<u64>,
    /// Server the identity moved to; drives redirects after cancellation.
    pub moved_to_server_id: Option<ServerId>,
    /// Hash of the externally announced contact object, if any.
    pub can_object_hash: Option<Hash>,
    pub created_at: u64,
}

impl HostedIdentityRecord {
    /// Fresh reservation for a public key; uninitialized until the first
    /// complete profile update.
    pub fn reserve(public_key: Vec<u8>, now: u64) -> Self {
        Self {
            identity_id: crypto::identity_id(&public_key),
            public_key,
            version: ProfileVersion::ZERO,
            name: String::new(),
            profile_type: String::new(),
            extra_data: String::new(),
            location: GpsLocation { latitude: 0, longitude: 0 },
            profile_image_hash: None,
            thumbnail_image_hash: None,
            signature: Vec::new(),
            initialized: false,
            cancelled: false,
            cancelled_expires_at: None,
            moved_to_server_id: None,
            can_object_hash: None,
            created_at: now,
        }
    }

    pub fn profile_information(&self) -> ProfileInformation {
        ProfileInformation {
            version: self.version.to_bytes().to_vec(),
            public_key: self.public_key.clone(),
            profile_type: self.profile_type.clone(),
            name: self.name.clone(),
            extra_data: self.extra_data.clone(),
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            profile_image_hash: self.profile_image_hash.map(|h| h.to_vec()).unwrap_or_default(),
            thumbnail_image_hash: self
                .thumbnail_image_hash
                .map(|h| h.to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn signed_profile(&self) -> SignedProfile {
        SignedProfile {
            profile: Some(self.profile_information()),
            signature: self.signature.clone(),
        }
    }
}

// =============================================================================
// NEIGHBOR IDENTITY
// =============================================================================

/// Mirrored profile owned by a neighbor server. Uniqueness key is
/// `(hosting_server_id, identity_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborIdentityRecord {
    pub hosting_server_id: ServerId,
    pub identity_id: IdentityId,
    pub public_key: Vec<u8>,
    pub version: ProfileVersion,
    pub name: String,
    pub profile_type: String,
    pub extra_data: String,
    pub location: GpsLocation,
    pub profile_image_hash: Option<Hash>,
    pub thumbnail_image_hash: Option<Hash>,
    pub signature: Vec<u8>,
}

impl NeighborIdentityRecord {
    /// Validate and re-verify a profile shared by a neighbor. Every field
    /// limit and the Ed25519 signature are checked before anything is
    /// accepted into the mirror.
    pub fn from_signed_profile(
        hosting_server_id: ServerId,
        signed: &SignedProfile,
    ) -> ServerResult<Self> {
        let profile = signed
            .profile
            .as_ref()
            .ok_or_else(|| ServerError::invalid_value("shared profile is empty"))?;

        let version = ProfileVersion::from_bytes(&profile.version)
            .ok_or_else(|| ServerError::invalid_value("profile version must be 3 bytes"))?;
        if version.is_zero() {
            return Err(ServerError::invalid_value("profile version must not be 0.0.0"));
        }
        validate_profile_fields(profile)?;

        let location = GpsLocation::new(profile.latitude, profile.longitude)
            .ok_or_else(|| ServerError::invalid_value("location out of range"))?;

        crypto::verify(&profile.public_key, &profile.canonical_bytes(), &signed.signature)
            .map_err(|_| ServerError::InvalidSignature)?;

        Ok(Self {
            hosting_server_id,
            identity_id: crypto::identity_id(&profile.public_key),
            public_key: profile.public_key.clone(),
            version,
            name: profile.name.clone(),
            profile_type: profile.profile_type.clone(),
            extra_data: profile.extra_data.clone(),
            location,
            profile_image_hash: optional_hash(&profile.profile_image_hash)?,
            thumbnail_image_hash: optional_hash(&profile.thumbnail_image_hash)?,
            signature: signed.signature.clone(),
        })
    }

    pub fn profile_information(&self) -> ProfileInformation {
        ProfileInformation {
            version: self.version.to_bytes().to_vec(),
            public_key: self.public_key.clone(),
            profile_type: self.profile_type.clone(),
            name: self.name.clone(),
            extra_data: self.extra_data.clone(),
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            profile_image_hash: self.profile_image_hash.map(|h| h.to_vec()).unwrap_or_default(),
            thumbnail_image_hash: self
                .thumbnail_image_hash
                .map(|h| h.to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn signed_profile(&self) -> SignedProfile {
        SignedProfile {
            profile: Some(self.profile_information()),
            signature: self.signature.clone(),
        }
    }
}

pub fn validate_profile_fields(profile: &ProfileInformation) -> ServerResult<()> {
    if profile.name.len() > MAX_PROFILE_NAME_BYTES {
        return Err(ServerError::invalid_value("name too long"));
    }
    if profile.profile_type.len() > MAX_PROFILE_TYPE_BYTES {
        return Err(ServerError::invalid_value("type too long"));
    }
    if profile.extra_data.len() > MAX_PROFILE_EXTRA_DATA_BYTES {
        return Err(ServerError::invalid_value("extraData too long"));
    }
    Ok(())
}

pub fn optional_hash(bytes: &[u8]) -> ServerResult<Option<Hash>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    bytes
        .try_into()
        .map(Some)
        .map_err(|_| ServerError::invalid_value("hash must be 32 bytes"))
}

// =============================================================================
// PEER SERVERS
// =============================================================================

/// A neighbor we mirror, or a follower we push to. The two tables share this
/// record; only neighbors carry a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerServerRecord {
    pub network_id: ServerId,
    pub ip_address: IpAddr,
    pub primary_port: u16,
    pub sr_neighbor_port: u16,
    pub initialized: bool,
    pub last_refresh_time: u64,
    pub location: Option<GpsLocation>,
}

impl PeerServerRecord {
    pub fn sr_neighbor_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip_address, self.sr_neighbor_port)
    }
}

// =============================================================================
// NEIGHBORHOOD ACTIONS
// =============================================================================

/// Replication action types. Values below 10 target neighbors, values from
/// 10 up target followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    AddNeighbor,
    RemoveNeighbor,
    StopNeighborhoodUpdates,
    AddProfile,
    RefreshProfiles,
    ChangeProfile,
    RemoveProfile,
    InitializationProcessInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    Neighbor,
    Follower,
}

impl ActionType {
    pub fn code(self) -> u8 {
        match self {
            ActionType::AddNeighbor => 1,
            ActionType::RemoveNeighbor => 2,
            ActionType::StopNeighborhoodUpdates => 3,
            ActionType::AddProfile => 10,
            ActionType::RefreshProfiles => 11,
            ActionType::ChangeProfile => 12,
            ActionType::RemoveProfile => 13,
            ActionType::InitializationProcessInProgress => 14,
        }
    }

    pub fn direction(self) -> QueueDirection {
        if self.code() < 10 {
            QueueDirection::Neighbor
        } else {
            QueueDirection::Follower
        }
    }
}

/// Snapshot of a profile at action-creation time, embedded in the action so
/// replay never depends on the current database state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    pub version: [u8; 3],
    pub public_key: Vec<u8>,
    pub profile_type: String,
    pub name: String,
    pub extra_data: String,
    pub latitude: i32,
    pub longitude: i32,
    pub profile_image_hash: Option<Hash>,
    pub thumbnail_image_hash: Option<Hash>,
    pub signature: Vec<u8>,
}

impl ProfileSnapshot {
    pub fn of(record: &HostedIdentityRecord) -> Self {
        Self {
            version: record.version.to_bytes(),
            public_key: record.public_key.clone(),
            profile_type: record.profile_type.clone(),
            name: record.name.clone(),
            extra_data: record.extra_data.clone(),
            latitude: record.location.latitude,
            longitude: record.location.longitude,
            profile_image_hash: record.profile_image_hash,
            thumbnail_image_hash: record.thumbnail_image_hash,
            signature: record.signature.clone(),
        }
    }

    pub fn signed_profile(&self) -> SignedProfile {
        SignedProfile {
            profile: Some(ProfileInformation {
                version: self.version.to_vec(),
                public_key: self.public_key.clone(),
                profile_type: self.profile_type.clone(),
                name: self.name.clone(),
                extra_data: self.extra_data.clone(),
                latitude: self.latitude,
                longitude: self.longitude,
                profile_image_hash: self
                    .profile_image_hash
                    .map(|h| h.to_vec())
                    .unwrap_or_default(),
                thumbnail_image_hash: self
                    .thumbnail_image_hash
                    .map(|h| h.to_vec())
                    .unwrap_or_default(),
            }),
            signature: self.signature.clone(),
        }
    }
}

/// Typed payload of a neighborhood action, serialized canonically as tagged
/// JSON into the action's `additional_data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum ActionData {
    AddNeighbor {
        ip_address: IpAddr,
        primary_port: u16,
        latitude: i32,
        longitude: i32,
    },
    RemoveNeighbor {},
    StopNeighborhoodUpdates {
        ip_address: IpAddr,
        primary_port: u16,
    },
    AddProfile {
        profile: ProfileSnapshot,
    },
    ChangeProfile {
        profile: ProfileSnapshot,
    },
    RemoveProfile {
        identity_id: Hash,
    },
    RefreshProfiles {
        identity_ids: Vec<Hash>,
    },
    InitializationProcessInProgress {},
}

impl ActionData {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionData::AddNeighbor { .. } => ActionType::AddNeighbor,
            ActionData::RemoveNeighbor {} => ActionType::RemoveNeighbor,
            ActionData::StopNeighborhoodUpdates { .. } => ActionType::StopNeighborhoodUpdates,
            ActionData::AddProfile { .. } => ActionType::AddProfile,
            ActionData::ChangeProfile { .. } => ActionType::ChangeProfile,
            ActionData::RemoveProfile { .. } => ActionType::RemoveProfile,
            ActionData::RefreshProfiles { .. } => ActionType::RefreshProfiles,
            ActionData::InitializationProcessInProgress {} => {
                ActionType::InitializationProcessInProgress
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodAction {
    /// Monotonically increasing; per-queue FIFO order is id order.
    pub id: u64,
    /// Target peer server.
    pub server_id: ServerId,
    pub action_type: ActionType,
    pub target_identity_id: Option<IdentityId>,
    pub timestamp: u64,
    /// Not eligible for dispatch before this time.
    pub execute_after: Option<u64>,
    /// Consecutive dispatch failures, drives backoff and the drop limit.
    pub attempts: u32,
    /// Tagged JSON snapshot; see [`ActionData`].
    pub additional_data: String,
}

impl NeighborhoodAction {
    pub fn data(&self) -> ServerResult<ActionData> {
        Ok(serde_json::from_str(&self.additional_data)?)
    }

    pub fn direction(&self) -> QueueDirection {
        self.action_type.direction()
    }

    pub fn is_eligible(&self, now: u64) -> bool {
        self.execute_after.map(|t| t <= now).unwrap_or(true)
    }
}

// =============================================================================
// RELATED IDENTITIES
// =============================================================================

/// Relationship card hosted for an identity. Uniqueness key is
/// `(identity_id, application_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedIdentityRecord {
    pub identity_id: IdentityId,
    pub application_id: Vec<u8>,
    pub card_id: Vec<u8>,
    pub card_version: Vec<u8>,
    pub card_type: String,
    pub valid_from: u64,
    pub valid_to: u64,
    pub issuer_public_key: Vec<u8>,
    pub recipient_public_key: Vec<u8>,
    pub issuer_signature: Vec<u8>,
    pub recipient_signature: Vec<u8>,
}

impl RelatedIdentityRecord {
    pub fn from_card(identity_id: IdentityId, application_id: Vec<u8>, card: &RelationshipCard) -> Self {
        Self {
            identity_id,
            application_id,
            card_id: card.card_id.clone(),
            card_version: card.card_version.clone(),
            card_type: card.card_type.clone(),
            valid_from: card.valid_from,
            valid_to: card.valid_to,
            issuer_public_key: card.issuer_public_key.clone(),
            recipient_public_key: card.recipient_public_key.clone(),
            issuer_signature: card.issuer_signature.clone(),
            recipient_signature: card.recipient_signature.clone(),
        }
    }

    pub fn to_card(&self) -> RelationshipCard {
        RelationshipCard {
            card_id: self.card_id.clone(),
            card_version: self.card_version.clone(),
            application_id: self.application_id.clone(),
            card_type: self.card_type.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            issuer_public_key: self.issuer_public_key.clone(),
            recipient_public_key: self.recipient_public_key.clone(),
            issuer_signature: self.issuer_signature.clone(),
            recipient_signature: self.recipient_signature.clone(),
        }
    }

    pub fn is_valid_at(&self, time: u64) -> bool {
        self.valid_from <= time && time <= self.valid_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_split_directions() {
        for ty in [
            ActionType::AddNeighbor,
            ActionType::RemoveNeighbor,
            ActionType::StopNeighborhoodUpdates,
        ] {
            assert_eq!(ty.direction(), QueueDirection::Neighbor);
            assert!(ty.code() < 10);
        }
        for ty in [
            ActionType::AddProfile,
            ActionType::RefreshProfiles,
            ActionType::ChangeProfile,
            ActionType::RemoveProfile,
            ActionType::InitializationProcessInProgress,
        ] {
            assert_eq!(ty.direction(), QueueDirection::Follower);
            assert!(ty.code() >= 10);
        }
    }

    #[test]
    fn action_data_json_roundtrip() {
        let data = ActionData::RemoveProfile { identity_id: [3u8; 32] };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"kind\""));
        let back: ActionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn shared_profile_verification_rejects_tampering() {
        let keys = crate::crypto::Keypair::generate();
        let profile = ProfileInformation {
            version: vec![1, 0, 0],
            public_key: keys.public.to_vec(),
            profile_type: "person".into(),
            name: "alice".into(),
            extra_data: String::new(),
            latitude: 0,
            longitude: 0,
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        };
        let signature = keys.sign(&profile.canonical_bytes());
        let mut signed = SignedProfile { profile: Some(profile), signature };

        let server: ServerId = [9u8; 32];
        assert!(NeighborIdentityRecord::from_signed_profile(server, &signed).is_ok());

        signed.profile.as_mut().unwrap().name = "mallory".into();
        assert!(matches!(
            NeighborIdentityRecord::from_signed_profile(server, &signed),
            Err(ServerError::InvalidSignature)
        ));
    }
}
