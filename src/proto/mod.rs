//! Wire message definitions for the profile protocol.
//!
//! Every frame payload is a protobuf-encoded [`Envelope`]. Requests carry a
//! client-chosen 32-bit id; responses echo it. Server-initiated requests
//! (neighborhood pushes during initialization) use their own id space and are
//! tagged as `ServerUpdateRequest` so the two spaces cannot collide.
//!
//! Signed requests carry an Ed25519 signature over the SHA256 of the
//! protobuf-serialized request body with the signature field cleared; see
//! [`signed_digest`].

pub mod can;
pub mod loc;

use prost::Message;

/// Response status codes. Exhaustive; every handler outcome maps to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    ErrorProtocolViolation = 1,
    ErrorUnsupported = 2,
    ErrorBadRole = 3,
    ErrorBadConversationState = 4,
    ErrorInvalidSignature = 5,
    ErrorInvalidValue = 6,
    ErrorQuotaExceeded = 7,
    ErrorAlreadyExists = 8,
    ErrorNotFound = 9,
    ErrorUninitialized = 10,
    ErrorRejected = 11,
    ErrorBusy = 12,
    ErrorInternal = 13,
}

/// Server roles, one TCP listener each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum RoleType {
    Primary = 0,
    ClientNonCustomer = 1,
    ClientCustomer = 2,
    SrNeighbor = 3,
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Request id; responses echo the id of the request they answer.
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "envelope::Body", tags = "2, 3, 4, 5")]
    pub body: ::core::option::Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Client-initiated request.
        #[prost(message, tag = "2")]
        Request(super::Request),
        /// Response to a client-initiated request.
        #[prost(message, tag = "3")]
        Response(super::Response),
        /// Server-initiated request (separate id space).
        #[prost(message, tag = "4")]
        ServerUpdateRequest(super::Request),
        /// Response to a server-initiated request.
        #[prost(message, tag = "5")]
        ServerUpdateResponse(super::Response),
    }
}

impl Envelope {
    pub fn request(id: u32, content: request::Content) -> Self {
        Self {
            id,
            body: Some(envelope::Body::Request(Request { content: Some(content) })),
        }
    }

    pub fn response(id: u32, response: Response) -> Self {
        Self { id, body: Some(envelope::Body::Response(response)) }
    }

    pub fn server_request(id: u32, content: request::Content) -> Self {
        Self {
            id,
            body: Some(envelope::Body::ServerUpdateRequest(Request {
                content: Some(content),
            })),
        }
    }

    pub fn server_response(id: u32, response: Response) -> Self {
        Self { id, body: Some(envelope::Body::ServerUpdateResponse(response)) }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(
        oneof = "request::Content",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19"
    )]
    pub content: ::core::option::Option<request::Content>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        Ping(super::PingRequest),
        #[prost(message, tag = "2")]
        ListRoles(super::ListRolesRequest),
        #[prost(message, tag = "3")]
        StartConversation(super::StartConversationRequest),
        #[prost(message, tag = "4")]
        VerifyIdentity(super::VerifyIdentityRequest),
        #[prost(message, tag = "5")]
        CheckIn(super::CheckInRequest),
        #[prost(message, tag = "6")]
        HostingAgreement(super::HostingAgreementRequest),
        #[prost(message, tag = "7")]
        UpdateProfile(super::UpdateProfileRequest),
        #[prost(message, tag = "8")]
        CancelHosting(super::CancelHostingRequest),
        #[prost(message, tag = "9")]
        GetProfileInformation(super::GetProfileInformationRequest),
        #[prost(message, tag = "10")]
        GetIdentityInformation(super::GetIdentityInformationRequest),
        #[prost(message, tag = "11")]
        ProfileSearch(super::ProfileSearchRequest),
        #[prost(message, tag = "12")]
        ProfileSearchPart(super::ProfileSearchPartRequest),
        #[prost(message, tag = "13")]
        AddRelatedIdentity(super::AddRelatedIdentityRequest),
        #[prost(message, tag = "14")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityRequest),
        #[prost(message, tag = "15")]
        GetIdentityRelationships(super::GetIdentityRelationshipsRequest),
        #[prost(message, tag = "16")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationRequest),
        #[prost(message, tag = "17")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationRequest),
        #[prost(message, tag = "18")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateRequest),
        #[prost(message, tag = "19")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesRequest),
    }

    impl Content {
        /// Wire name, used in logs.
        pub fn name(&self) -> &'static str {
            match self {
                Content::Ping(_) => "ping",
                Content::ListRoles(_) => "list_roles",
                Content::StartConversation(_) => "start_conversation",
                Content::VerifyIdentity(_) => "verify_identity",
                Content::CheckIn(_) => "check_in",
                Content::HostingAgreement(_) => "hosting_agreement",
                Content::UpdateProfile(_) => "update_profile",
                Content::CancelHosting(_) => "cancel_hosting",
                Content::GetProfileInformation(_) => "get_profile_information",
                Content::GetIdentityInformation(_) => "get_identity_information",
                Content::ProfileSearch(_) => "profile_search",
                Content::ProfileSearchPart(_) => "profile_search_part",
                Content::AddRelatedIdentity(_) => "add_related_identity",
                Content::RemoveRelatedIdentity(_) => "remove_related_identity",
                Content::GetIdentityRelationships(_) => "get_identity_relationships",
                Content::StartNeighborhoodInitialization(_) => "start_neighborhood_initialization",
                Content::FinishNeighborhoodInitialization(_) => {
                    "finish_neighborhood_initialization"
                }
                Content::NeighborhoodSharedProfileUpdate(_) => {
                    "neighborhood_shared_profile_update"
                }
                Content::StopNeighborhoodUpdates(_) => "stop_neighborhood_updates",
            }
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    /// Short human-readable detail for error statuses. Never a stack trace.
    #[prost(string, tag = "2")]
    pub details: ::prost::alloc::string::String,
    #[prost(
        oneof = "response::Content",
        tags = "3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21"
    )]
    pub content: ::core::option::Option<response::Content>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "3")]
        Ping(super::PingResponse),
        #[prost(message, tag = "4")]
        ListRoles(super::ListRolesResponse),
        #[prost(message, tag = "5")]
        StartConversation(super::StartConversationResponse),
        #[prost(message, tag = "6")]
        VerifyIdentity(super::VerifyIdentityResponse),
        #[prost(message, tag = "7")]
        CheckIn(super::CheckInResponse),
        #[prost(message, tag = "8")]
        HostingAgreement(super::HostingAgreementResponse),
        #[prost(message, tag = "9")]
        UpdateProfile(super::UpdateProfileResponse),
        #[prost(message, tag = "10")]
        CancelHosting(super::CancelHostingResponse),
        #[prost(message, tag = "11")]
        GetProfileInformation(super::GetProfileInformationResponse),
        #[prost(message, tag = "12")]
        GetIdentityInformation(super::GetIdentityInformationResponse),
        #[prost(message, tag = "13")]
        ProfileSearch(super::ProfileSearchResponse),
        #[prost(message, tag = "14")]
        ProfileSearchPart(super::ProfileSearchPartResponse),
        #[prost(message, tag = "15")]
        AddRelatedIdentity(super::AddRelatedIdentityResponse),
        #[prost(message, tag = "16")]
        RemoveRelatedIdentity(super::RemoveRelatedIdentityResponse),
        #[prost(message, tag = "17")]
        GetIdentityRelationships(super::GetIdentityRelationshipsResponse),
        #[prost(message, tag = "18")]
        StartNeighborhoodInitialization(super::StartNeighborhoodInitializationResponse),
        #[prost(message, tag = "19")]
        FinishNeighborhoodInitialization(super::FinishNeighborhoodInitializationResponse),
        #[prost(message, tag = "20")]
        NeighborhoodSharedProfileUpdate(super::NeighborhoodSharedProfileUpdateResponse),
        #[prost(message, tag = "21")]
        StopNeighborhoodUpdates(super::StopNeighborhoodUpdatesResponse),
    }
}

impl Response {
    pub fn ok(content: response::Content) -> Self {
        Self { status: Status::Ok as i32, details: String::new(), content: Some(content) }
    }

    pub fn ok_empty() -> Self {
        Self { status: Status::Ok as i32, details: String::new(), content: None }
    }

    pub fn error(status: Status, details: impl Into<String>) -> Self {
        Self { status: status as i32, details: details.into(), content: None }
    }

    pub fn status_typed(&self) -> Status {
        Status::try_from(self.status).unwrap_or(Status::ErrorInternal)
    }
}

// =============================================================================
// PROFILE DATA
// =============================================================================

/// The signed portion of a profile. Its prost encoding (fields in tag order,
/// defaults omitted) is the canonical byte sequence the owner signs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileInformation {
    /// Semantic version, exactly 3 bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub profile_type: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub extra_data: ::prost::alloc::string::String,
    /// Latitude in micro-degrees.
    #[prost(sint32, tag = "6")]
    pub latitude: i32,
    /// Longitude in micro-degrees.
    #[prost(sint32, tag = "7")]
    pub longitude: i32,
    /// SHA256 of the profile image, empty when absent.
    #[prost(bytes = "vec", tag = "8")]
    pub profile_image_hash: ::prost::alloc::vec::Vec<u8>,
    /// SHA256 of the thumbnail image, empty when absent.
    #[prost(bytes = "vec", tag = "9")]
    pub thumbnail_image_hash: ::prost::alloc::vec::Vec<u8>,
}

impl ProfileInformation {
    /// Canonical encoding used for signing and verification.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedProfile {
    #[prost(message, optional, tag = "1")]
    pub profile: ::core::option::Option<ProfileInformation>,
    /// Ed25519 signature over the canonical profile encoding.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

// =============================================================================
// BASIC REQUESTS
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    /// Server clock, UNIX seconds.
    #[prost(uint64, tag = "2")]
    pub clock: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRolesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerRole {
    #[prost(enumeration = "RoleType", tag = "1")]
    pub role: i32,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(bool, tag = "3")]
    pub is_tls: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRolesResponse {
    #[prost(message, repeated, tag = "1")]
    pub roles: ::prost::alloc::vec::Vec<ServerRole>,
}

// =============================================================================
// CONVERSATION SETUP
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartConversationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    /// 32 random bytes for the server to sign.
    #[prost(bytes = "vec", tag = "2")]
    pub client_challenge: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartConversationResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    /// 32 random bytes the client must sign in VerifyIdentity/CheckIn.
    #[prost(bytes = "vec", tag = "2")]
    pub server_challenge: ::prost::alloc::vec::Vec<u8>,
    /// Server's signature of the client challenge, proving the server key.
    #[prost(bytes = "vec", tag = "3")]
    pub client_challenge_signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyIdentityRequest {
    /// Echo of the server challenge from StartConversation.
    #[prost(bytes = "vec", tag = "1")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyIdentityResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckInRequest {
    /// Echo of the server challenge from StartConversation.
    #[prost(bytes = "vec", tag = "1")]
    pub challenge: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckInResponse {}

// =============================================================================
// HOSTING
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostingAgreementRequest {
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostingAgreementResponse {}

/// Profile delta. Absent fields keep their stored value; on the first update
/// of an uninitialized identity every field except the images is required.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateProfileRequest {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub version: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub profile_type: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub extra_data: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(sint32, optional, tag = "5")]
    pub latitude: ::core::option::Option<i32>,
    #[prost(sint32, optional, tag = "6")]
    pub longitude: ::core::option::Option<i32>,
    /// Inline profile image bytes; must hash to `profile_image_hash`.
    #[prost(bytes = "vec", optional, tag = "7")]
    pub profile_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub profile_image_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub thumbnail_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub thumbnail_image_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    /// Suppress follower notifications for this update.
    #[prost(bool, tag = "11")]
    pub no_propagation: bool,
    /// Owner's signature over the canonical encoding of the resulting profile.
    #[prost(bytes = "vec", tag = "12")]
    pub profile_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateProfileResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelHostingRequest {
    /// Server the identity moved to, if any; enables redirects.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub new_hosting_server_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelHostingResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetProfileInformationRequest {
    #[prost(bool, tag = "1")]
    pub include_profile_image: bool,
    #[prost(bool, tag = "2")]
    pub include_thumbnail_image: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetProfileInformationResponse {
    #[prost(message, optional, tag = "1")]
    pub signed_profile: ::core::option::Option<SignedProfile>,
    #[prost(bool, tag = "2")]
    pub initialized: bool,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub profile_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub thumbnail_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityInformationRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub include_profile_image: bool,
    #[prost(bool, tag = "3")]
    pub include_thumbnail_image: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityInformationResponse {
    #[prost(message, optional, tag = "1")]
    pub signed_profile: ::core::option::Option<SignedProfile>,
    #[prost(bool, tag = "2")]
    pub is_hosted: bool,
    #[prost(bool, tag = "3")]
    pub is_cancelled: bool,
    /// Non-empty when the identity moved to another server.
    #[prost(bytes = "vec", tag = "4")]
    pub hosting_server_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub profile_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub thumbnail_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

// =============================================================================
// SEARCH
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchRequest {
    /// When true, only locally hosted profiles are searched.
    #[prost(bool, tag = "1")]
    pub include_hosted_only: bool,
    #[prost(bool, tag = "2")]
    pub include_thumbnail_images: bool,
    /// Regex over the profile type; empty matches everything.
    #[prost(string, tag = "3")]
    pub profile_type: ::prost::alloc::string::String,
    /// Regex over the profile name; empty matches everything.
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    /// Regex over extraData; empty matches everything.
    #[prost(string, tag = "5")]
    pub extra_data: ::prost::alloc::string::String,
    #[prost(sint32, optional, tag = "6")]
    pub latitude: ::core::option::Option<i32>,
    #[prost(sint32, optional, tag = "7")]
    pub longitude: ::core::option::Option<i32>,
    /// Search radius in meters; requires latitude/longitude.
    #[prost(uint32, tag = "8")]
    pub radius: u32,
    /// Records inlined in this response, capped at 100.
    #[prost(uint32, tag = "9")]
    pub max_response_record_count: u32,
    /// Total matches retained for paging, capped at 1000.
    #[prost(uint32, tag = "10")]
    pub max_total_record_count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SearchProfileRecord {
    #[prost(message, optional, tag = "1")]
    pub signed_profile: ::core::option::Option<SignedProfile>,
    /// Empty for locally hosted profiles, otherwise the owning neighbor.
    #[prost(bytes = "vec", tag = "2")]
    pub hosting_server_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub thumbnail_image: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchResponse {
    /// Total matches retained server-side for this search.
    #[prost(uint32, tag = "1")]
    pub total_record_count: u32,
    #[prost(message, repeated, tag = "2")]
    pub profiles: ::prost::alloc::vec::Vec<SearchProfileRecord>,
    /// Opaque token for ProfileSearchPart; empty when nothing remains.
    #[prost(bytes = "vec", tag = "3")]
    pub continuation_token: ::prost::alloc::vec::Vec<u8>,
    /// True when the time budget expired before the scan finished.
    #[prost(bool, tag = "4")]
    pub truncated: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchPartRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub continuation_token: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub record_index: u32,
    #[prost(uint32, tag = "3")]
    pub record_count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileSearchPartResponse {
    #[prost(uint32, tag = "1")]
    pub record_index: u32,
    #[prost(message, repeated, tag = "2")]
    pub profiles: ::prost::alloc::vec::Vec<SearchProfileRecord>,
}

// =============================================================================
// RELATED IDENTITIES
// =============================================================================

/// Relationship card binding an issuer identity to a recipient identity.
///
/// The issuer signs the SHA256 of the card with both signature fields
/// cleared; the recipient then signs the SHA256 of the card with only the
/// recipient signature cleared, covering the issuer's signature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RelationshipCard {
    #[prost(bytes = "vec", tag = "1")]
    pub card_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub card_version: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub application_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "4")]
    pub card_type: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub valid_from: u64,
    #[prost(uint64, tag = "6")]
    pub valid_to: u64,
    #[prost(bytes = "vec", tag = "7")]
    pub issuer_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub recipient_public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub issuer_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub recipient_signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRelatedIdentityRequest {
    #[prost(message, optional, tag = "1")]
    pub card: ::core::option::Option<RelationshipCard>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddRelatedIdentityResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRelatedIdentityRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub application_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveRelatedIdentityResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityRelationshipsRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub identity_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub include_invalid: bool,
    /// Exact card type filter; empty matches everything.
    #[prost(string, tag = "3")]
    pub card_type: ::prost::alloc::string::String,
    /// Issuer identity filter; empty matches everything.
    #[prost(bytes = "vec", tag = "4")]
    pub issuer_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetIdentityRelationshipsResponse {
    #[prost(message, repeated, tag = "1")]
    pub cards: ::prost::alloc::vec::Vec<RelationshipCard>,
}

// =============================================================================
// NEIGHBORHOOD
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartNeighborhoodInitializationRequest {
    /// Initiator's primary role port, for our follower record.
    #[prost(uint32, tag = "1")]
    pub primary_port: u32,
    /// Initiator's neighbor role port, where we push updates later.
    #[prost(uint32, tag = "2")]
    pub sr_neighbor_port: u32,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartNeighborhoodInitializationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FinishNeighborhoodInitializationRequest {
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FinishNeighborhoodInitializationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SharedProfileUpdateItem {
    #[prost(oneof = "shared_profile_update_item::Change", tags = "1, 2, 3, 4")]
    pub change: ::core::option::Option<shared_profile_update_item::Change>,
}

pub mod shared_profile_update_item {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Change {
        /// Profile newly hosted by the sender.
        #[prost(message, tag = "1")]
        Add(super::SignedProfile),
        /// Profile changed on the sender.
        #[prost(message, tag = "2")]
        Change(super::SignedProfile),
        /// Identity no longer hosted by the sender.
        #[prost(bytes, tag = "3")]
        Remove(::prost::alloc::vec::Vec<u8>),
        /// Liveness refresh with the sender's full hosted-identity set.
        #[prost(message, tag = "4")]
        Refresh(super::ProfileRefresh),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProfileRefresh {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub identity_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborhoodSharedProfileUpdateRequest {
    #[prost(message, repeated, tag = "1")]
    pub items: ::prost::alloc::vec::Vec<SharedProfileUpdateItem>,
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborhoodSharedProfileUpdateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopNeighborhoodUpdatesRequest {
    #[prost(bytes = "vec", tag = "15")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopNeighborhoodUpdatesResponse {}

// =============================================================================
// SIGNED REQUESTS
// =============================================================================

/// A request body carrying an Ed25519 signature over its own canonical form.
pub trait SignedRequest: Message + Clone {
    fn signature(&self) -> &[u8];
    fn clear_signature(&mut self);
}

macro_rules! impl_signed_request {
    ($($ty:ty),+ $(,)?) => {
        $(impl SignedRequest for $ty {
            fn signature(&self) -> &[u8] {
                &self.signature
            }
            fn clear_signature(&mut self) {
                self.signature.clear();
            }
        })+
    };
}

impl_signed_request!(
    VerifyIdentityRequest,
    CheckInRequest,
    HostingAgreementRequest,
    UpdateProfileRequest,
    CancelHostingRequest,
    AddRelatedIdentityRequest,
    RemoveRelatedIdentityRequest,
    StartNeighborhoodInitializationRequest,
    FinishNeighborhoodInitializationRequest,
    NeighborhoodSharedProfileUpdateRequest,
    StopNeighborhoodUpdatesRequest,
);

/// SHA256 of the request body with the signature field cleared. This is the
/// byte sequence signed requests are signed over.
pub fn signed_digest<M: SignedRequest>(msg: &M) -> [u8; 32] {
    let mut unsigned = msg.clone();
    unsigned.clear_signature();
    crate::crypto::sha256(&unsigned.encode_to_vec())
}

/// Attach a signature to a request on behalf of `keys`.
pub fn sign_request<M: SignedRequest>(keys: &crate::crypto::Keypair, msg: &mut M)
where
    M: SignedRequestMut,
{
    let digest = signed_digest(msg);
    msg.set_signature(keys.sign(&digest));
}

/// Verify a signed request against the conversation identity's public key.
pub fn verify_signed_request<M: SignedRequest>(
    msg: &M,
    public_key: &[u8],
) -> Result<(), crate::crypto::CryptoError> {
    let digest = signed_digest(msg);
    crate::crypto::verify(public_key, &digest, msg.signature())
}

/// Write access to the signature field, for the sending side.
pub trait SignedRequestMut: SignedRequest {
    fn set_signature(&mut self, signature: Vec<u8>);
}

macro_rules! impl_signed_request_mut {
    ($($ty:ty),+ $(,)?) => {
        $(impl SignedRequestMut for $ty {
            fn set_signature(&mut self, signature: Vec<u8>) {
                self.signature = signature;
            }
        })+
    };
}

impl_signed_request_mut!(
    VerifyIdentityRequest,
    CheckInRequest,
    HostingAgreementRequest,
    UpdateProfileRequest,
    CancelHostingRequest,
    AddRelatedIdentityRequest,
    RemoveRelatedIdentityRequest,
    StartNeighborhoodInitializationRequest,
    FinishNeighborhoodInitializationRequest,
    NeighborhoodSharedProfileUpdateRequest,
    StopNeighborhoodUpdatesRequest,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> ProfileInformation {
        ProfileInformation {
            version: vec![1, 0, 0],
            public_key: vec![7u8; 32],
            profile_type: "test".into(),
            name: "alice".into(),
            extra_data: String::new(),
            latitude: 50_075_500,
            longitude: 14_437_800,
            profile_image_hash: Vec::new(),
            thumbnail_image_hash: Vec::new(),
        }
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let p = sample_profile();
        assert_eq!(p.canonical_bytes(), p.clone().canonical_bytes());

        let mut q = p.clone();
        q.name = "bob".into();
        assert_ne!(p.canonical_bytes(), q.canonical_bytes());
    }

    #[test]
    fn signed_digest_excludes_signature() {
        let mut req = UpdateProfileRequest {
            name: Some("alice".into()),
            ..Default::default()
        };
        let d1 = signed_digest(&req);
        req.signature = vec![0xAA; 64];
        let d2 = signed_digest(&req);
        assert_eq!(d1, d2);

        req.name = Some("bob".into());
        assert_ne!(signed_digest(&req), d2);
    }

    #[test]
    fn envelope_roundtrip() {
        use prost::Message;

        let env = Envelope::request(
            7,
            request::Content::Ping(PingRequest { payload: b"hello".to_vec() }),
        );
        let bytes = env.encode_to_vec();
        let back = Envelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(env, back);
    }
}
