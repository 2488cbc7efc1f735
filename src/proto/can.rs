//! Content-addressable-network gateway dialect.
//!
//! Only the upload/refresh/delete contract matters to this server: the
//! gateway stores the signed contact record, the refresh call re-publishes
//! it under a monotonically increasing sequence number, and delete retires
//! it on shutdown.

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CanStatus {
    Ok = 0,
    Error = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CanEnvelope {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "can_envelope::Body", tags = "2, 3")]
    pub body: ::core::option::Option<can_envelope::Body>,
}

pub mod can_envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Request(super::CanRequest),
        #[prost(message, tag = "3")]
        Response(super::CanResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CanRequest {
    #[prost(oneof = "can_request::Content", tags = "1, 2, 3")]
    pub content: ::core::option::Option<can_request::Content>,
}

pub mod can_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        UploadObject(super::UploadObjectRequest),
        #[prost(message, tag = "2")]
        DeleteObject(super::DeleteObjectRequest),
        #[prost(message, tag = "3")]
        RefreshRecord(super::RefreshRecordRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CanResponse {
    #[prost(enumeration = "CanStatus", tag = "1")]
    pub status: i32,
    /// Content hash of the stored object, when applicable.
    #[prost(bytes = "vec", tag = "2")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadObjectRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteObjectRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefreshRecordRequest {
    #[prost(message, optional, tag = "1")]
    pub record: ::core::option::Option<SignedContactRecord>,
    /// IPNS-style sequence; the gateway rejects regressions.
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

/// The server's published contact record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub network_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub ip_address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub primary_port: u32,
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedContactRecord {
    #[prost(message, optional, tag = "1")]
    pub record: ::core::option::Option<ContactRecord>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}
