//! Location-service dialect.
//!
//! The location service speaks its own message set over the same
//! length-prefixed framing. The server registers itself, subscribes to
//! neighborhood topology with keep-alive, and receives pushed change
//! notifications until it deregisters.

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum LocStatus {
    Ok = 0,
    Error = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocEnvelope {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "loc_envelope::Body", tags = "2, 3")]
    pub body: ::core::option::Option<loc_envelope::Body>,
}

pub mod loc_envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Request(super::LocRequest),
        #[prost(message, tag = "3")]
        Response(super::LocResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocRequest {
    #[prost(oneof = "loc_request::Content", tags = "1, 2, 3, 4")]
    pub content: ::core::option::Option<loc_request::Content>,
}

pub mod loc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        RegisterService(super::RegisterServiceRequest),
        #[prost(message, tag = "2")]
        DeregisterService(super::DeregisterServiceRequest),
        #[prost(message, tag = "3")]
        GetNeighbourNodesByDistance(super::GetNeighbourNodesByDistanceRequest),
        /// Pushed by the location service after a keep-alive subscription.
        #[prost(message, tag = "4")]
        NeighbourhoodChanged(super::NeighbourhoodChangedNotification),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocResponse {
    #[prost(enumeration = "LocStatus", tag = "1")]
    pub status: i32,
    #[prost(message, optional, tag = "2")]
    pub neighbour_nodes: ::core::option::Option<NeighbourNodes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterServiceRequest {
    /// Network id of the registering profile server.
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub primary_port: u32,
    #[prost(sint32, tag = "3")]
    pub latitude: i32,
    #[prost(sint32, tag = "4")]
    pub longitude: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeregisterServiceRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNeighbourNodesByDistanceRequest {
    /// Keep the connection open and push NeighbourhoodChanged notifications.
    #[prost(bool, tag = "1")]
    pub keep_alive_and_send_updates: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighbourNodes {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<NodeProfile>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeProfile {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: ::prost::alloc::vec::Vec<u8>,
    /// IP address in text form.
    #[prost(string, tag = "2")]
    pub ip_address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub primary_port: u32,
    #[prost(sint32, tag = "4")]
    pub latitude: i32,
    #[prost(sint32, tag = "5")]
    pub longitude: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighbourhoodChangedNotification {
    #[prost(message, repeated, tag = "1")]
    pub changes: ::prost::alloc::vec::Vec<NeighbourhoodChange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighbourhoodChange {
    #[prost(oneof = "neighbourhood_change::Change", tags = "1, 2, 3")]
    pub change: ::core::option::Option<neighbourhood_change::Change>,
}

pub mod neighbourhood_change {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Change {
        #[prost(message, tag = "1")]
        Added(super::NodeProfile),
        #[prost(message, tag = "2")]
        Updated(super::NodeProfile),
        #[prost(bytes, tag = "3")]
        Removed(::prost::alloc::vec::Vec<u8>),
    }
}
