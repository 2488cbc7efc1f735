//! Networked core: framing, TLS roles, conversations, and peer clients.

pub mod client;
pub mod conversation;
pub mod framing;
pub mod handlers;
pub mod server;
pub mod tls;
pub mod types;

// Re-exports
pub use client::{expect_ok, peer_error, query_roles, role_port, PeerClient};
pub use conversation::{Conversation, ConversationState, CustomerRegistry, CHALLENGE_SIZE};
pub use framing::{
    read_envelope, read_frame, write_envelope, write_frame, FrameError, MessageBuilder,
    FRAME_MAGIC, MAX_FRAME_PAYLOAD, PROTOCOL_VIOLATION_ID,
};
pub use types::*;
