// IoP Profile Server — Network Constants and Types
// Distributed under the MIT software license.

//! Network constants and role definitions.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every frame and collection has an explicit
//!    size limit; a client cannot exhaust memory with large messages.
//!
//! 2. **Slowloris resistance** — TLS handshakes and idle reads are
//!    deadline-bounded, with a tighter bound before authentication.
//!
//! 3. **In-band identity** — TLS provides confidentiality only; peers are
//!    authenticated by Ed25519 signatures inside the conversation, never by
//!    certificate validation.

use crate::config::Config;
use crate::proto::RoleType;
use serde::{Deserialize, Serialize};

// =============================================================================
// TIMEOUTS
// =============================================================================

/// TLS handshake deadline. A peer that stalls the handshake is dropped.
pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Idle-read timeout before the conversation is authenticated.
pub const IDLE_TIMEOUT_FRESH_SECS: u64 = 60;

/// Idle-read timeout once the conversation is authenticated.
pub const IDLE_TIMEOUT_AUTHENTICATED_SECS: u64 = 600;

/// Grace given to in-flight client requests during shutdown.
pub const CLIENT_DRAIN_GRACE_SECS: u64 = 5;

/// Grace given to background workers during shutdown before hard abort.
pub const WORKER_DRAIN_GRACE_SECS: u64 = 30;

// =============================================================================
// ROLES
// =============================================================================

/// Server roles. Each role is one TCP listener; the primary role is
/// plaintext, every other role runs TLS under the same certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Plaintext; serves only the service listing.
    Primary,
    /// TLS; identity-scoped queries without hosting rights.
    ClientNonCustomer,
    /// TLS; hosting operations for checked-in customers.
    ClientCustomer,
    /// TLS; replication traffic between profile servers.
    SrNeighbor,
}

impl Role {
    pub const ALL: [Role; 4] =
        [Role::Primary, Role::ClientNonCustomer, Role::ClientCustomer, Role::SrNeighbor];

    pub fn is_tls(self) -> bool {
        !matches!(self, Role::Primary)
    }

    pub fn port(self, config: &Config) -> u16 {
        match self {
            Role::Primary => config.primary_port,
            Role::ClientNonCustomer => config.client_non_customer_port,
            Role::ClientCustomer => config.client_customer_port,
            Role::SrNeighbor => config.sr_neighbor_port,
        }
    }

    pub fn wire_type(self) -> RoleType {
        match self {
            Role::Primary => RoleType::Primary,
            Role::ClientNonCustomer => RoleType::ClientNonCustomer,
            Role::ClientCustomer => RoleType::ClientCustomer,
            Role::SrNeighbor => RoleType::SrNeighbor,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::ClientNonCustomer => "client-non-customer",
            Role::ClientCustomer => "client-customer",
            Role::SrNeighbor => "sr-neighbor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_primary_is_plaintext() {
        for role in Role::ALL {
            assert_eq!(role.is_tls(), role != Role::Primary);
        }
    }
}
