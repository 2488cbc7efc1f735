//! Server configuration.
//!
//! Assembled once at startup (from CLI flags or an external loader) and
//! handed to every component; there is no process-wide configuration
//! singleton.

use crate::types::GpsLocation;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default cap on concurrently hosted (non-cancelled) identities.
pub const DEFAULT_MAX_HOSTED_IDENTITIES: usize = 20_000;

/// Default cap on follower servers accepted for replication.
pub const DEFAULT_MAX_FOLLOWERS: usize = 200;

/// Default cap on mirrored identities accepted per neighbor.
pub const DEFAULT_MAX_NEIGHBOR_IDENTITIES: usize = 20_000;

/// How long a cancelled hosting is kept for redirects before reaping.
pub const DEFAULT_CANCELLATION_RETENTION_SECS: u64 = 14 * 24 * 3600;

/// A neighbor not refreshed within this window is considered expired.
pub const DEFAULT_NEIGHBORHOOD_EXPIRATION_SECS: u64 = 24 * 3600;

/// Interval between RefreshProfiles pushes to each initialized follower.
pub const DEFAULT_FOLLOWER_REFRESH_SECS: u64 = 12 * 3600;

/// Interval between contact-record refreshes on the CAN gateway.
pub const DEFAULT_CAN_REFRESH_SECS: u64 = 17;

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind all role listeners on.
    pub server_interface: IpAddr,
    /// Plaintext role port (service listing only).
    pub primary_port: u16,
    /// TLS role port for non-customer clients.
    pub client_non_customer_port: u16,
    /// TLS role port for customer clients.
    pub client_customer_port: u16,
    /// TLS role port for neighbor servers.
    pub sr_neighbor_port: u16,
    /// PEM file with the X.509 certificate and private key covering every
    /// encrypted role.
    pub tls_certificate_file: PathBuf,
    /// Root of the persistent database.
    pub data_dir: PathBuf,
    /// Root of the content-addressed image store.
    pub image_data_folder: PathBuf,
    /// Staging root for uploaded images before commit.
    pub temp_data_folder: PathBuf,
    pub max_hosted_identities: usize,
    pub max_followers: usize,
    pub max_neighbor_identities: usize,
    /// External location service; neighborhood discovery is disabled when
    /// unset.
    pub location_service_endpoint: Option<SocketAddr>,
    /// External content-addressable-network gateway; contact-record
    /// publication is disabled when unset.
    pub can_endpoint: Option<SocketAddr>,
    /// This server's advertised GPS location.
    pub location: GpsLocation,
    pub cancellation_retention_secs: u64,
    pub neighborhood_expiration_secs: u64,
    pub follower_refresh_secs: u64,
    pub can_refresh_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            primary_port: 16987,
            client_non_customer_port: 16988,
            client_customer_port: 16989,
            sr_neighbor_port: 16990,
            tls_certificate_file: PathBuf::from("server.pem"),
            data_dir: PathBuf::from("./data"),
            image_data_folder: PathBuf::from("./data/images"),
            temp_data_folder: PathBuf::from("./data/tmp"),
            max_hosted_identities: DEFAULT_MAX_HOSTED_IDENTITIES,
            max_followers: DEFAULT_MAX_FOLLOWERS,
            max_neighbor_identities: DEFAULT_MAX_NEIGHBOR_IDENTITIES,
            location_service_endpoint: None,
            can_endpoint: None,
            location: GpsLocation { latitude: 0, longitude: 0 },
            cancellation_retention_secs: DEFAULT_CANCELLATION_RETENTION_SECS,
            neighborhood_expiration_secs: DEFAULT_NEIGHBORHOOD_EXPIRATION_SECS,
            follower_refresh_secs: DEFAULT_FOLLOWER_REFRESH_SECS,
            can_refresh_secs: DEFAULT_CAN_REFRESH_SECS,
        }
    }
}

impl Config {
    /// Parse the `server_interface` key; `any` binds every interface.
    pub fn parse_interface(value: &str) -> Option<IpAddr> {
        if value.eq_ignore_ascii_case("any") {
            return Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        value.parse().ok()
    }

    pub fn primary_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_interface, self.primary_port)
    }

    pub fn client_non_customer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_interface, self.client_non_customer_port)
    }

    pub fn client_customer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_interface, self.client_customer_port)
    }

    pub fn sr_neighbor_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_interface, self.sr_neighbor_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_parsing() {
        assert_eq!(
            Config::parse_interface("any"),
            Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        );
        assert_eq!(
            Config::parse_interface("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(Config::parse_interface("not-an-ip"), None);
    }
}
