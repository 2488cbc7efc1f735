//! Core value types shared across the server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 digest, the shape of every identifier in the network.
pub type Hash = [u8; 32];

/// Identifier of an identity: SHA256 of its Ed25519 public key.
pub type IdentityId = Hash;

/// Identifier of a profile server, same derivation as [`IdentityId`].
pub type ServerId = Hash;

/// Current UNIX time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Semantic version of a profile, stored as three bytes.
///
/// A profile with version 0.0.0 has never been initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileVersion(pub u8, pub u8, pub u8);

impl ProfileVersion {
    pub const ZERO: ProfileVersion = ProfileVersion(0, 0, 0);

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [a, b, c] => Some(Self(*a, *b, *c)),
            _ => None,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.0, self.1, self.2]
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Display for ProfileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

// =============================================================================
// GEOGRAPHIC LOCATION
// =============================================================================

/// Mean earth radius in meters used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fixed-point scale for latitude/longitude: six fractional decimal digits.
pub const LOCATION_SCALE: f64 = 1_000_000.0;

/// Geographic point stored as micro-degrees.
///
/// Latitude is clamped to [-90, 90], longitude to [-180, 180]; values outside
/// those ranges are rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsLocation {
    /// Latitude in micro-degrees.
    pub latitude: i32,
    /// Longitude in micro-degrees.
    pub longitude: i32,
}

impl GpsLocation {
    pub fn new(latitude: i32, longitude: i32) -> Option<Self> {
        let loc = Self { latitude, longitude };
        loc.is_valid().then_some(loc)
    }

    pub fn from_degrees(latitude: f64, longitude: f64) -> Option<Self> {
        Self::new(
            (latitude * LOCATION_SCALE).round() as i32,
            (longitude * LOCATION_SCALE).round() as i32,
        )
    }

    pub fn is_valid(&self) -> bool {
        let lat = self.latitude as f64 / LOCATION_SCALE;
        let lon = self.longitude as f64 / LOCATION_SCALE;
        (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude as f64 / LOCATION_SCALE
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude as f64 / LOCATION_SCALE
    }

    /// Great-circle distance to `other` in meters (haversine, spherical earth).
    pub fn distance_m(&self, other: &GpsLocation) -> f64 {
        let lat1 = self.latitude_deg().to_radians();
        let lat2 = other.latitude_deg().to_radians();
        let dlat = (other.latitude_deg() - self.latitude_deg()).to_radians();
        let dlon = (other.longitude_deg() - self.longitude_deg()).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_M * c
    }
}

// =============================================================================
// PROFILE LIMITS
// =============================================================================

/// Maximum profile name length in bytes (UTF-8).
pub const MAX_PROFILE_NAME_BYTES: usize = 64;

/// Maximum profile type length in bytes.
pub const MAX_PROFILE_TYPE_BYTES: usize = 64;

/// Maximum extraData length in bytes.
pub const MAX_PROFILE_EXTRA_DATA_BYTES: usize = 200;

/// Maximum accepted image payload (profile or thumbnail).
pub const MAX_IMAGE_BYTES: usize = 128 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bytes_roundtrip() {
        let v = ProfileVersion(1, 2, 3);
        assert_eq!(ProfileVersion::from_bytes(&v.to_bytes()), Some(v));
        assert_eq!(ProfileVersion::from_bytes(&[1, 2]), None);
        assert!(ProfileVersion::ZERO.is_zero());
    }

    #[test]
    fn location_validation() {
        assert!(GpsLocation::new(90_000_000, 180_000_000).is_some());
        assert!(GpsLocation::new(90_000_001, 0).is_none());
        assert!(GpsLocation::new(0, -180_000_001).is_none());
    }

    #[test]
    fn distance_symmetry() {
        let prague = GpsLocation::from_degrees(50.0755, 14.4378).unwrap();
        let berlin = GpsLocation::from_degrees(52.5200, 13.4050).unwrap();

        let d1 = prague.distance_m(&berlin);
        let d2 = berlin.distance_m(&prague);
        assert!((d1 - d2).abs() < 10.0);
        assert!(prague.distance_m(&prague) < 10.0);

        // Known distance Prague-Berlin is ~280 km
        assert!((d1 - 280_000.0).abs() < 10_000.0);
    }
}
