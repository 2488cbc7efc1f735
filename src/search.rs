//! Combined local + neighbor profile search.
//!
//! Candidates are the initialized, non-cancelled hosted identities plus,
//! unless the request is hosted-only, the mirrored identities of
//! initialized, non-expired neighbors. Regex filters run under an aggregate
//! time budget: when the budget expires, remaining rows are treated as
//! non-matching and the partial result is returned, so no request can hang
//! the connection.

use crate::config::Config;
use crate::error::{ServerError, ServerResult};
use crate::images::ImageStore;
use crate::proto::{ProfileSearchRequest, SearchProfileRecord};
use crate::store::Store;
use crate::types::{now, GpsLocation};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Hard cap on matches retained for paging.
pub const MAX_TOTAL_RECORDS: u32 = 1000;

/// Hard cap on records inlined into a single response.
pub const MAX_RESPONSE_RECORDS: u32 = 100;

/// Aggregate time budget for one search request.
pub const SEARCH_TIME_BUDGET: Duration = Duration::from_secs(1);

/// Compiled-size cap for user-supplied regexes. The engine is linear-time,
/// so the size cap plus the aggregate budget bounds all regex work.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How long a cached result set stays pageable.
pub const SEARCH_CACHE_TTL: Duration = Duration::from_secs(120);

/// Parsed and validated search parameters.
pub struct SearchQuery {
    pub include_hosted_only: bool,
    pub include_thumbnails: bool,
    type_filter: Option<Regex>,
    name_filter: Option<Regex>,
    extra_data_filter: Option<Regex>,
    location: Option<(GpsLocation, f64)>,
    pub max_response_records: usize,
    pub max_total_records: usize,
}

fn compile(pattern: &str) -> ServerResult<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map(Some)
        .map_err(|e| ServerError::InvalidValue(format!("bad regex: {e}")))
}

impl SearchQuery {
    pub fn parse(req: &ProfileSearchRequest) -> ServerResult<Self> {
        let location = match (req.latitude, req.longitude) {
            (Some(latitude), Some(longitude)) if req.radius > 0 => {
                let point = GpsLocation::new(latitude, longitude)
                    .ok_or_else(|| ServerError::invalid_value("location out of range"))?;
                Some((point, req.radius as f64))
            }
            (None, None) => None,
            _ if req.radius == 0 => None,
            _ => return Err(ServerError::invalid_value("radius requires a location")),
        };

        let max_total = match req.max_total_record_count {
            0 => return Err(ServerError::invalid_value("maxResults must be positive")),
            n if n > MAX_TOTAL_RECORDS => {
                return Err(ServerError::invalid_value("maxResults too large"))
            }
            n => n as usize,
        };
        let max_response = match req.max_response_record_count {
            0 => return Err(ServerError::invalid_value("maxResponseRecords must be positive")),
            n if n > MAX_RESPONSE_RECORDS => {
                return Err(ServerError::invalid_value("maxResponseRecords too large"))
            }
            n => (n as usize).min(max_total),
        };

        Ok(Self {
            include_hosted_only: req.include_hosted_only,
            include_thumbnails: req.include_thumbnail_images,
            type_filter: compile(&req.profile_type)?,
            name_filter: compile(&req.name)?,
            extra_data_filter: compile(&req.extra_data)?,
            location,
            max_response_records: max_response,
            max_total_records: max_total,
        })
    }

    fn matches(&self, name: &str, profile_type: &str, extra_data: &str, at: &GpsLocation) -> bool {
        if let Some((center, radius)) = &self.location {
            if center.distance_m(at) > *radius {
                return false;
            }
        }
        if let Some(re) = &self.type_filter {
            if !re.is_match(profile_type) {
                return false;
            }
        }
        if let Some(re) = &self.name_filter {
            if !re.is_match(name) {
                return false;
            }
        }
        if let Some(re) = &self.extra_data_filter {
            if !re.is_match(extra_data) {
                return false;
            }
        }
        true
    }
}

pub struct SearchOutcome {
    /// Up to `max_total_records` matches, stable within this result set.
    pub records: Vec<SearchProfileRecord>,
    /// True when the time budget expired before the scan completed.
    pub truncated: bool,
}

pub struct SearchEngine {
    store: Store,
    images: ImageStore,
    neighborhood_expiration_secs: u64,
}

impl SearchEngine {
    pub fn new(store: Store, images: ImageStore, config: &Config) -> Self {
        Self {
            store,
            images,
            neighborhood_expiration_secs: config.neighborhood_expiration_secs,
        }
    }

    pub fn search(&self, query: &SearchQuery) -> ServerResult<SearchOutcome> {
        let deadline = Instant::now() + SEARCH_TIME_BUDGET;
        let mut records = Vec::new();
        let mut truncated = false;

        'hosted: for item in self.store.hosted_iter() {
            if records.len() >= query.max_total_records {
                break;
            }
            if Instant::now() >= deadline {
                truncated = true;
                break 'hosted;
            }
            let record = item?;
            if !record.initialized || record.cancelled {
                continue;
            }
            if query.matches(
                &record.name,
                &record.profile_type,
                &record.extra_data,
                &record.location,
            ) {
                let thumbnail = if query.include_thumbnails {
                    match record.thumbnail_image_hash {
                        Some(hash) => self.images.get(&hash)?,
                        None => None,
                    }
                } else {
                    None
                };
                records.push(SearchProfileRecord {
                    signed_profile: Some(record.signed_profile()),
                    hosting_server_id: Vec::new(),
                    thumbnail_image: thumbnail,
                });
            }
        }

        if !query.include_hosted_only && !truncated && records.len() < query.max_total_records {
            let cutoff = now().saturating_sub(self.neighborhood_expiration_secs);
            let live_neighbors: HashSet<_> = self
                .store
                .neighbors()?
                .into_iter()
                .filter(|n| n.initialized && n.last_refresh_time >= cutoff)
                .map(|n| n.network_id)
                .collect();

            for item in self.store.neighbor_profiles_iter() {
                if records.len() >= query.max_total_records {
                    break;
                }
                if Instant::now() >= deadline {
                    truncated = true;
                    break;
                }
                let record = item?;
                if !live_neighbors.contains(&record.hosting_server_id) {
                    continue;
                }
                if query.matches(
                    &record.name,
                    &record.profile_type,
                    &record.extra_data,
                    &record.location,
                ) {
                    records.push(SearchProfileRecord {
                        signed_profile: Some(record.signed_profile()),
                        hosting_server_id: record.hosting_server_id.to_vec(),
                        // Mirrored profiles carry only image hashes; the
                        // bytes live on the owning server.
                        thumbnail_image: None,
                    });
                }
            }
        }

        debug!(
            "Search matched {} records{}",
            records.len(),
            if truncated { " (budget expired)" } else { "" }
        );
        Ok(SearchOutcome { records, truncated })
    }
}

/// Result set cached on a conversation for ProfileSearchPart paging.
pub struct SearchCache {
    pub token: [u8; 16],
    records: Vec<SearchProfileRecord>,
    created: Instant,
}

impl SearchCache {
    pub fn new(records: Vec<SearchProfileRecord>) -> Self {
        Self { token: rand::random(), records, created: Instant::now() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn expired(&self) -> bool {
        self.created.elapsed() > SEARCH_CACHE_TTL
    }

    pub fn page(&self, index: usize, count: usize) -> Option<&[SearchProfileRecord]> {
        if index > self.records.len() || count == 0 {
            return None;
        }
        let end = index.checked_add(count)?.min(self.records.len());
        Some(&self.records[index..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::store::records::HostedIdentityRecord;
    use crate::types::ProfileVersion;

    fn engine_with_profiles(names: &[(&str, &str, f64, f64)]) -> (tempfile::TempDir, SearchEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let images =
            ImageStore::open(&dir.path().join("images"), &dir.path().join("tmp")).unwrap();

        for (name, profile_type, lat, lon) in names {
            let keys = Keypair::generate();
            let mut record = HostedIdentityRecord::reserve(keys.public.to_vec(), now());
            record.version = ProfileVersion(1, 0, 0);
            record.name = name.to_string();
            record.profile_type = profile_type.to_string();
            record.location = GpsLocation::from_degrees(*lat, *lon).unwrap();
            record.initialized = true;
            record.signature = keys.sign(&record.profile_information().canonical_bytes());
            store.register_hosting(&record, 100).unwrap();
        }

        let engine = SearchEngine::new(store, images, &Config::default());
        (dir, engine)
    }

    fn query(req: ProfileSearchRequest) -> SearchQuery {
        SearchQuery::parse(&req).unwrap()
    }

    fn base_request() -> ProfileSearchRequest {
        ProfileSearchRequest {
            include_hosted_only: true,
            max_response_record_count: 10,
            max_total_record_count: 100,
            ..Default::default()
        }
    }

    #[test]
    fn name_regex_filters() {
        let (_dir, engine) = engine_with_profiles(&[
            ("alice", "person", 0.0, 0.0),
            ("bob", "person", 0.0, 0.0),
            ("alicia", "person", 0.0, 0.0),
        ]);

        let mut req = base_request();
        req.name = "^ali".into();
        let outcome = engine.search(&query(req)).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(!outcome.truncated);
    }

    #[test]
    fn radius_filter_uses_great_circle_distance() {
        let (_dir, engine) = engine_with_profiles(&[
            ("prague", "city", 50.0755, 14.4378),
            ("berlin", "city", 52.5200, 13.4050),
        ]);

        let mut req = base_request();
        let center = GpsLocation::from_degrees(50.0, 14.4).unwrap();
        req.latitude = Some(center.latitude);
        req.longitude = Some(center.longitude);
        req.radius = 50_000;
        let outcome = engine.search(&query(req)).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(
            outcome.records[0].signed_profile.as_ref().unwrap().profile.as_ref().unwrap().name,
            "prague"
        );
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut req = base_request();
        req.name = "(unclosed".into();
        assert!(SearchQuery::parse(&req).is_err());
    }

    #[test]
    fn caps_are_validated() {
        let mut req = base_request();
        req.max_total_record_count = MAX_TOTAL_RECORDS + 1;
        assert!(SearchQuery::parse(&req).is_err());

        let mut req = base_request();
        req.max_response_record_count = MAX_RESPONSE_RECORDS + 1;
        assert!(SearchQuery::parse(&req).is_err());
    }

    #[test]
    fn cache_pages_are_bounded() {
        let records = vec![SearchProfileRecord::default(); 25];
        let cache = SearchCache::new(records);

        assert_eq!(cache.page(0, 10).unwrap().len(), 10);
        assert_eq!(cache.page(20, 10).unwrap().len(), 5);
        assert!(cache.page(26, 1).is_none());
        assert!(cache.page(0, 0).is_none());
    }
}
