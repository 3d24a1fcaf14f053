//! Persistence, HTTP fetch and caching utilities for parcel ingestion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_core::catalog::CatalogEntry;
use parcel_core::{
    AdjudicatedParcel, CityLimitPolygon, DatasetKind, GeometryError, ParcelRecord, ParcelRequestCount,
    ServiceRequestSummary, SpatialRecord, ZoningPolygon,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod snapshot;

pub use cache::ResponseCache;
pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, HttpRequestSpec, TokenBucketConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use snapshot::{RawSnapshotStore, StoredSnapshot};

pub const CRATE_NAME: &str = "parcel-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored geometry is invalid: {0}")]
    Geometry(#[from] GeometryError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} table is unavailable")]
    Unavailable(DatasetKind),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn merge(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Largest page any list or search query returns.
pub const MAX_LIST_LIMIT: usize = 500;

/// Parcel search filters. Every filter given must match; blank filters are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParcelSearch {
    /// Case-insensitive substring of the site address.
    pub address: Option<String>,
    /// Case-insensitive substring of the owner name.
    pub owner: Option<String>,
    pub parcel_id: Option<String>,
    pub limit: usize,
}

impl Default for ParcelSearch {
    fn default() -> Self {
        Self {
            address: None,
            owner: None,
            parcel_id: None,
            limit: 50,
        }
    }
}

fn term(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ParcelSearch {
    pub fn address_term(&self) -> Option<&str> {
        term(&self.address)
    }

    pub fn owner_term(&self) -> Option<&str> {
        term(&self.owner)
    }

    pub fn parcel_id_term(&self) -> Option<&str> {
        term(&self.parcel_id)
    }

    pub fn matches(&self, parcel: &ParcelRecord) -> bool {
        let contains = |field: &Option<String>, needle: &str| {
            field
                .as_deref()
                .is_some_and(|value| value.to_lowercase().contains(&needle.to_lowercase()))
        };
        self.address_term().map_or(true, |t| contains(&parcel.site_address, t))
            && self.owner_term().map_or(true, |t| contains(&parcel.owner_name, t))
            && self.parcel_id_term().map_or(true, |t| parcel.parcel_id == t)
    }
}

/// Spatial record storage keyed by (dataset, external id).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-update by external id. Rows whose content is unchanged only
    /// get `last_seen_at` refreshed; rows absent from the batch are untouched.
    async fn upsert_batch(&self, records: &[SpatialRecord]) -> StoreResult<UpsertCounts>;

    async fn get_parcel(&self, parcel_id: &str) -> StoreResult<Option<ParcelRecord>>;

    async fn count(&self, dataset: DatasetKind) -> StoreResult<u64>;

    /// Zone covering the parcel; smallest area wins, then lowest zone id.
    async fn zoning_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<ZoningPolygon>>;

    /// City covering the parcel; same tie-break as zoning.
    async fn city_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<CityLimitPolygon>>;

    async fn is_adjudicated(&self, parcel_id: &str) -> StoreResult<bool>;

    async fn service_requests_near(
        &self,
        parcel: &ParcelRecord,
        radius_m: f64,
    ) -> StoreResult<ServiceRequestSummary>;

    /// Matching parcels ordered by parcel id.
    async fn search_parcels(&self, search: &ParcelSearch) -> StoreResult<Vec<ParcelRecord>>;

    async fn list_adjudicated(&self, limit: usize) -> StoreResult<Vec<AdjudicatedParcel>>;

    /// Parcels intersecting any polygon of the zone, ordered by parcel id.
    async fn parcels_in_zone(&self, zone_code: &str, limit: usize) -> StoreResult<Vec<ParcelRecord>>;

    /// Parcels with at least `min_requests` service requests within `radius_m`,
    /// busiest first, ties by parcel id.
    async fn high_request_parcels(
        &self,
        min_requests: u64,
        radius_m: f64,
        limit: usize,
    ) -> StoreResult<Vec<ParcelRequestCount>>;
}

/// Catalog persistence. Only the catalog service writes through this.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Returns true when the entry was created.
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> StoreResult<bool>;

    async fn load(&self, source_name: &str) -> StoreResult<Option<CatalogEntry>>;

    async fn load_all(&self) -> StoreResult<Vec<CatalogEntry>>;

    async fn save(&self, entry: &CatalogEntry) -> StoreResult<()>;
}

/// Never move a success timestamp backwards.
pub fn monotonic_success(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.map_or(now, |prev| prev.max(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn upsert_counts_merge() {
        let mut total = UpsertCounts {
            inserted: 2,
            updated: 1,
            unchanged: 0,
        };
        total.merge(UpsertCounts {
            inserted: 0,
            updated: 1,
            unchanged: 5,
        });
        assert_eq!(total.total(), 9);
        assert_eq!(total.updated, 2);
    }

    #[test]
    fn search_filters_are_case_insensitive_and_ignore_blanks() {
        let parcel = ParcelRecord {
            parcel_id: "P1".into(),
            owner_name: Some("Capital Holdings LLC".into()),
            site_address: Some("100 Main St".into()),
            geometry: None,
            source_name: "ebr_property_info".into(),
            last_seen_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        };
        let search = |address: Option<&str>, owner: Option<&str>, id: Option<&str>| ParcelSearch {
            address: address.map(str::to_string),
            owner: owner.map(str::to_string),
            parcel_id: id.map(str::to_string),
            ..ParcelSearch::default()
        };
        assert!(search(Some("main"), None, None).matches(&parcel));
        assert!(search(None, Some("HOLDINGS"), Some("P1")).matches(&parcel));
        assert!(search(Some("  "), None, None).matches(&parcel));
        assert!(!search(Some("main"), Some("smith"), None).matches(&parcel));
        assert!(!search(None, None, Some("p1")).matches(&parcel));
        assert_eq!(ParcelSearch::default().limit, 50);
    }

    #[test]
    fn success_timestamp_never_regresses() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let ahead = now + Duration::hours(1);
        assert_eq!(monotonic_success(None, now), now);
        assert_eq!(monotonic_success(Some(ahead), now), ahead);
        assert_eq!(monotonic_success(Some(now - Duration::hours(1)), now), now);
    }
}
