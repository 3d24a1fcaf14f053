//! In-process backend for tests and database-less runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parcel_core::catalog::CatalogEntry;
use parcel_core::{
    AdjudicatedParcel, CityLimitPolygon, DatasetKind, Geometry, ParcelRecord, ParcelRequestCount, ServiceRequest,
    ServiceRequestSummary, SpatialRecord, ZoningPolygon,
};
use tokio::sync::RwLock;

use crate::{CatalogRepository, ParcelSearch, RecordStore, StoreError, StoreResult, UpsertCounts};

#[derive(Debug, Clone)]
struct StoredRow {
    record: SpatialRecord,
    content_hash: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<(DatasetKind, String), StoredRow>,
    catalog: BTreeMap<String, CatalogEntry>,
    unavailable: HashSet<DatasetKind>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every query against `dataset` fail, as a dropped table would.
    pub async fn mark_unavailable(&self, dataset: DatasetKind) {
        self.state.write().await.unavailable.insert(dataset);
    }

    pub async fn records(&self, dataset: DatasetKind) -> Vec<SpatialRecord> {
        let state = self.state.read().await;
        let mut records: Vec<SpatialRecord> = state
            .rows
            .iter()
            .filter(|((kind, _), _)| *kind == dataset)
            .map(|(_, row)| row.record.clone())
            .collect();
        records.sort_by(|a, b| a.external_id().cmp(b.external_id()));
        records
    }
}

impl MemoryState {
    fn check(&self, dataset: DatasetKind) -> StoreResult<()> {
        if self.unavailable.contains(&dataset) {
            Err(StoreError::Unavailable(dataset))
        } else {
            Ok(())
        }
    }

    fn iter(&self, dataset: DatasetKind) -> impl Iterator<Item = &SpatialRecord> {
        self.rows
            .iter()
            .filter(move |((kind, _), _)| *kind == dataset)
            .map(|(_, row)| &row.record)
    }

    /// Parcels sorted by id.
    fn parcels(&self) -> Vec<&ParcelRecord> {
        let mut parcels: Vec<&ParcelRecord> = self
            .iter(DatasetKind::Parcels)
            .filter_map(|record| match record {
                SpatialRecord::Parcel(parcel) => Some(parcel),
                _ => None,
            })
            .collect();
        parcels.sort_by(|a, b| a.parcel_id.cmp(&b.parcel_id));
        parcels
    }

    fn service_requests(&self) -> impl Iterator<Item = &ServiceRequest> {
        self.iter(DatasetKind::ServiceRequests).filter_map(|record| match record {
            SpatialRecord::ServiceRequest(request) => Some(request),
            _ => None,
        })
    }
}

/// Smallest covering area first, then lowest id.
fn smallest_covering<'a, T>(
    candidates: impl Iterator<Item = (&'a Geometry, &'a str, &'a T)>,
    target: &Geometry,
) -> Option<&'a T> {
    candidates
        .filter(|(geometry, _, _)| geometry.covers(target))
        .min_by(|(ga, ia, _), (gb, ib, _)| ga.area().total_cmp(&gb.area()).then_with(|| ia.cmp(ib)))
        .map(|(_, _, value)| value)
}

#[async_trait]
impl RecordStore for MemoryStore {
    /// All or nothing: rows are staged first and written only if every dataset
    /// in the batch is available.
    async fn upsert_batch(&self, records: &[SpatialRecord]) -> StoreResult<UpsertCounts> {
        let mut state = self.state.write().await;
        let mut counts = UpsertCounts::default();
        let mut staged: HashMap<(DatasetKind, String), StoredRow> = HashMap::with_capacity(records.len());
        for record in records {
            state.check(record.dataset())?;
            let key = (record.dataset(), record.external_id().to_string());
            let content_hash = record.content_hash();
            let previous = staged.get(&key).or_else(|| state.rows.get(&key));
            match previous {
                None => counts.inserted += 1,
                Some(existing) if existing.content_hash == content_hash => counts.unchanged += 1,
                Some(_) => counts.updated += 1,
            }
            staged.insert(
                key,
                StoredRow {
                    record: record.clone(),
                    content_hash,
                },
            );
        }
        state.rows.extend(staged);
        Ok(counts)
    }

    async fn get_parcel(&self, parcel_id: &str) -> StoreResult<Option<ParcelRecord>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Parcels)?;
        Ok(state
            .rows
            .get(&(DatasetKind::Parcels, parcel_id.to_string()))
            .and_then(|row| match &row.record {
                SpatialRecord::Parcel(parcel) => Some(parcel.clone()),
                _ => None,
            }))
    }

    async fn count(&self, dataset: DatasetKind) -> StoreResult<u64> {
        let state = self.state.read().await;
        state.check(dataset)?;
        Ok(state.iter(dataset).count() as u64)
    }

    async fn zoning_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<ZoningPolygon>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Zoning)?;
        let Some(target) = &parcel.geometry else {
            return Ok(None);
        };
        let candidates = state.iter(DatasetKind::Zoning).filter_map(|record| match record {
            SpatialRecord::Zoning(zone) => Some((&zone.geometry, zone.zone_id.as_str(), zone)),
            _ => None,
        });
        Ok(smallest_covering(candidates, target).cloned())
    }

    async fn city_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<CityLimitPolygon>> {
        let state = self.state.read().await;
        state.check(DatasetKind::CityLimits)?;
        let Some(target) = &parcel.geometry else {
            return Ok(None);
        };
        let candidates = state.iter(DatasetKind::CityLimits).filter_map(|record| match record {
            SpatialRecord::CityLimit(city) => Some((&city.geometry, city.city_id.as_str(), city)),
            _ => None,
        });
        Ok(smallest_covering(candidates, target).cloned())
    }

    async fn is_adjudicated(&self, parcel_id: &str) -> StoreResult<bool> {
        let state = self.state.read().await;
        state.check(DatasetKind::Adjudicated)?;
        Ok(state
            .rows
            .contains_key(&(DatasetKind::Adjudicated, parcel_id.to_string())))
    }

    async fn service_requests_near(
        &self,
        parcel: &ParcelRecord,
        radius_m: f64,
    ) -> StoreResult<ServiceRequestSummary> {
        let state = self.state.read().await;
        state.check(DatasetKind::ServiceRequests)?;
        let Some(target) = &parcel.geometry else {
            return Ok(ServiceRequestSummary::tally(radius_m, []));
        };
        let nearby = state
            .service_requests()
            .filter(|request| target.distance_m(request.location) <= radius_m);
        Ok(ServiceRequestSummary::tally(radius_m, nearby))
    }

    async fn search_parcels(&self, search: &ParcelSearch) -> StoreResult<Vec<ParcelRecord>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Parcels)?;
        Ok(state
            .parcels()
            .into_iter()
            .filter(|parcel| search.matches(parcel))
            .take(search.limit)
            .cloned()
            .collect())
    }

    async fn list_adjudicated(&self, limit: usize) -> StoreResult<Vec<AdjudicatedParcel>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Adjudicated)?;
        let mut parcels: Vec<AdjudicatedParcel> = state
            .iter(DatasetKind::Adjudicated)
            .filter_map(|record| match record {
                SpatialRecord::Adjudicated(parcel) => Some(parcel.clone()),
                _ => None,
            })
            .collect();
        parcels.sort_by(|a, b| a.parcel_id.cmp(&b.parcel_id));
        parcels.truncate(limit);
        Ok(parcels)
    }

    async fn parcels_in_zone(&self, zone_code: &str, limit: usize) -> StoreResult<Vec<ParcelRecord>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Parcels)?;
        state.check(DatasetKind::Zoning)?;
        let zones: Vec<&Geometry> = state
            .iter(DatasetKind::Zoning)
            .filter_map(|record| match record {
                SpatialRecord::Zoning(zone) if zone.zone_code == zone_code => Some(&zone.geometry),
                _ => None,
            })
            .collect();
        Ok(state
            .parcels()
            .into_iter()
            .filter(|parcel| {
                parcel
                    .geometry
                    .as_ref()
                    .is_some_and(|geometry| zones.iter().any(|zone| zone.intersects(geometry)))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn high_request_parcels(
        &self,
        min_requests: u64,
        radius_m: f64,
        limit: usize,
    ) -> StoreResult<Vec<ParcelRequestCount>> {
        let state = self.state.read().await;
        state.check(DatasetKind::Parcels)?;
        state.check(DatasetKind::ServiceRequests)?;
        let mut counts: Vec<ParcelRequestCount> = state
            .parcels()
            .into_iter()
            .filter_map(|parcel| {
                let geometry = parcel.geometry.as_ref()?;
                let request_count = state
                    .service_requests()
                    .filter(|request| geometry.distance_m(request.location) <= radius_m)
                    .count() as u64;
                (request_count >= min_requests).then(|| ParcelRequestCount {
                    parcel_id: parcel.parcel_id.clone(),
                    owner_name: parcel.owner_name.clone(),
                    site_address: parcel.site_address.clone(),
                    request_count,
                })
            })
            .collect();
        // Stable sort keeps the parcel id order among equal counts.
        counts.sort_by(|a, b| b.request_count.cmp(&a.request_count));
        counts.truncate(limit);
        Ok(counts)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.catalog.contains_key(&entry.source_name) {
            return Ok(false);
        }
        state.catalog.insert(entry.source_name.clone(), entry.clone());
        Ok(true)
    }

    async fn load(&self, source_name: &str) -> StoreResult<Option<CatalogEntry>> {
        Ok(self.state.read().await.catalog.get(source_name).cloned())
    }

    async fn load_all(&self) -> StoreResult<Vec<CatalogEntry>> {
        Ok(self.state.read().await.catalog.values().cloned().collect())
    }

    async fn save(&self, entry: &CatalogEntry) -> StoreResult<()> {
        self.state
            .write()
            .await
            .catalog
            .insert(entry.source_name.clone(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use parcel_core::geometry::{Polygon, Ring};
    use parcel_core::{Coord, RequestStatus};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn square(x0: f64, y0: f64, size: f64) -> Geometry {
        Geometry::MultiPolygon(vec![Polygon::new(
            Ring::closed(vec![
                Coord::new(x0, y0),
                Coord::new(x0 + size, y0),
                Coord::new(x0 + size, y0 + size),
                Coord::new(x0, y0 + size),
            ]),
            vec![],
        )])
    }

    fn parcel(id: &str, owner: &str) -> ParcelRecord {
        ParcelRecord {
            parcel_id: id.into(),
            owner_name: Some(owner.into()),
            site_address: None,
            geometry: Some(square(-91.1005, 30.4005, 0.0005)),
            source_name: "ebr_property_info".into(),
            last_seen_at: ts(),
        }
    }

    fn zone(id: &str, code: &str, geometry: Geometry) -> SpatialRecord {
        SpatialRecord::Zoning(ZoningPolygon {
            zone_id: id.into(),
            zone_code: code.into(),
            zone_name: None,
            geometry,
            source_name: "ebr_zoning".into(),
            last_seen_at: ts(),
        })
    }

    #[tokio::test]
    async fn upsert_distinguishes_insert_update_and_unchanged() {
        let store = MemoryStore::new();
        let first = store
            .upsert_batch(&[SpatialRecord::Parcel(parcel("P1", "Alice"))])
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);

        let mut seen_later = parcel("P1", "Alice");
        seen_later.last_seen_at = ts() + chrono::Duration::days(1);
        let again = store.upsert_batch(&[SpatialRecord::Parcel(seen_later)]).await.unwrap();
        assert_eq!(again.unchanged, 1);

        let changed = store
            .upsert_batch(&[SpatialRecord::Parcel(parcel("P1", "Bob"))])
            .await
            .unwrap();
        assert_eq!(changed.updated, 1);
        assert_eq!(store.count(DatasetKind::Parcels).await.unwrap(), 1);
        let stored = store.get_parcel("P1").await.unwrap().unwrap();
        assert_eq!(stored.owner_name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn overlapping_zones_resolve_to_smallest() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[
                zone("1", "A1", square(-91.2, 30.3, 0.2)),
                zone("2", "C2", square(-91.101, 30.4, 0.002)),
                zone("3", "X", square(-80.0, 30.0, 0.1)),
            ])
            .await
            .unwrap();
        let hit = store.zoning_covering(&parcel("P1", "Alice")).await.unwrap().unwrap();
        assert_eq!(hit.zone_code, "C2");
    }

    #[tokio::test]
    async fn service_requests_within_radius_are_tallied() {
        let store = MemoryStore::new();
        let request = |id: &str, x: f64, status| {
            SpatialRecord::ServiceRequest(ServiceRequest {
                request_id: id.into(),
                request_type: Some("Drainage".into()),
                status,
                created_at: None,
                location: Coord::new(x, 30.40025),
                source_name: "ebr_311_open".into(),
                last_seen_at: ts(),
            })
        };
        store
            .upsert_batch(&[
                request("1", -91.1001, RequestStatus::Open),
                request("2", -91.0980, RequestStatus::Closed),
                request("3", -91.0500, RequestStatus::Open),
            ])
            .await
            .unwrap();
        let summary = store
            .service_requests_near(&parcel("P1", "Alice"), 500.0)
            .await
            .unwrap();
        assert_eq!((summary.total, summary.open, summary.closed), (2, 1, 1));
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let store = MemoryStore::new();
        store.mark_unavailable(DatasetKind::Zoning).await;
        let result = store
            .upsert_batch(&[
                SpatialRecord::Parcel(parcel("P1", "Alice")),
                SpatialRecord::Parcel(parcel("P2", "Bob")),
                zone("Z1", "A1", square(-91.2, 30.3, 0.2)),
                SpatialRecord::Parcel(parcel("P3", "Carol")),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(DatasetKind::Zoning))));
        assert_eq!(store.count(DatasetKind::Parcels).await.unwrap(), 0);
        assert!(store.records(DatasetKind::Parcels).await.is_empty());
    }

    #[tokio::test]
    async fn repeated_id_within_a_batch_counts_against_the_staged_row() {
        let store = MemoryStore::new();
        let counts = store
            .upsert_batch(&[
                SpatialRecord::Parcel(parcel("P1", "Alice")),
                SpatialRecord::Parcel(parcel("P1", "Bob")),
            ])
            .await
            .unwrap();
        assert_eq!((counts.inserted, counts.updated), (1, 1));
        let stored = store.get_parcel("P1").await.unwrap().unwrap();
        assert_eq!(stored.owner_name.as_deref(), Some("Bob"));
    }

    fn request_at(id: &str, x: f64) -> SpatialRecord {
        SpatialRecord::ServiceRequest(ServiceRequest {
            request_id: id.into(),
            request_type: Some("Pothole".into()),
            status: RequestStatus::Open,
            created_at: None,
            location: Coord::new(x, 30.40025),
            source_name: "ebr_311_open".into(),
            last_seen_at: ts(),
        })
    }

    fn parcel_at(id: &str, x0: f64, address: &str) -> SpatialRecord {
        SpatialRecord::Parcel(ParcelRecord {
            site_address: Some(address.into()),
            geometry: Some(square(x0, 30.4005, 0.0005)),
            ..parcel(id, "Owner")
        })
    }

    #[tokio::test]
    async fn search_matches_address_owner_and_id() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[
                parcel_at("P2", -91.1005, "200 Main St"),
                parcel_at("P1", -91.1005, "100 MAIN ST"),
                parcel_at("P3", -91.1005, "5 Oak Ave"),
                SpatialRecord::Parcel(parcel("P4", "Capital Holdings")),
            ])
            .await
            .unwrap();

        let by_address = ParcelSearch {
            address: Some("main st".into()),
            ..ParcelSearch::default()
        };
        let ids: Vec<String> = store
            .search_parcels(&by_address)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.parcel_id)
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);

        let limited = ParcelSearch { limit: 1, ..by_address };
        assert_eq!(store.search_parcels(&limited).await.unwrap().len(), 1);

        let by_owner = ParcelSearch {
            owner: Some("capital".into()),
            ..ParcelSearch::default()
        };
        assert_eq!(store.search_parcels(&by_owner).await.unwrap()[0].parcel_id, "P4");

        let by_id = ParcelSearch {
            parcel_id: Some("P3".into()),
            ..ParcelSearch::default()
        };
        assert_eq!(store.search_parcels(&by_id).await.unwrap().len(), 1);
        assert_eq!(store.search_parcels(&ParcelSearch::default()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn adjudicated_list_is_ordered_and_limited() {
        let store = MemoryStore::new();
        let adjudicated = |id: &str| {
            SpatialRecord::Adjudicated(AdjudicatedParcel {
                parcel_id: id.into(),
                status: Some("Adjudicated".into()),
                owner_name: None,
                site_address: None,
                geometry: None,
                source_name: "ebr_adjudicated".into(),
                last_seen_at: ts(),
            })
        };
        store
            .upsert_batch(&[adjudicated("B"), adjudicated("A"), adjudicated("C")])
            .await
            .unwrap();
        let listed = store.list_adjudicated(2).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|p| p.parcel_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn parcels_in_zone_use_intersection() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[
                zone("Z1", "C2", square(-91.101, 30.4, 0.001)),
                zone("Z2", "C2", square(-91.05, 30.4, 0.001)),
                zone("Z3", "A1", square(-91.2, 30.3, 0.2)),
                parcel_at("P1", -91.1005, "1 Main St"),
                // Straddles the east edge of Z2.
                parcel_at("P2", -91.0498, "2 Main St"),
                parcel_at("P3", -91.0800, "3 Main St"),
                SpatialRecord::Parcel(ParcelRecord {
                    geometry: None,
                    ..parcel("P4", "Nobody")
                }),
            ])
            .await
            .unwrap();
        let ids: Vec<String> = store
            .parcels_in_zone("C2", 100)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.parcel_id)
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);
        assert!(store.parcels_in_zone("R9", 100).await.unwrap().is_empty());
        assert_eq!(store.parcels_in_zone("A1", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn high_request_parcels_rank_by_count() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[
                parcel_at("P1", -91.1005, "1 Main St"),
                parcel_at("P2", -91.0500, "2 Main St"),
                parcel_at("P3", -91.0000, "3 Main St"),
                request_at("1", -91.1001),
                request_at("2", -91.1002),
                request_at("3", -91.1003),
                request_at("4", -91.0498),
                request_at("5", -91.0497),
                request_at("6", -91.0002),
            ])
            .await
            .unwrap();
        let ranked = store.high_request_parcels(2, 100.0, 100).await.unwrap();
        let pairs: Vec<(&str, u64)> = ranked
            .iter()
            .map(|p| (p.parcel_id.as_str(), p.request_count))
            .collect();
        assert_eq!(pairs, vec![("P1", 3), ("P2", 2)]);
        assert_eq!(store.high_request_parcels(1, 100.0, 100).await.unwrap().len(), 3);
        assert_eq!(store.high_request_parcels(1, 100.0, 1).await.unwrap()[0].parcel_id, "P1");
    }

    #[tokio::test]
    async fn unavailable_dataset_errors() {
        let store = MemoryStore::new();
        store.mark_unavailable(DatasetKind::Adjudicated).await;
        assert!(matches!(
            store.is_adjudicated("P1").await,
            Err(StoreError::Unavailable(DatasetKind::Adjudicated))
        ));
    }

    #[tokio::test]
    async fn catalog_insert_if_absent_keeps_existing() {
        use parcel_core::ConnectorKind;
        let store = MemoryStore::new();
        let mut entry = CatalogEntry::new("s", "S", ConnectorKind::Tabular, DatasetKind::Parcels, 3600);
        assert!(store.insert_if_absent(&entry).await.unwrap());
        entry.consecutive_failures = 3;
        store.save(&entry).await.unwrap();

        let fresh = CatalogEntry::new("s", "S", ConnectorKind::Tabular, DatasetKind::Parcels, 3600);
        assert!(!store.insert_if_absent(&fresh).await.unwrap());
        assert_eq!(store.load("s").await.unwrap().unwrap().consecutive_failures, 3);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}
