//! Core domain model for parcel overlays and source freshness tracking.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod catalog;
pub mod clock;
pub mod geometry;
pub mod normalize;

pub use geometry::{Coord, Geometry};
pub use normalize::{CoordinateFields, GeometryError, RawGeometry, WindingConvention};

pub const CRATE_NAME: &str = "parcel-core";

/// Default search radius for nearby service requests.
pub const DEFAULT_SERVICE_REQUEST_RADIUS_M: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Parcels,
    Zoning,
    CityLimits,
    Adjudicated,
    ServiceRequests,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Parcels => "parcels",
            DatasetKind::Zoning => "zoning",
            DatasetKind::CityLimits => "city_limits",
            DatasetKind::Adjudicated => "adjudicated",
            DatasetKind::ServiceRequests => "service_requests",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Tabular,
    Geospatial,
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectorKind::Tabular => "tabular",
            ConnectorKind::Geospatial => "geospatial",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub parcel_id: String,
    pub owner_name: Option<String>,
    pub site_address: Option<String>,
    pub geometry: Option<Geometry>,
    pub source_name: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoningPolygon {
    pub zone_id: String,
    pub zone_code: String,
    pub zone_name: Option<String>,
    pub geometry: Geometry,
    pub source_name: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityLimitPolygon {
    pub city_id: String,
    pub city_name: String,
    pub city_code: Option<String>,
    pub geometry: Geometry,
    pub source_name: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicatedParcel {
    pub parcel_id: String,
    pub status: Option<String>,
    pub owner_name: Option<String>,
    pub site_address: Option<String>,
    pub geometry: Option<Geometry>,
    pub source_name: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Closed,
}

impl RequestStatus {
    /// Maps upstream status labels; `None` for labels this service does not know.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "open" | "in progress" | "in_progress" | "assigned" | "new" | "pending" | "acknowledged" => {
                Some(RequestStatus::Open)
            }
            "closed" | "resolved" | "completed" | "complete" | "cancelled" | "canceled" | "duplicate" => {
                Some(RequestStatus::Closed)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub request_id: String,
    pub request_type: Option<String>,
    pub status: RequestStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub location: Coord,
    pub source_name: String,
    pub last_seen_at: DateTime<Utc>,
}

/// Any record the ingestion pipeline can persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpatialRecord {
    Parcel(ParcelRecord),
    Zoning(ZoningPolygon),
    CityLimit(CityLimitPolygon),
    Adjudicated(AdjudicatedParcel),
    ServiceRequest(ServiceRequest),
}

impl SpatialRecord {
    pub fn dataset(&self) -> DatasetKind {
        match self {
            SpatialRecord::Parcel(_) => DatasetKind::Parcels,
            SpatialRecord::Zoning(_) => DatasetKind::Zoning,
            SpatialRecord::CityLimit(_) => DatasetKind::CityLimits,
            SpatialRecord::Adjudicated(_) => DatasetKind::Adjudicated,
            SpatialRecord::ServiceRequest(_) => DatasetKind::ServiceRequests,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            SpatialRecord::Parcel(r) => &r.parcel_id,
            SpatialRecord::Zoning(r) => &r.zone_id,
            SpatialRecord::CityLimit(r) => &r.city_id,
            SpatialRecord::Adjudicated(r) => &r.parcel_id,
            SpatialRecord::ServiceRequest(r) => &r.request_id,
        }
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        match self {
            SpatialRecord::Parcel(r) => r.last_seen_at,
            SpatialRecord::Zoning(r) => r.last_seen_at,
            SpatialRecord::CityLimit(r) => r.last_seen_at,
            SpatialRecord::Adjudicated(r) => r.last_seen_at,
            SpatialRecord::ServiceRequest(r) => r.last_seen_at,
        }
    }

    /// sha256 of the record content excluding `last_seen_at`, so re-ingesting
    /// unchanged data leaves stored rows untouched.
    pub fn content_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("last_seen_at");
        }
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoningSummary {
    pub code: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitySummary {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequestSummary {
    pub radius_m: f64,
    pub total: u64,
    pub open: u64,
    pub closed: u64,
    pub by_type: BTreeMap<String, u64>,
}

impl ServiceRequestSummary {
    pub fn tally<'a>(radius_m: f64, requests: impl IntoIterator<Item = &'a ServiceRequest>) -> Self {
        let mut summary = Self {
            radius_m,
            ..Self::default()
        };
        for request in requests {
            summary.total += 1;
            match request.status {
                RequestStatus::Open => summary.open += 1,
                RequestStatus::Closed => summary.closed += 1,
            }
            let key = request
                .request_type
                .clone()
                .unwrap_or_else(|| "Unknown".to_string());
            *summary.by_type.entry(key).or_default() += 1;
        }
        summary
    }
}

/// A parcel and how many service requests fall within the search radius of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelRequestCount {
    pub parcel_id: String,
    pub owner_name: Option<String>,
    pub site_address: Option<String>,
    pub request_count: u64,
}

/// Combined spatial context for one parcel. `None` marks a sub-lookup that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelOverlay {
    pub parcel_id: String,
    pub owner_name: Option<String>,
    pub site_address: Option<String>,
    pub has_geometry: bool,
    pub zoning: Option<ZoningSummary>,
    pub city: Option<CitySummary>,
    pub adjudicated: Option<bool>,
    pub service_requests: Option<ServiceRequestSummary>,
    pub degraded_lookups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn request(id: &str, kind: Option<&str>, status: RequestStatus) -> ServiceRequest {
        ServiceRequest {
            request_id: id.to_string(),
            request_type: kind.map(str::to_string),
            status,
            created_at: None,
            location: Coord::new(-91.1, 30.4),
            source_name: "ebr_311_open".into(),
            last_seen_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn content_hash_ignores_last_seen_at() {
        let a = SpatialRecord::ServiceRequest(request("1", Some("Pothole"), RequestStatus::Open));
        let mut later = request("1", Some("Pothole"), RequestStatus::Open);
        later.last_seen_at += Duration::days(3);
        let b = SpatialRecord::ServiceRequest(later);
        assert_eq!(a.content_hash(), b.content_hash());

        let closed = SpatialRecord::ServiceRequest(request("1", Some("Pothole"), RequestStatus::Closed));
        assert_ne!(a.content_hash(), closed.content_hash());
    }

    #[test]
    fn status_labels_normalize() {
        assert_eq!(RequestStatus::from_label("Open"), Some(RequestStatus::Open));
        assert_eq!(RequestStatus::from_label(" IN PROGRESS "), Some(RequestStatus::Open));
        assert_eq!(RequestStatus::from_label("Closed"), Some(RequestStatus::Closed));
        assert_eq!(RequestStatus::from_label("Resolved"), Some(RequestStatus::Closed));
        assert_eq!(RequestStatus::from_label("Escalated"), None);
    }

    #[test]
    fn tally_groups_by_type_and_status() {
        let requests = [
            request("1", Some("Pothole"), RequestStatus::Open),
            request("2", Some("Pothole"), RequestStatus::Closed),
            request("3", None, RequestStatus::Open),
        ];
        let summary = ServiceRequestSummary::tally(500.0, &requests);
        assert_eq!((summary.total, summary.open, summary.closed), (3, 2, 1));
        assert_eq!(summary.by_type.get("Pothole"), Some(&2));
        assert_eq!(summary.by_type.get("Unknown"), Some(&1));
    }

    #[test]
    fn records_report_dataset_and_id() {
        let record = SpatialRecord::ServiceRequest(request("42", None, RequestStatus::Open));
        assert_eq!(record.dataset(), DatasetKind::ServiceRequests);
        assert_eq!(record.external_id(), "42");
        assert_eq!(DatasetKind::CityLimits.to_string(), "city_limits");
    }
}
