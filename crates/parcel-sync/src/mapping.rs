//! Raw upstream records to typed spatial records.

use chrono::{DateTime, Utc};
use parcel_connectors::RawRecord;
use parcel_core::clock::parse_remote_timestamp;
use parcel_core::normalize::normalize;
use parcel_core::{
    AdjudicatedParcel, CityLimitPolygon, CoordinateFields, DatasetKind, Geometry, GeometryError, ParcelRecord,
    RequestStatus, ServiceRequest, SpatialRecord, WindingConvention, ZoningPolygon,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::SourceConfig;

/// Why one record was skipped. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("record has no {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("expected {expected} geometry")]
    WrongGeometryKind { expected: &'static str },
    #[error("unrecognized request status {0:?} and no default")]
    UnknownStatus(String),
}

const PARCEL_IDS: &[&str] = &["parcel_id", "PARCEL_ID", "PARCELID", "lot_id", "LOT_ID"];
const OWNER_NAMES: &[&str] = &["owner_name", "OWNER_NAME", "OWNER"];
const SITE_ADDRESSES: &[&str] = &["site_address", "SITE_ADDRESS", "FULL_ADDRESS", "ADDRESS"];
const OBJECT_IDS: &[&str] = &["OBJECTID", "objectid", "FID"];
const ZONE_CODES: &[&str] = &["ZONE_CODE", "ZONING", "zone_code", "zoning"];
const ZONE_NAMES: &[&str] = &["ZONE_NAME", "zone_name", "DESCRIPTION"];
const CITY_NAMES: &[&str] = &["CITY_NAME", "city_name", "NAME", "CITY"];
const CITY_CODES: &[&str] = &["CITY_CODE", "city_code"];
const ADJUDICATION_STATUSES: &[&str] = &["ADJ_STATUS", "STATUS", "status"];
const REQUEST_IDS: &[&str] = &["REQUEST_ID", "request_id", "CASE_NUMBER"];
const REQUEST_TYPES: &[&str] = &["REQUEST_TYPE", "request_type", "TYPE", "PARENT_TYPE"];
const REQUEST_STATUSES: &[&str] = &["STATUS", "status", "STATUS_DESC"];
const REQUEST_CREATED: &[&str] = &["CREATED_DATE", "created_date", "CREATEDDATE", "requested_datetime", "OPEN_DATE"];

fn text_field(attrs: &JsonMap<String, JsonValue>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match attrs.get(*name)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone)]
pub struct RecordMapper {
    source_name: String,
    dataset: DatasetKind,
    id_field: Option<String>,
    winding: WindingConvention,
    status_default: Option<RequestStatus>,
    coordinates: CoordinateFields,
}

impl RecordMapper {
    pub fn for_source(source: &SourceConfig) -> Self {
        Self {
            source_name: source.name.clone(),
            dataset: source.dataset,
            id_field: source.id_field.clone(),
            winding: source.ring_winding,
            status_default: source.status_default,
            coordinates: CoordinateFields::default(),
        }
    }

    fn external_id(&self, attrs: &JsonMap<String, JsonValue>, fallbacks: &[&str]) -> Result<String, MappingError> {
        let configured = self.id_field.as_deref().map(|f| [f]);
        let names: &[&str] = configured.as_ref().map_or(fallbacks, |f| f.as_slice());
        text_field(attrs, names).ok_or(MappingError::MissingField("identifier"))
    }

    /// Both 311 layers share one table, so a bare OBJECTID is scoped by source.
    fn request_id(&self, attrs: &JsonMap<String, JsonValue>) -> Result<String, MappingError> {
        if self.id_field.is_some() {
            return self.external_id(attrs, REQUEST_IDS);
        }
        text_field(attrs, REQUEST_IDS)
            .or_else(|| text_field(attrs, OBJECT_IDS).map(|oid| format!("{}:{oid}", self.source_name)))
            .ok_or(MappingError::MissingField("identifier"))
    }

    fn geometry(&self, raw: &RawRecord) -> Result<Geometry, GeometryError> {
        normalize(&raw.geometry, self.winding, &self.coordinates)
    }

    /// Missing geometry is allowed; broken geometry is not.
    fn optional_geometry(&self, raw: &RawRecord) -> Result<Option<Geometry>, MappingError> {
        match self.geometry(raw) {
            Ok(geometry) => Ok(Some(geometry)),
            Err(GeometryError::Missing) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn polygon_geometry(&self, raw: &RawRecord) -> Result<Geometry, MappingError> {
        match self.geometry(raw)? {
            geometry @ Geometry::MultiPolygon(_) => Ok(geometry),
            Geometry::Point(_) => Err(MappingError::WrongGeometryKind { expected: "polygon" }),
        }
    }

    fn request_status(&self, attrs: &JsonMap<String, JsonValue>) -> Result<RequestStatus, MappingError> {
        let label = text_field(attrs, REQUEST_STATUSES);
        label
            .as_deref()
            .and_then(RequestStatus::from_label)
            .or(self.status_default)
            .ok_or_else(|| MappingError::UnknownStatus(label.unwrap_or_default()))
    }

    pub fn map(&self, raw: &RawRecord, seen_at: DateTime<Utc>) -> Result<SpatialRecord, MappingError> {
        let attrs = &raw.attributes;
        let source_name = self.source_name.clone();
        let record = match self.dataset {
            DatasetKind::Parcels => SpatialRecord::Parcel(ParcelRecord {
                parcel_id: self.external_id(attrs, PARCEL_IDS)?,
                owner_name: text_field(attrs, OWNER_NAMES),
                site_address: text_field(attrs, SITE_ADDRESSES),
                geometry: self.optional_geometry(raw)?,
                source_name,
                last_seen_at: seen_at,
            }),
            DatasetKind::Zoning => SpatialRecord::Zoning(ZoningPolygon {
                zone_id: self.external_id(attrs, OBJECT_IDS)?,
                zone_code: text_field(attrs, ZONE_CODES).ok_or(MappingError::MissingField("zone code"))?,
                zone_name: text_field(attrs, ZONE_NAMES),
                geometry: self.polygon_geometry(raw)?,
                source_name,
                last_seen_at: seen_at,
            }),
            DatasetKind::CityLimits => SpatialRecord::CityLimit(CityLimitPolygon {
                city_id: self.external_id(attrs, OBJECT_IDS)?,
                city_name: text_field(attrs, CITY_NAMES).ok_or(MappingError::MissingField("city name"))?,
                city_code: text_field(attrs, CITY_CODES),
                geometry: self.polygon_geometry(raw)?,
                source_name,
                last_seen_at: seen_at,
            }),
            DatasetKind::Adjudicated => SpatialRecord::Adjudicated(AdjudicatedParcel {
                parcel_id: self.external_id(attrs, PARCEL_IDS)?,
                status: text_field(attrs, ADJUDICATION_STATUSES),
                owner_name: text_field(attrs, OWNER_NAMES),
                site_address: text_field(attrs, SITE_ADDRESSES),
                geometry: self.optional_geometry(raw)?,
                source_name,
                last_seen_at: seen_at,
            }),
            DatasetKind::ServiceRequests => {
                let location = match self.geometry(raw)? {
                    Geometry::Point(coord) => coord,
                    Geometry::MultiPolygon(_) => {
                        return Err(MappingError::WrongGeometryKind { expected: "point" })
                    }
                };
                SpatialRecord::ServiceRequest(ServiceRequest {
                    request_id: self.request_id(attrs)?,
                    request_type: text_field(attrs, REQUEST_TYPES),
                    status: self.request_status(attrs)?,
                    created_at: REQUEST_CREATED
                        .iter()
                        .find_map(|name| attrs.get(*name).and_then(parse_remote_timestamp)),
                    location,
                    source_name,
                    last_seen_at: seen_at,
                })
            }
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parcel_core::{ConnectorKind, RawGeometry};
    use serde_json::json;

    fn source(dataset: DatasetKind) -> SourceConfig {
        SourceConfig {
            name: format!("test_{dataset}"),
            display_name: "Test".into(),
            enabled: true,
            connector: ConnectorKind::Geospatial,
            dataset,
            endpoint: "http://example.test".into(),
            schema_endpoint: None,
            select: Vec::new(),
            filter: None,
            order: None,
            expected_refresh_hours: 24.0,
            id_field: None,
            ring_winding: WindingConvention::ClockwiseExterior,
            status_default: None,
        }
    }

    fn seen() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    fn raw(attributes: JsonValue, geometry: RawGeometry) -> RawRecord {
        let attributes = attributes.as_object().cloned().unwrap_or_default();
        RawRecord {
            raw: JsonValue::Object(attributes.clone()),
            attributes,
            geometry,
        }
    }

    fn clockwise_square() -> RawGeometry {
        RawGeometry::Rings(vec![vec![
            vec![-91.2, 30.4],
            vec![-91.2, 30.5],
            vec![-91.1, 30.5],
            vec![-91.1, 30.4],
            vec![-91.2, 30.4],
        ]])
    }

    #[test]
    fn zoning_maps_esri_attributes_and_rings() {
        let mapper = RecordMapper::for_source(&source(DatasetKind::Zoning));
        let record = mapper
            .map(&raw(json!({ "OBJECTID": 7, "ZONING": "A1", "ZONE_NAME": "Single Family" }), clockwise_square()), seen())
            .unwrap();
        let SpatialRecord::Zoning(zone) = record else {
            panic!("expected zoning");
        };
        assert_eq!(zone.zone_id, "7");
        assert_eq!(zone.zone_code, "A1");
        assert_eq!(zone.zone_name.as_deref(), Some("Single Family"));
        assert!(zone.geometry.area() > 0.0);
    }

    #[test]
    fn parcels_keep_missing_geometry_but_skip_malformed() {
        let mapper = RecordMapper::for_source(&source(DatasetKind::Parcels));
        let bare = raw(json!({ "parcel_id": "P-1", "owner_name": "Alice" }), RawGeometry::Attributes(JsonMap::new()));
        let SpatialRecord::Parcel(parcel) = mapper.map(&bare, seen()).unwrap() else {
            panic!("expected parcel");
        };
        assert!(parcel.geometry.is_none());

        let broken = raw(json!({ "parcel_id": "P-2" }), RawGeometry::Rings(vec![vec![]]));
        assert_eq!(mapper.map(&broken, seen()), Err(MappingError::Geometry(GeometryError::Empty)));
    }

    #[test]
    fn missing_identifier_is_reported() {
        let mapper = RecordMapper::for_source(&source(DatasetKind::Parcels));
        let record = raw(json!({ "owner_name": "Nobody" }), RawGeometry::Point { x: -91.1, y: 30.4 });
        assert_eq!(mapper.map(&record, seen()), Err(MappingError::MissingField("identifier")));
    }

    #[test]
    fn configured_id_field_wins() {
        let mut config = source(DatasetKind::Parcels);
        config.id_field = Some("ASSESSMENT_NUM".into());
        let mapper = RecordMapper::for_source(&config);
        let record = raw(
            json!({ "ASSESSMENT_NUM": "0012345", "parcel_id": "ignored" }),
            RawGeometry::Point { x: -91.1, y: 30.4 },
        );
        assert_eq!(mapper.map(&record, seen()).unwrap().external_id(), "0012345");
    }

    #[test]
    fn zoning_requires_polygon_geometry() {
        let mapper = RecordMapper::for_source(&source(DatasetKind::Zoning));
        let record = raw(json!({ "OBJECTID": 1, "ZONING": "C2" }), RawGeometry::Point { x: -91.1, y: 30.4 });
        assert_eq!(
            mapper.map(&record, seen()),
            Err(MappingError::WrongGeometryKind { expected: "polygon" })
        );
    }

    #[test]
    fn service_request_status_falls_back_to_layer_default() {
        let mut config = source(DatasetKind::ServiceRequests);
        let attrs = json!({
            "REQUEST_ID": "SR-9",
            "REQUEST_TYPE": "Pothole",
            "STATUS": "Escalated",
            "CREATED_DATE": 1_717_200_000_000i64,
            "LATITUDE": 30.45,
            "LONGITUDE": -91.15
        });
        let record = raw(attrs.clone(), RawGeometry::Attributes(attrs.as_object().cloned().unwrap()));

        let strict = RecordMapper::for_source(&config);
        assert_eq!(
            strict.map(&record, seen()),
            Err(MappingError::UnknownStatus("Escalated".into()))
        );

        config.status_default = Some(RequestStatus::Open);
        let lenient = RecordMapper::for_source(&config);
        let SpatialRecord::ServiceRequest(request) = lenient.map(&record, seen()).unwrap() else {
            panic!("expected service request");
        };
        assert_eq!(request.status, RequestStatus::Open);
        assert_eq!(request.request_type.as_deref(), Some("Pothole"));
        assert_eq!(
            request.created_at,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
        assert!((request.location.x + 91.15).abs() < 1e-12);
    }

    #[test]
    fn known_status_labels_override_the_default() {
        let mut config = source(DatasetKind::ServiceRequests);
        config.status_default = Some(RequestStatus::Open);
        let mapper = RecordMapper::for_source(&config);
        let record = raw(json!({ "REQUEST_ID": 3, "STATUS": "Resolved" }), RawGeometry::Point { x: -91.1, y: 30.4 });
        let SpatialRecord::ServiceRequest(request) = mapper.map(&record, seen()).unwrap() else {
            panic!("expected service request");
        };
        assert_eq!(request.status, RequestStatus::Closed);
        assert_eq!(request.request_id, "3");
    }

    #[test]
    fn request_ids_never_collide_across_layers() {
        let attrs = json!({ "OBJECTID": 17, "STATUS": "Open" });
        let point = RawGeometry::Point { x: -91.1, y: 30.4 };

        let mut open = source(DatasetKind::ServiceRequests);
        open.name = "ebr_311_open".into();
        let mut closed = source(DatasetKind::ServiceRequests);
        closed.name = "ebr_311_closed".into();
        let open_id = RecordMapper::for_source(&open).map(&raw(attrs.clone(), point.clone()), seen()).unwrap();
        let closed_id = RecordMapper::for_source(&closed).map(&raw(attrs.clone(), point.clone()), seen()).unwrap();
        assert_eq!(open_id.external_id(), "ebr_311_open:17");
        assert_ne!(open_id.external_id(), closed_id.external_id());

        let with_request_id = json!({ "OBJECTID": 17, "REQUEST_ID": "311-0042", "STATUS": "Open" });
        let record = RecordMapper::for_source(&open).map(&raw(with_request_id, point.clone()), seen()).unwrap();
        assert_eq!(record.external_id(), "311-0042");

        open.id_field = Some("REQUEST_ID".into());
        assert_eq!(
            RecordMapper::for_source(&open).map(&raw(attrs, point), seen()),
            Err(MappingError::MissingField("identifier"))
        );
    }
}
