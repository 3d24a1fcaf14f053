//! Runs against a real PostGIS database when `PARCEL_TEST_DATABASE_URL` is set; skipped otherwise.

use chrono::{TimeZone, Utc};
use parcel_core::geometry::{Polygon, Ring};
use parcel_core::{
    AdjudicatedParcel, Coord, DatasetKind, Geometry, ParcelRecord, RequestStatus, ServiceRequest, SpatialRecord,
    ZoningPolygon,
};
use parcel_storage::{ParcelSearch, PgStore, RecordStore};

async fn store() -> Option<PgStore> {
    let url = std::env::var("PARCEL_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
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

#[tokio::test]
async fn centroid_only_parcels_round_trip_through_postgis() {
    let Some(store) = store().await else {
        eprintln!("PARCEL_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let seen = Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap();
    let centroid = Coord::new(-91.1485, 30.4505);
    let parcel_id = format!("RT-{}", uuid::Uuid::new_v4());
    let zone_code = format!("RT{}", &parcel_id[3..11]);

    let counts = store
        .upsert_batch(&[
            SpatialRecord::Parcel(ParcelRecord {
                parcel_id: parcel_id.clone(),
                owner_name: Some("Round Trip LLC".into()),
                site_address: Some("100 Main St".into()),
                geometry: Some(Geometry::Point(centroid)),
                source_name: "ebr_property_info".into(),
                last_seen_at: seen,
            }),
            SpatialRecord::Adjudicated(AdjudicatedParcel {
                parcel_id: parcel_id.clone(),
                status: Some("Adjudicated".into()),
                owner_name: None,
                site_address: None,
                geometry: Some(Geometry::Point(centroid)),
                source_name: "ebr_adjudicated".into(),
                last_seen_at: seen,
            }),
            SpatialRecord::Zoning(ZoningPolygon {
                zone_id: format!("Z-{parcel_id}"),
                zone_code: zone_code.clone(),
                zone_name: None,
                geometry: square(-91.149, 30.450, 0.001),
                source_name: "ebr_zoning".into(),
                last_seen_at: seen,
            }),
            SpatialRecord::ServiceRequest(ServiceRequest {
                request_id: format!("SR-{parcel_id}"),
                request_type: Some("Pothole".into()),
                status: RequestStatus::Open,
                created_at: None,
                location: Coord::new(-91.1486, 30.4506),
                source_name: "ebr_311_open".into(),
                last_seen_at: seen,
            }),
        ])
        .await
        .expect("point geometries are accepted");
    assert_eq!(counts.inserted, 4);

    let parcel = store.get_parcel(&parcel_id).await.expect("read").expect("parcel");
    assert_eq!(parcel.geometry, Some(Geometry::Point(centroid)));
    assert!(store.is_adjudicated(&parcel_id).await.expect("adjudicated"));

    let zone = store.zoning_covering(&parcel).await.expect("zoning");
    assert_eq!(zone.map(|z| z.zone_code), Some(zone_code.clone()));
    let nearby = store.service_requests_near(&parcel, 100.0).await.expect("requests");
    assert!(nearby.total >= 1);

    let found = store
        .search_parcels(&ParcelSearch {
            parcel_id: Some(parcel_id.clone()),
            ..ParcelSearch::default()
        })
        .await
        .expect("search");
    assert_eq!(found.len(), 1);
    let in_zone = store.parcels_in_zone(&zone_code, 10).await.expect("zone parcels");
    assert_eq!(in_zone[0].parcel_id, parcel_id);
    assert!(store.count(DatasetKind::Parcels).await.expect("count") >= 1);
}
