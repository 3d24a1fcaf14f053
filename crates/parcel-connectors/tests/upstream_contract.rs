use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use parcel_connectors::{ConnectorError, GeospatialConnector, SourceConnector, SourceQuery, TabularConnector};
use parcel_core::RawGeometry;
use parcel_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, ResponseCache};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    failures_before_success: usize,
    last_params: Arc<Mutex<HashMap<String, String>>>,
}

impl Upstream {
    fn failing(times: usize) -> Self {
        Self {
            failures_before_success: times,
            ..Self::default()
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_param(&self, key: &str) -> Option<String> {
        self.last_params.lock().unwrap().get(key).cloned()
    }
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn fetcher(max_attempts: usize) -> Arc<HttpFetcher> {
    fetcher_with_timeout(max_attempts, Duration::from_secs(5))
}

fn fetcher_with_timeout(max_attempts: usize, attempt_timeout: Duration) -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            attempt_timeout,
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..HttpClientConfig::default()
        })
        .expect("fetcher"),
    )
}

fn cache() -> ResponseCache {
    ResponseCache::new(Duration::from_secs(60), 64)
}

async fn flaky_rows(State(up): State<Upstream>) -> Response {
    let hit = up.hits.fetch_add(1, Ordering::SeqCst);
    if hit < up.failures_before_success {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!([{ "parcel_id": "P1", "owner_name": "Alice" }])).into_response()
}

/// Answers `slow_hits` requests only after the client's timeout has passed.
async fn slow_rows(State(up): State<Upstream>) -> Json<Value> {
    let hit = up.hits.fetch_add(1, Ordering::SeqCst);
    if hit < up.failures_before_success {
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    Json(json!([{ "parcel_id": "P1", "owner_name": "Alice" }]))
}

async fn paged_rows(State(up): State<Upstream>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    up.hits.fetch_add(1, Ordering::SeqCst);
    let offset: usize = params.get("$offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = params.get("$limit").and_then(|v| v.parse().ok()).unwrap_or(1000);
    *up.last_params.lock().unwrap() = params;
    let rows: Vec<Value> = (0..5)
        .skip(offset)
        .take(limit)
        .map(|i| json!({ "parcel_id": format!("P{i}"), "owner_name": "Owner" }))
        .collect();
    Json(Value::Array(rows))
}

async fn view_metadata() -> Json<Value> {
    Json(json!({
        "id": "abcd-1234",
        "rowsUpdatedAt": 1717200000,
        "columns": [
            { "fieldName": ":id", "dataTypeName": "meta_data" },
            { "fieldName": "parcel_id", "dataTypeName": "text" },
            { "fieldName": "owner_name", "dataTypeName": "text" }
        ]
    }))
}

async fn arcgis_error(State(up): State<Upstream>) -> Json<Value> {
    up.hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "error": { "code": 400, "message": "Invalid or missing input parameters." } }))
}

/// Caps every page at two features, the way servers with a low maxRecordCount do.
async fn arcgis_capped(State(up): State<Upstream>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    up.hits.fetch_add(1, Ordering::SeqCst);
    let offset: usize = params.get("resultOffset").and_then(|v| v.parse().ok()).unwrap_or(0);
    *up.last_params.lock().unwrap() = params;
    let total = 5;
    let features: Vec<Value> = (offset..total.min(offset + 2))
        .map(|i| {
            let x = -91.1 + i as f64 * 0.01;
            json!({
                "attributes": { "OBJECTID": i, "ZONING": "A1" },
                "geometry": { "rings": [[[x, 30.4], [x, 30.41], [x + 0.005, 30.41], [x + 0.005, 30.4], [x, 30.4]]] }
            })
        })
        .collect();
    Json(json!({ "features": features, "exceededTransferLimit": offset + 2 < total }))
}

async fn layer_metadata() -> Json<Value> {
    Json(json!({
        "name": "Zoning",
        "editingInfo": { "lastEditDate": 1717286400000i64 },
        "fields": [
            { "name": "OBJECTID", "type": "esriFieldTypeOID" },
            { "name": "ZONING", "type": "esriFieldTypeString" }
        ]
    }))
}

#[tokio::test]
async fn tabular_recovers_from_two_503s_within_the_attempt_ceiling() {
    let up = Upstream::failing(2);
    let base = serve(
        Router::new()
            .route("/resource/abcd-1234.json", get(flaky_rows))
            .with_state(up.clone()),
    )
    .await;

    let connector = TabularConnector::new(fetcher(3), cache(), 100, None);
    let query = SourceQuery::new("ebr_property_info", format!("{base}/resource/abcd-1234.json"));
    let records = connector.fetch(&query).await.expect("third attempt succeeds");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attributes["parcel_id"], "P1");
    assert_eq!(up.hits(), 3);
}

#[tokio::test]
async fn tabular_gives_up_when_failures_exceed_the_ceiling() {
    let up = Upstream::failing(2);
    let base = serve(
        Router::new()
            .route("/resource/abcd-1234.json", get(flaky_rows))
            .with_state(up.clone()),
    )
    .await;

    let connector = TabularConnector::new(fetcher(2), cache(), 100, None);
    let query = SourceQuery::new("ebr_property_info", format!("{base}/resource/abcd-1234.json"));
    let err = connector.fetch(&query).await.expect_err("ceiling reached");

    assert!(matches!(err, ConnectorError::SourceUnavailable { .. }), "got {err:?}");
    assert_eq!(up.hits(), 2);
}

#[tokio::test]
async fn attempt_timeout_is_retried_within_the_budget() {
    let up = Upstream::failing(1);
    let base = serve(
        Router::new()
            .route("/resource/abcd-1234.json", get(slow_rows))
            .with_state(up.clone()),
    )
    .await;

    let connector = TabularConnector::new(fetcher_with_timeout(3, Duration::from_millis(100)), cache(), 100, None);
    let query = SourceQuery::new("ebr_property_info", format!("{base}/resource/abcd-1234.json"));
    let records = connector.fetch(&query).await.expect("second attempt succeeds");

    assert_eq!(records.len(), 1);
    assert_eq!(up.hits(), 2);
}

#[tokio::test]
async fn attempt_timeouts_exhaust_the_budget() {
    let up = Upstream::failing(usize::MAX);
    let base = serve(
        Router::new()
            .route("/resource/abcd-1234.json", get(slow_rows))
            .with_state(up.clone()),
    )
    .await;

    let connector = TabularConnector::new(fetcher_with_timeout(2, Duration::from_millis(100)), cache(), 100, None);
    let query = SourceQuery::new("ebr_property_info", format!("{base}/resource/abcd-1234.json"));
    let err = connector.fetch(&query).await.expect_err("every attempt times out");

    assert!(matches!(err, ConnectorError::SourceUnavailable { .. }), "got {err:?}");
    assert!(err.to_string().contains("timed out"), "got {err}");
    assert_eq!(up.hits(), 2);
}

#[tokio::test]
async fn tabular_pages_until_a_short_page_and_serves_repeats_from_cache() {
    let up = Upstream::default();
    let base = serve(
        Router::new()
            .route("/resource/abcd-1234.json", get(paged_rows))
            .route("/api/views/abcd-1234.json", get(view_metadata))
            .with_state(up.clone()),
    )
    .await;

    let connector = TabularConnector::new(fetcher(3), cache(), 2, None);
    let mut query = SourceQuery::new("ebr_property_info", format!("{base}/resource/abcd-1234.json"));
    query.select = vec!["parcel_id".into(), "owner_name".into()];

    let records = connector.fetch(&query).await.expect("paged fetch");
    assert_eq!(records.len(), 5);
    assert_eq!(up.hits(), 3);
    assert_eq!(up.last_param("$order").as_deref(), Some(":id"));
    assert_eq!(up.last_param("$select").as_deref(), Some("owner_name,parcel_id"));
    assert_eq!(up.last_param("$offset").as_deref(), Some("4"));

    query.select = vec!["owner_name".into(), "parcel_id".into()];
    let cached = connector.fetch(&query).await.expect("cached fetch");
    assert_eq!(cached.len(), 5);
    assert_eq!(up.hits(), 3);

    let schema = connector.fetch_schema(&query).await.expect("schema");
    let names: Vec<&str> = schema.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["parcel_id", "owner_name"]);

    let updated = connector.fetch_last_updated(&query).await.expect("view metadata");
    assert_eq!(updated, Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
}

#[tokio::test]
async fn arcgis_error_body_is_rejected_without_retry() {
    let up = Upstream::default();
    let base = serve(
        Router::new()
            .route("/MapServer/0/query", get(arcgis_error))
            .with_state(up.clone()),
    )
    .await;

    let connector = GeospatialConnector::new(fetcher(4), cache(), 100);
    let query = SourceQuery::new("ebr_zoning", format!("{base}/MapServer/0"));
    let err = connector.fetch(&query).await.expect_err("error body");

    assert!(matches!(err, ConnectorError::Rejected { .. }), "got {err:?}");
    assert_eq!(up.hits(), 1);
}

#[tokio::test]
async fn arcgis_follows_transfer_limit_and_keeps_ring_geometry() {
    let up = Upstream::default();
    let base = serve(
        Router::new()
            .route("/MapServer/0/query", get(arcgis_capped))
            .route("/MapServer/0", get(layer_metadata))
            .with_state(up.clone()),
    )
    .await;

    let connector = GeospatialConnector::new(fetcher(3), cache(), 3);
    let query = SourceQuery::new("ebr_zoning", format!("{base}/MapServer/0"));
    let records = connector.fetch(&query).await.expect("features");

    assert_eq!(records.len(), 5);
    assert_eq!(up.hits(), 3);
    assert!(records
        .iter()
        .all(|r| matches!(r.geometry, RawGeometry::Rings(ref rings) if rings.len() == 1)));
    assert_eq!(up.last_param("outSR").as_deref(), Some("4326"));
    assert_eq!(up.last_param("where").as_deref(), Some("1=1"));

    let schema = connector.fetch_schema(&query).await.expect("schema");
    assert_eq!(schema.len(), 2);
    assert_eq!(schema[1].field_type, "esriFieldTypeString");

    let updated = connector.fetch_last_updated(&query).await.expect("layer metadata");
    assert_eq!(updated, Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()));
}
