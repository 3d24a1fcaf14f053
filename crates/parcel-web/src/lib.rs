//! Axum JSON API: parcel lookups and overlay, catalog health, ingestion trigger.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parcel_storage::{ParcelSearch, RecordStore, MAX_LIST_LIMIT};
use parcel_sync::{CatalogError, OverlayError, ParcelServices};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "parcel-web";

#[derive(Clone)]
pub struct AppState {
    pub services: ParcelServices,
}

impl AppState {
    pub fn new(services: ParcelServices) -> Self {
        Self { services }
    }
}

#[derive(Debug, Deserialize, Default)]
struct IngestQuery {
    #[serde(default)]
    due: bool,
}

fn default_list_limit() -> usize {
    100
}

fn default_threshold() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct HighRequestQuery {
    #[serde(default = "default_threshold")]
    threshold: u64,
    /// Falls back to the overlay radius.
    radius_meters: Option<f64>,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/parcels/search", get(parcel_search_handler))
        .route("/parcels/adjudicated/list", get(adjudicated_list_handler))
        .route("/parcels/high-311/list", get(high_request_list_handler))
        .route("/parcels/{id}", get(parcel_handler))
        .route("/parcels/{id}/overlay", get(overlay_handler))
        .route("/zones/{code}/parcels", get(zone_parcels_handler))
        .route("/catalog/health", get(catalog_health_handler))
        .route("/catalog/sources", get(catalog_sources_handler))
        .route("/catalog/sources/{name}", get(catalog_source_handler))
        .route("/catalog/sources/{name}/check-freshness", post(check_freshness_handler))
        .route("/ingest/run", post(ingest_all_handler))
        .route("/ingest/{source}/run", post(ingest_source_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: ParcelServices) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "parcel api listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn parcel_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match state.services.store.get_parcel(&id).await {
        Ok(Some(parcel)) => Json(parcel).into_response(),
        Ok(None) => not_found(format!("parcel {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn parcel_search_handler(State(state): State<Arc<AppState>>, Query(search): Query<ParcelSearch>) -> Response {
    if let Err(resp) = check_limit(search.limit) {
        return resp;
    }
    match state.services.store.search_parcels(&search).await {
        Ok(parcels) => Json(parcels).into_response(),
        Err(err) => server_error(err),
    }
}

async fn adjudicated_list_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    if let Err(resp) = check_limit(query.limit) {
        return resp;
    }
    match state.services.store.list_adjudicated(query.limit).await {
        Ok(parcels) => Json(json!({ "count": parcels.len(), "parcels": parcels })).into_response(),
        Err(err) => server_error(err),
    }
}

/// Parcels with many nearby service requests, a blight indicator.
async fn high_request_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HighRequestQuery>,
) -> Response {
    if let Err(resp) = check_limit(query.limit) {
        return resp;
    }
    if query.threshold < 1 {
        return bad_request("threshold must be at least 1".to_string());
    }
    let radius_m = query.radius_meters.unwrap_or_else(|| state.services.overlay.radius_m());
    if !(100.0..=2000.0).contains(&radius_m) {
        return bad_request(format!("radius_meters must be between 100 and 2000, got {radius_m}"));
    }
    match state
        .services
        .store
        .high_request_parcels(query.threshold, radius_m, query.limit)
        .await
    {
        Ok(parcels) => Json(json!({
            "count": parcels.len(),
            "threshold": query.threshold,
            "radius_m": radius_m,
            "parcels": parcels,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn zone_parcels_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(resp) = check_limit(query.limit) {
        return resp;
    }
    match state.services.store.parcels_in_zone(&code, query.limit).await {
        Ok(parcels) => Json(json!({ "zone_code": code, "count": parcels.len(), "parcels": parcels })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn overlay_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match state.services.overlay.get_overlay(&id).await {
        Ok(overlay) => Json(overlay).into_response(),
        Err(err @ OverlayError::ParcelNotFound(_)) => not_found(err.to_string()),
        Err(err) => server_error(err),
    }
}

async fn catalog_health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.catalog.get_health_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn catalog_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.catalog.entries().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

async fn catalog_source_handler(State(state): State<Arc<AppState>>, AxumPath(name): AxumPath<String>) -> Response {
    match state.services.catalog.get_entry(&name).await {
        Ok(entry) => {
            let now = state.services.catalog.now();
            Json(json!({ "entry": entry, "health": entry.health_view(now) })).into_response()
        }
        Err(err @ CatalogError::UnknownSource(_)) => not_found(err.to_string()),
        Err(err) => server_error(err),
    }
}

async fn check_freshness_handler(State(state): State<Arc<AppState>>, AxumPath(name): AxumPath<String>) -> Response {
    match state.services.pipeline.check_freshness(&name).await {
        Ok(check) => Json(check).into_response(),
        Err(err @ CatalogError::UnknownSource(_)) => not_found(err.to_string()),
        Err(err) => server_error(err),
    }
}

/// Fire-and-observe: the batch runs in the background, results show up in the catalog.
async fn ingest_all_handler(State(state): State<Arc<AppState>>, Query(query): Query<IngestQuery>) -> Response {
    let pipeline = state.services.pipeline.clone();
    let sources: Vec<String> = pipeline.registry().enabled().map(|s| s.name.clone()).collect();
    let due = query.due;
    tokio::spawn(async move {
        if due {
            if let Err(err) = pipeline.run_due().await {
                error!(error = %err, "due ingest failed");
            }
        } else if let Err(err) = pipeline.run_all_and_report().await {
            error!(error = %err, "ingest batch failed");
        }
    });
    accepted(json!({ "accepted": true, "due_only": due, "sources": sources }))
}

async fn ingest_source_handler(State(state): State<Arc<AppState>>, AxumPath(source): AxumPath<String>) -> Response {
    let pipeline = state.services.pipeline.clone();
    if !pipeline.registry().get(&source).is_some_and(|s| s.enabled) {
        return not_found(format!("unknown source: {source}"));
    }
    let name = source.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.run_source(&name).await {
            error!(source = %name, error = %err, "ingest run failed");
        }
    });
    accepted(json!({ "accepted": true, "sources": [source] }))
}

fn accepted(body: serde_json::Value) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn check_limit(limit: usize) -> Result<(), Response> {
    if (1..=MAX_LIST_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(bad_request(format!("limit must be between 1 and {MAX_LIST_LIMIT}, got {limit}")))
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
