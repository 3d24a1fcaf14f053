//! ArcGIS REST layer connector: `/query` with `resultOffset/resultRecordCount` paging.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_core::catalog::SchemaField;
use parcel_core::clock::parse_remote_timestamp;
use parcel_core::{ConnectorKind, RawGeometry};
use parcel_storage::cache::cache_key;
use parcel_storage::{HttpFetcher, HttpRequestSpec, ResponseCache};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info};

use crate::{payload_error, ConnectorError, RawRecord, SourceConnector, SourceQuery};

const OUTPUT_SRID: &str = "4326";

#[derive(Debug)]
pub struct GeospatialConnector {
    http: Arc<HttpFetcher>,
    cache: ResponseCache,
    page_size: usize,
}

impl GeospatialConnector {
    pub fn new(http: Arc<HttpFetcher>, cache: ResponseCache, page_size: usize) -> Self {
        Self {
            http,
            cache,
            page_size: page_size.max(1),
        }
    }

    fn base_params(&self, query: &SourceQuery) -> BTreeMap<String, String> {
        let select = query.canonical_select();
        let mut params = BTreeMap::new();
        params.insert(
            "where".to_string(),
            query
                .filter
                .clone()
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| "1=1".to_string()),
        );
        params.insert(
            "outFields".to_string(),
            if select.is_empty() { "*".to_string() } else { select.join(",") },
        );
        if let Some(order) = &query.order {
            params.insert("orderByFields".to_string(), order.clone());
        }
        params.insert("returnGeometry".to_string(), "true".to_string());
        params.insert("outSR".to_string(), OUTPUT_SRID.to_string());
        params.insert("f".to_string(), "json".to_string());
        params
    }

    async fn fetch_features(&self, query: &SourceQuery) -> Result<Arc<Vec<JsonValue>>, ConnectorError> {
        let params = self.base_params(query);
        let mut key_params = params.clone();
        key_params.insert("endpoint".to_string(), query.endpoint.clone());
        key_params.insert("page_size".to_string(), self.page_size.to_string());
        let key = cache_key("geospatial", &key_params);

        if let Some(features) = self.cache.get(&key).await {
            info!(source = %query.source_name, features = features.len(), "geospatial cache hit");
            return Ok(features);
        }
        debug!(source = %query.source_name, "geospatial cache miss");

        let url = format!("{}/query", query.endpoint.trim_end_matches('/'));
        let mut features = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut spec = HttpRequestSpec::get(&url);
            for (name, value) in &params {
                spec = spec.query(name, value);
            }
            spec = spec
                .query("resultOffset", offset.to_string())
                .query("resultRecordCount", self.page_size.to_string());

            let body = self
                .http
                .fetch_json(&query.source_name, &spec)
                .await
                .map_err(|err| ConnectorError::from_fetch(&query.source_name, err))?;
            reject_error_body(query, &body)?;

            let page = body
                .get("features")
                .and_then(JsonValue::as_array)
                .cloned()
                .ok_or_else(|| payload_error(query, "query response has no features array"))?;
            let exceeded = body
                .get("exceededTransferLimit")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);

            let page_len = page.len();
            debug!(source = %query.source_name, offset, page_len, exceeded, "geospatial page fetched");
            features.extend(page);
            if page_len == 0 || (page_len < self.page_size && !exceeded) {
                break;
            }
            // Servers cap page size below the request; advance by what actually came back.
            offset += page_len;
        }

        Ok(self.cache.insert(key, features).await)
    }

    /// Layer metadata: `fields` and `editingInfo`.
    async fn fetch_layer(&self, query: &SourceQuery) -> Result<JsonValue, ConnectorError> {
        let url = query
            .schema_endpoint
            .clone()
            .unwrap_or_else(|| query.endpoint.trim_end_matches('/').to_string());
        let spec = HttpRequestSpec::get(url).query("f", "json");
        let metadata = self
            .http
            .fetch_json(&query.source_name, &spec)
            .await
            .map_err(|err| ConnectorError::from_fetch(&query.source_name, err))?;
        reject_error_body(query, &metadata)?;
        Ok(metadata)
    }
}

/// ArcGIS reports failures as a 200 response carrying an `error` object.
fn reject_error_body(query: &SourceQuery, body: &JsonValue) -> Result<(), ConnectorError> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };
    let code = error.get("code").and_then(JsonValue::as_i64);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown error");
    Err(ConnectorError::Rejected {
        source_name: query.source_name.clone(),
        detail: match code {
            Some(code) => format!("arcgis error {code}: {message}"),
            None => format!("arcgis error: {message}"),
        },
    })
}

fn to_raw_record(feature: &JsonValue) -> Option<RawRecord> {
    let feature_obj = feature.as_object()?;
    let attributes: JsonMap<String, JsonValue> = feature_obj
        .get("attributes")
        .and_then(JsonValue::as_object)
        .cloned()
        .unwrap_or_default();
    let geometry = RawGeometry::resolve(feature_obj.get("geometry"), &attributes);
    Some(RawRecord {
        attributes,
        geometry,
        raw: feature.clone(),
    })
}

#[async_trait]
impl SourceConnector for GeospatialConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Geospatial
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, ConnectorError> {
        let features = self.fetch_features(query).await?;
        features
            .iter()
            .map(|feature| to_raw_record(feature).ok_or_else(|| payload_error(query, "feature is not a JSON object")))
            .collect()
    }

    async fn fetch_schema(&self, query: &SourceQuery) -> Result<Vec<SchemaField>, ConnectorError> {
        let metadata = self.fetch_layer(query).await?;
        let fields = metadata
            .get("fields")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| payload_error(query, "layer metadata has no fields array"))?;
        Ok(fields
            .iter()
            .filter_map(|field| {
                let name = field.get("name")?.as_str()?;
                let field_type = field
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown");
                Some(SchemaField::new(name, field_type))
            })
            .collect())
    }

    async fn fetch_last_updated(&self, query: &SourceQuery) -> Result<Option<DateTime<Utc>>, ConnectorError> {
        let metadata = self.fetch_layer(query).await?;
        Ok(last_edit_date(&metadata))
    }
}

/// `editingInfo.lastEditDate` (epoch milliseconds); some servers only fill `dataLastEditDate`.
fn last_edit_date(metadata: &JsonValue) -> Option<DateTime<Utc>> {
    let editing = metadata.get("editingInfo")?;
    ["lastEditDate", "dataLastEditDate"]
        .iter()
        .find_map(|key| editing.get(*key).and_then(parse_remote_timestamp))
}
