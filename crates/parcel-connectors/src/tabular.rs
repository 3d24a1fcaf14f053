//! Socrata SODA connector: `$select/$where/$order` with `$limit/$offset` paging.

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

const DEFAULT_ORDER: &str = ":id";
const GEOMETRY_COLUMNS: [&str; 4] = ["the_geom", "geometry", "geocoded_column", "location"];

#[derive(Debug)]
pub struct TabularConnector {
    http: Arc<HttpFetcher>,
    cache: ResponseCache,
    page_size: usize,
    app_token: Option<String>,
}

impl TabularConnector {
    pub fn new(http: Arc<HttpFetcher>, cache: ResponseCache, page_size: usize, app_token: Option<String>) -> Self {
        Self {
            http,
            cache,
            page_size: page_size.max(1),
            app_token,
        }
    }

    fn base_params(&self, query: &SourceQuery) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let select = query.canonical_select();
        if !select.is_empty() {
            params.insert("$select".to_string(), select.join(","));
        }
        if let Some(filter) = query.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            params.insert("$where".to_string(), filter.to_string());
        }
        params.insert(
            "$order".to_string(),
            query.order.clone().unwrap_or_else(|| DEFAULT_ORDER.to_string()),
        );
        params
    }

    fn request(&self, url: &str) -> HttpRequestSpec {
        let spec = HttpRequestSpec::get(url);
        match &self.app_token {
            Some(token) => spec.header("X-App-Token", token),
            None => spec,
        }
    }

    async fn fetch_rows(&self, query: &SourceQuery) -> Result<Arc<Vec<JsonValue>>, ConnectorError> {
        let params = self.base_params(query);
        let mut key_params = params.clone();
        key_params.insert("endpoint".to_string(), query.endpoint.clone());
        key_params.insert("page_size".to_string(), self.page_size.to_string());
        let key = cache_key("tabular", &key_params);

        if let Some(rows) = self.cache.get(&key).await {
            info!(source = %query.source_name, rows = rows.len(), "tabular cache hit");
            return Ok(rows);
        }
        debug!(source = %query.source_name, "tabular cache miss");

        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut spec = self.request(&query.endpoint);
            for (name, value) in &params {
                spec = spec.query(name, value);
            }
            spec = spec
                .query("$limit", self.page_size.to_string())
                .query("$offset", offset.to_string());

            let body = self
                .http
                .fetch_json(&query.source_name, &spec)
                .await
                .map_err(|err| ConnectorError::from_fetch(&query.source_name, err))?;
            let page = match body {
                JsonValue::Array(page) => page,
                JsonValue::Object(obj) if obj.contains_key("error") || obj.contains_key("message") => {
                    return Err(ConnectorError::Rejected {
                        source_name: query.source_name.clone(),
                        detail: JsonValue::Object(obj).to_string(),
                    });
                }
                other => {
                    return Err(payload_error(
                        query,
                        format!("expected a JSON array page, got {}", json_kind(&other)),
                    ))
                }
            };

            let page_len = page.len();
            debug!(source = %query.source_name, offset, page_len, "tabular page fetched");
            rows.extend(page);
            if page_len < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(self.cache.insert(key, rows).await)
    }

    /// The dataset's view metadata: columns and `rowsUpdatedAt`.
    async fn fetch_view(&self, query: &SourceQuery) -> Result<JsonValue, ConnectorError> {
        let url = query
            .schema_endpoint
            .clone()
            .or_else(|| derive_metadata_url(&query.endpoint))
            .ok_or_else(|| payload_error(query, "no metadata endpoint for this dataset"))?;
        self.http
            .fetch_json(&query.source_name, &self.request(&url))
            .await
            .map_err(|err| ConnectorError::from_fetch(&query.source_name, err))
    }
}

/// `.../resource/<id>.json` maps to the dataset's `.../api/views/<id>.json` metadata.
pub fn derive_metadata_url(endpoint: &str) -> Option<String> {
    let (base, tail) = endpoint.split_once("/resource/")?;
    let dataset_id = tail.split(|c: char| matches!(c, '.' | '?' | '/')).next().filter(|id| !id.is_empty())?;
    Some(format!("{base}/api/views/{dataset_id}.json"))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn row_geometry(attributes: &JsonMap<String, JsonValue>) -> RawGeometry {
    for column in GEOMETRY_COLUMNS {
        let Some(value) = attributes.get(column) else {
            continue;
        };
        let Some(obj) = value.as_object() else {
            continue;
        };
        if let Some(raw) = RawGeometry::from_geojson(value) {
            return raw;
        }
        if obj.contains_key("latitude") && obj.contains_key("longitude") {
            return RawGeometry::Attributes(obj.clone());
        }
    }
    RawGeometry::Attributes(attributes.clone())
}

fn to_raw_record(row: &JsonValue) -> Option<RawRecord> {
    let attributes = row.as_object()?.clone();
    Some(RawRecord {
        geometry: row_geometry(&attributes),
        attributes,
        raw: row.clone(),
    })
}

#[async_trait]
impl SourceConnector for TabularConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Tabular
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, ConnectorError> {
        let rows = self.fetch_rows(query).await?;
        rows.iter()
            .map(|row| to_raw_record(row).ok_or_else(|| payload_error(query, "row is not a JSON object")))
            .collect()
    }

    async fn fetch_schema(&self, query: &SourceQuery) -> Result<Vec<SchemaField>, ConnectorError> {
        let metadata = self.fetch_view(query).await?;
        let columns = metadata
            .get("columns")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| payload_error(query, "metadata has no columns array"))?;
        Ok(columns
            .iter()
            .filter_map(|column| {
                let name = column.get("fieldName")?.as_str()?;
                if name.starts_with(':') {
                    return None;
                }
                let field_type = column
                    .get("dataTypeName")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown");
                Some(SchemaField::new(name, field_type))
            })
            .collect())
    }

    /// `rowsUpdatedAt` is epoch seconds.
    async fn fetch_last_updated(&self, query: &SourceQuery) -> Result<Option<DateTime<Utc>>, ConnectorError> {
        let metadata = self.fetch_view(query).await?;
        Ok(metadata.get("rowsUpdatedAt").and_then(parse_remote_timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_url_derives_from_resource_endpoint() {
        assert_eq!(
            derive_metadata_url("https://data.brla.gov/resource/re5c-hrw9.json").as_deref(),
            Some("https://data.brla.gov/api/views/re5c-hrw9.json")
        );
        assert_eq!(derive_metadata_url("https://data.brla.gov/other"), None);
    }

    #[test]
    fn rows_pick_geojson_or_location_columns() {
        let with_geom = json!({
            "parcel_id": "1",
            "the_geom": { "type": "Point", "coordinates": [-91.1, 30.4] }
        });
        let record = to_raw_record(&with_geom).unwrap();
        assert_eq!(record.geometry, RawGeometry::Point { x: -91.1, y: 30.4 });

        let with_location = json!({
            "parcel_id": "2",
            "location": { "latitude": "30.4", "longitude": "-91.1" }
        });
        let record = to_raw_record(&with_location).unwrap();
        assert!(matches!(record.geometry, RawGeometry::Attributes(ref obj) if obj.contains_key("latitude")));

        let bare = json!({ "parcel_id": "3", "LATITUDE": 30.4, "LONGITUDE": -91.1 });
        let record = to_raw_record(&bare).unwrap();
        assert!(matches!(record.geometry, RawGeometry::Attributes(ref obj) if obj.contains_key("parcel_id")));
    }
}
