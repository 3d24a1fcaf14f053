//! Upstream source connectors: a tabular open-data API and a geospatial REST API.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_core::catalog::SchemaField;
use parcel_core::{ConnectorKind, RawGeometry};
use parcel_storage::{FetchError, HttpFetcher, ResponseCache};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub mod geospatial;
pub mod tabular;

pub use geospatial::GeospatialConnector;
pub use tabular::TabularConnector;

pub const CRATE_NAME: &str = "parcel-connectors";

/// What to pull from one upstream dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub source_name: String,
    pub endpoint: String,
    pub schema_endpoint: Option<String>,
    pub select: Vec<String>,
    pub filter: Option<String>,
    pub order: Option<String>,
}

impl SourceQuery {
    pub fn new(source_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Selected fields, sorted and deduplicated, so field order never changes a query's identity.
    pub fn canonical_select(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .select
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// One upstream row or feature, before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub attributes: JsonMap<String, JsonValue>,
    pub geometry: RawGeometry,
    pub raw: JsonValue,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("source {source_name} rejected the request: {detail}")]
    Rejected { source_name: String, detail: String },
    #[error("source {source_name} returned an unexpected payload: {detail}")]
    Payload { source_name: String, detail: String },
}

impl ConnectorError {
    pub fn from_fetch(source_name: &str, err: FetchError) -> Self {
        let source_name = source_name.to_string();
        match err {
            FetchError::Exhausted { .. } | FetchError::Request(_) | FetchError::Shutdown => {
                ConnectorError::SourceUnavailable {
                    source_name,
                    reason: err.to_string(),
                }
            }
            FetchError::HttpStatus { .. } => ConnectorError::Rejected {
                source_name,
                detail: err.to_string(),
            },
            FetchError::Decode { .. } => ConnectorError::Payload {
                source_name,
                detail: err.to_string(),
            },
        }
    }

    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, ConnectorError::SourceUnavailable { .. })
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn kind(&self) -> ConnectorKind;

    /// Every record matching the query, following pagination to the end.
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawRecord>, ConnectorError>;

    /// Field names and types as the upstream reports them.
    async fn fetch_schema(&self, query: &SourceQuery) -> Result<Vec<SchemaField>, ConnectorError>;

    /// When upstream last modified the dataset; `None` when it does not say.
    async fn fetch_last_updated(&self, query: &SourceQuery) -> Result<Option<DateTime<Utc>>, ConnectorError>;
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub tabular_page_size: usize,
    pub geospatial_page_size: usize,
    pub app_token: Option<String>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            tabular_page_size: 1000,
            geospatial_page_size: 1000,
            app_token: None,
        }
    }
}

/// Connectors by kind, sharing one fetcher and one cache.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: BTreeMap<ConnectorKind, Arc<dyn SourceConnector>>,
    cache: Option<ResponseCache>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(http: Arc<HttpFetcher>, cache: ResponseCache, options: &ConnectorOptions) -> Self {
        let set = Self {
            cache: Some(cache.clone()),
            ..Self::default()
        };
        set.with(Arc::new(TabularConnector::new(
            http.clone(),
            cache.clone(),
            options.tabular_page_size,
            options.app_token.clone(),
        )))
        .with(Arc::new(GeospatialConnector::new(http, cache, options.geospatial_page_size)))
    }

    pub fn with(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn get(&self, kind: ConnectorKind) -> Option<Arc<dyn SourceConnector>> {
        self.connectors.get(&kind).cloned()
    }

    /// Drops every cached query result.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

impl std::fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.connectors.keys()).finish()
    }
}

fn payload_error(query: &SourceQuery, detail: impl Into<String>) -> ConnectorError {
    ConnectorError::Payload {
        source_name: query.source_name.clone(),
        detail: detail.into(),
    }
}
