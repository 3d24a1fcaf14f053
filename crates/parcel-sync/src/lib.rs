//! Source registry, data catalog, ingestion pipeline and parcel overlay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parcel_connectors::{ConnectorOptions, ConnectorSet, SourceQuery};
use parcel_core::catalog::CatalogEntry;
use parcel_core::clock::{Clock, SystemClock};
use parcel_core::{ConnectorKind, DatasetKind, RequestStatus, WindingConvention, DEFAULT_SERVICE_REQUEST_RADIUS_M};
use parcel_storage::{
    BackoffPolicy, CatalogRepository, HttpClientConfig, HttpFetcher, MemoryStore, PgStore, RawSnapshotStore,
    RecordStore, ResponseCache, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

pub mod catalog;
pub mod ingest;
pub mod mapping;
pub mod overlay;

pub use catalog::{CatalogError, DataCatalog, RunTicket};
pub use ingest::{BatchReport, IngestionPipeline, PipelineOptions, RunReport};
pub use mapping::{MappingError, RecordMapper};
pub use overlay::{OverlayError, OverlayService};

pub const CRATE_NAME: &str = "parcel-sync";

const CACHE_MAX_ENTRIES: u64 = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub connector: ConnectorKind,
    pub dataset: DatasetKind,
    pub endpoint: String,
    #[serde(default)]
    pub schema_endpoint: Option<String>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default = "default_refresh_hours")]
    pub expected_refresh_hours: f64,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub ring_winding: WindingConvention,
    #[serde(default)]
    pub status_default: Option<RequestStatus>,
}

fn default_enabled() -> bool {
    true
}

fn default_refresh_hours() -> f64 {
    24.0
}

impl SourceConfig {
    pub fn query(&self) -> SourceQuery {
        SourceQuery {
            source_name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            schema_endpoint: self.schema_endpoint.clone(),
            select: self.select.clone(),
            filter: self.filter.clone(),
            order: self.order.clone(),
        }
    }

    pub fn refresh_interval_secs(&self) -> i64 {
        (self.expected_refresh_hours.max(0.0) * 3600.0).round() as i64
    }

    /// Initial catalog row for a source that has never been seen.
    pub fn catalog_entry(&self) -> CatalogEntry {
        CatalogEntry::new(
            &self.name,
            &self.display_name,
            self.connector,
            self.dataset,
            self.refresh_interval_secs(),
        )
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                anyhow::bail!("source {} is declared twice", source.name);
            }
            if source.status_default.is_some() && source.dataset != DatasetKind::ServiceRequests {
                anyhow::bail!("source {}: status_default only applies to service_requests", source.name);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub reports_dir: PathBuf,
    pub snapshots_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_attempts: usize,
    pub http_base_delay_ms: u64,
    pub http_max_delay_ms: u64,
    /// Request budget for each source on its own, not shared across sources.
    pub http_requests_per_minute: Option<u32>,
    pub cache_ttl_secs: u64,
    pub app_token: Option<String>,
    pub tabular_page_size: usize,
    pub geospatial_page_size: usize,
    pub overlay_radius_m: f64,
    pub partial_failure_threshold: f64,
    pub web_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_file: PathBuf::from("sources.yaml"),
            reports_dir: PathBuf::from("./reports"),
            snapshots_dir: None,
            scheduler_enabled: false,
            ingest_cron: "0 0 3 * * *".to_string(),
            user_agent: format!("parcel-overlay/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            http_max_attempts: 5,
            http_base_delay_ms: 500,
            http_max_delay_ms: 30_000,
            http_requests_per_minute: None,
            cache_ttl_secs: 600,
            app_token: None,
            tabular_page_size: 1000,
            geospatial_page_size: 1000,
            overlay_radius_m: DEFAULT_SERVICE_REQUEST_RADIUS_M,
            partial_failure_threshold: 0.10,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            sources_file: env_nonempty("PARCEL_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            reports_dir: env_nonempty("PARCEL_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            snapshots_dir: env_nonempty("PARCEL_SNAPSHOTS_DIR").map(PathBuf::from),
            scheduler_enabled: std::env::var("PARCEL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: env_nonempty("PARCEL_INGEST_CRON").unwrap_or(defaults.ingest_cron),
            user_agent: env_nonempty("PARCEL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PARCEL_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            http_max_attempts: env_parse("PARCEL_HTTP_MAX_ATTEMPTS").unwrap_or(defaults.http_max_attempts),
            http_base_delay_ms: env_parse("PARCEL_HTTP_BASE_DELAY_MS").unwrap_or(defaults.http_base_delay_ms),
            http_max_delay_ms: env_parse("PARCEL_HTTP_MAX_DELAY_MS").unwrap_or(defaults.http_max_delay_ms),
            http_requests_per_minute: env_parse("PARCEL_HTTP_REQUESTS_PER_MINUTE"),
            cache_ttl_secs: env_parse("PARCEL_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl_secs),
            app_token: env_nonempty("SOCRATA_APP_TOKEN"),
            tabular_page_size: env_parse("PARCEL_TABULAR_PAGE_SIZE").unwrap_or(defaults.tabular_page_size),
            geospatial_page_size: env_parse("PARCEL_GEOSPATIAL_PAGE_SIZE").unwrap_or(defaults.geospatial_page_size),
            overlay_radius_m: env_parse("PARCEL_OVERLAY_RADIUS_M").unwrap_or(defaults.overlay_radius_m),
            partial_failure_threshold: env_parse("PARCEL_PARTIAL_FAILURE_THRESHOLD")
                .unwrap_or(defaults.partial_failure_threshold),
            web_port: env_parse("PARCEL_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            attempt_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.http_max_attempts.max(1),
                base_delay: Duration::from_millis(self.http_base_delay_ms),
                max_delay: Duration::from_millis(self.http_max_delay_ms),
            },
            token_bucket: self.http_requests_per_minute.map(TokenBucketConfig::per_minute),
            ..HttpClientConfig::default()
        }
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            tabular_page_size: self.tabular_page_size,
            geospatial_page_size: self.geospatial_page_size,
            app_token: self.app_token.clone(),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            partial_failure_threshold: self.partial_failure_threshold,
            reports_dir: self.reports_dir.clone(),
            scheduler_enabled: self.scheduler_enabled,
            ingest_cron: self.ingest_cron.clone(),
        }
    }
}

/// Everything the CLI and the web layer share, wired from one config.
#[derive(Clone)]
pub struct ParcelServices {
    pub config: SyncConfig,
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn RecordStore>,
    pub catalog: Arc<DataCatalog>,
    pub pipeline: Arc<IngestionPipeline>,
    pub overlay: Arc<OverlayService>,
    pub postgres: Option<PgStore>,
}

impl ParcelServices {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let (store, repo, postgres) = match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url).await.context("connecting to postgres")?;
                let store: Arc<dyn RecordStore> = Arc::new(pg.clone());
                let repo: Arc<dyn CatalogRepository> = Arc::new(pg.clone());
                (store, repo, Some(pg))
            }
            None => {
                warn!("DATABASE_URL is not set; using the in-memory store, nothing will persist");
                let memory = Arc::new(MemoryStore::new());
                let store: Arc<dyn RecordStore> = memory.clone();
                let repo: Arc<dyn CatalogRepository> = memory;
                (store, repo, None)
            }
        };

        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl_secs), CACHE_MAX_ENTRIES);
        let connectors = ConnectorSet::standard(http, cache, &config.connector_options());

        Self::assemble(config, registry, store, repo, connectors, Arc::new(SystemClock), postgres).await
    }

    /// Wires the services from explicit parts and seeds the catalog.
    pub async fn assemble(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn RecordStore>,
        repo: Arc<dyn CatalogRepository>,
        connectors: ConnectorSet,
        clock: Arc<dyn Clock>,
        postgres: Option<PgStore>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let catalog = Arc::new(DataCatalog::new(repo, clock.clone()));
        let seeded = catalog
            .seed(registry.enabled().map(SourceConfig::catalog_entry))
            .await
            .context("seeding data catalog")?;
        info!(seeded, sources = registry.sources.len(), "data catalog ready");

        let mut pipeline = IngestionPipeline::new(
            registry.clone(),
            connectors,
            store.clone(),
            catalog.clone(),
            clock,
            config.pipeline_options(),
        );
        if let Some(dir) = &config.snapshots_dir {
            pipeline = pipeline.with_snapshots(RawSnapshotStore::new(dir.clone()));
        }
        let overlay = Arc::new(OverlayService::new(store.clone(), config.overlay_radius_m));

        Ok(Self {
            config,
            registry,
            store,
            catalog,
            pipeline: Arc::new(pipeline),
            overlay,
            postgres,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - name: ebr_property_info
    display_name: Property Information
    connector: tabular
    dataset: parcels
    endpoint: https://data.brla.gov/resource/re5c-hrw9.json
    select: [parcel_id, owner_name, site_address, latitude, longitude]
    id_field: parcel_id
  - name: ebr_311_closed
    display_name: 311 Requests (closed)
    enabled: false
    connector: geospatial
    dataset: service_requests
    endpoint: https://services.arcgis.com/x/FeatureServer/1
    expected_refresh_hours: 168
    ring_winding: clockwise_exterior
    status_default: closed
"#;

    #[test]
    fn registry_parses_defaults_and_flags() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);

        let parcels = registry.get("ebr_property_info").unwrap();
        assert_eq!(parcels.refresh_interval_secs(), 86_400);
        assert_eq!(parcels.ring_winding, WindingConvention::CounterClockwiseExterior);
        assert_eq!(parcels.query().select.len(), 5);

        let closed = registry.get("ebr_311_closed").unwrap();
        assert_eq!(closed.status_default, Some(RequestStatus::Closed));
        assert_eq!(closed.ring_winding, WindingConvention::ClockwiseExterior);
        assert_eq!(closed.catalog_entry().refresh_interval_secs, 168 * 3600);
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let doubled = format!(
            "{}\n{}",
            REGISTRY.trim_end(),
            r#"  - name: ebr_property_info
    display_name: again
    connector: tabular
    dataset: parcels
    endpoint: https://example.test"#
        );
        assert!(SourceRegistry::from_yaml_str(&doubled).is_err());
    }

    #[test]
    fn status_default_requires_service_requests() {
        let text = r#"
sources:
  - name: zoning
    display_name: Zoning
    connector: geospatial
    dataset: zoning
    endpoint: https://example.test/MapServer/0
    status_default: open
"#;
        assert!(SourceRegistry::from_yaml_str(text).is_err());
    }

    #[tokio::test]
    async fn checked_in_registry_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).await.unwrap();
        assert_eq!(registry.enabled().count(), 6);
        let closed = registry.get("ebr_311_closed").unwrap();
        assert_eq!(closed.status_default, Some(RequestStatus::Closed));
        // Both 311 layers feed one table; OBJECTIDs would collide across them.
        for name in ["ebr_311_open", "ebr_311_closed"] {
            assert_eq!(registry.get(name).unwrap().id_field.as_deref(), Some("REQUEST_ID"));
        }
        assert_eq!(
            registry.get("ebr_zoning").unwrap().ring_winding,
            WindingConvention::ClockwiseExterior
        );
        assert_eq!(registry.get("ebr_property_info").unwrap().connector, ConnectorKind::Tabular);
    }

    #[test]
    fn config_maps_to_http_and_connector_settings() {
        let config = SyncConfig {
            http_max_attempts: 3,
            http_base_delay_ms: 10,
            http_requests_per_minute: Some(60),
            tabular_page_size: 50,
            ..SyncConfig::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.backoff.max_attempts, 3);
        assert_eq!(http.backoff.base_delay, Duration::from_millis(10));
        assert_eq!(http.token_bucket.map(|b| b.capacity), Some(60));
        assert_eq!(config.connector_options().tabular_page_size, 50);
        assert_eq!(config.ingest_cron, "0 0 3 * * *");
    }
}
