//! Fetch, normalize and upsert, one source at a time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parcel_connectors::ConnectorSet;
use parcel_core::catalog::{
    FreshnessCheck, Health, HealthSummary, ReportedStatus, RunOutcome, SchemaDrift, SchemaFingerprint,
};
use parcel_core::clock::Clock;
use parcel_core::DatasetKind;
use parcel_storage::{RawSnapshotStore, RecordStore, UpsertCounts};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogError, DataCatalog};
use crate::mapping::RecordMapper;
use crate::{SourceConfig, SourceRegistry};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Skip rate above which a run counts as partially failed.
    pub partial_failure_threshold: f64,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            partial_failure_threshold: 0.10,
            reports_dir: PathBuf::from("./reports"),
            scheduler_enabled: false,
            ingest_cron: "0 0 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source_name: String,
    pub dataset: DatasetKind,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub health: Health,
    pub fetched: usize,
    pub skipped: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub upserted: UpsertCounts,
    pub schema_drift: Option<SchemaDrift>,
    pub snapshot: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runs: Vec<RunReport>,
    /// Upsert counts summed over every run.
    pub upserted: UpsertCounts,
    /// Sources whose run could not even be recorded in the catalog.
    pub errors: BTreeMap<String, String>,
}

impl BatchReport {
    pub fn count(&self, outcome: RunOutcome) -> usize {
        self.runs.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn run(&self, source_name: &str) -> Option<&RunReport> {
        self.runs.iter().find(|r| r.source_name == source_name)
    }
}

/// What the body of a run produced, before the catalog sees it.
#[derive(Debug, Default)]
struct RunBody {
    fetched: usize,
    skipped: usize,
    skip_reasons: BTreeMap<String, usize>,
    upserted: UpsertCounts,
    fingerprint: Option<SchemaFingerprint>,
    snapshot: Option<String>,
    error: Option<String>,
    unavailable: bool,
}

impl RunBody {
    fn failed(mut self, error: impl Into<String>) -> Self {
        self.unavailable = true;
        self.error = Some(error.into());
        self
    }
}

pub struct IngestionPipeline {
    registry: Arc<SourceRegistry>,
    connectors: ConnectorSet,
    store: Arc<dyn RecordStore>,
    catalog: Arc<DataCatalog>,
    clock: Arc<dyn Clock>,
    options: PipelineOptions,
    snapshots: Option<RawSnapshotStore>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("connectors", &self.connectors)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<SourceRegistry>,
        connectors: ConnectorSet,
        store: Arc<dyn RecordStore>,
        catalog: Arc<DataCatalog>,
        clock: Arc<dyn Clock>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            registry,
            connectors,
            store,
            catalog,
            clock,
            options,
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: RawSnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &DataCatalog {
        &self.catalog
    }

    /// Every enabled source, in registry order. One source failing never stops the rest.
    pub async fn run_all(&self) -> BatchReport {
        let names: Vec<String> = self.registry.enabled().map(|s| s.name.clone()).collect();
        self.run_batch(names).await
    }

    /// Only sources reported stale or failed.
    pub async fn run_due(&self) -> Result<BatchReport, CatalogError> {
        let due = self.catalog.due_sources().await?;
        let names: Vec<String> = self
            .registry
            .enabled()
            .filter(|s| due.contains(&s.name))
            .map(|s| s.name.clone())
            .collect();
        info!(due = names.len(), "running due sources");
        Ok(self.run_batch(names).await)
    }

    async fn run_batch(&self, names: Vec<String>) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let mut runs = Vec::new();
        let mut upserted = UpsertCounts::default();
        let mut errors = BTreeMap::new();
        for name in names {
            match self.run_source(&name).await {
                Ok(report) => {
                    upserted.merge(report.upserted);
                    runs.push(report);
                }
                Err(err) => {
                    error!(source = %name, error = %err, "ingest run could not be recorded");
                    errors.insert(name, err.to_string());
                }
            }
        }
        let report = BatchReport {
            batch_id,
            started_at,
            finished_at: self.clock.now(),
            runs,
            upserted,
            errors,
        };
        info!(
            batch_id = %report.batch_id,
            rows = report.upserted.total(),
            succeeded = report.count(RunOutcome::Succeeded),
            partially_failed = report.count(RunOutcome::PartiallyFailed),
            failed = report.count(RunOutcome::Failed) + report.errors.len(),
            "ingest batch finished"
        );
        report
    }

    /// One full run of one source. Errors here are catalog errors only; fetch
    /// and store failures end up in the report and the catalog.
    pub async fn run_source(&self, source_name: &str) -> Result<RunReport, CatalogError> {
        let source = self.enabled_source(source_name)?;

        let ticket = self.catalog.record_run_start(source_name).await?;
        let run_id = ticket.run_id;
        let started_at = ticket.started_at;
        let span = info_span!("ingest_run", source = %source_name, run_id = %run_id);

        async move {
            info!(dataset = %source.dataset, connector = %source.connector, "ingest run started");
            let body = self.execute(source).await;
            let outcome = self.outcome(&body);
            let row_count = (!body.unavailable).then(|| body.upserted.total() as u64);
            let entry = self
                .catalog
                .record_run_complete(ticket, outcome, body.fingerprint.clone(), body.error.clone(), row_count)
                .await?;

            let report = RunReport {
                source_name: source.name.clone(),
                dataset: source.dataset,
                run_id,
                started_at,
                finished_at: self.clock.now(),
                outcome,
                health: entry.health,
                fetched: body.fetched,
                skipped: body.skipped,
                skip_reasons: body.skip_reasons,
                upserted: body.upserted,
                schema_drift: entry.last_drift,
                snapshot: body.snapshot,
                error: body.error,
            };
            info!(
                outcome = ?report.outcome,
                fetched = report.fetched,
                skipped = report.skipped,
                inserted = report.upserted.inserted,
                updated = report.upserted.updated,
                unchanged = report.upserted.unchanged,
                "ingest run finished"
            );
            Ok::<_, CatalogError>(report)
        }
        .instrument(span)
        .await
    }

    fn enabled_source(&self, source_name: &str) -> Result<&SourceConfig, CatalogError> {
        self.registry
            .get(source_name)
            .filter(|s| s.enabled)
            .ok_or_else(|| CatalogError::UnknownSource(source_name.to_string()))
    }

    /// Asks upstream when the source last changed and records the answer.
    /// New upstream data drops cached pages so the next run sees it.
    pub async fn check_freshness(&self, source_name: &str) -> Result<FreshnessCheck, CatalogError> {
        let source = self.enabled_source(source_name)?;
        let remote = match self.connectors.get(source.connector) {
            Some(connector) => connector
                .fetch_last_updated(&source.query())
                .await
                .map_err(|err| err.to_string()),
            None => Err(format!("no {} connector configured", source.connector)),
        };
        let check = self.catalog.record_remote_check(source_name, remote).await?;
        if check.needs_refresh {
            self.connectors.invalidate_cache();
        }
        Ok(check)
    }

    pub async fn check_all_freshness(&self) -> Result<Vec<FreshnessCheck>, CatalogError> {
        let mut checks = Vec::new();
        for source in self.registry.enabled() {
            checks.push(self.check_freshness(&source.name).await?);
        }
        Ok(checks)
    }

    /// Only sources whose upstream changed since their last successful run.
    pub async fn run_changed(&self) -> Result<BatchReport, CatalogError> {
        let names: Vec<String> = self
            .check_all_freshness()
            .await?
            .into_iter()
            .filter(|check| check.needs_refresh)
            .map(|check| check.source_name)
            .collect();
        info!(changed = names.len(), "running sources with upstream changes");
        Ok(self.run_batch(names).await)
    }

    fn outcome(&self, body: &RunBody) -> RunOutcome {
        if body.unavailable {
            return RunOutcome::Failed;
        }
        if body.fetched == 0 {
            return RunOutcome::Succeeded;
        }
        let skip_rate = body.skipped as f64 / body.fetched as f64;
        if skip_rate > self.options.partial_failure_threshold {
            RunOutcome::PartiallyFailed
        } else {
            RunOutcome::Succeeded
        }
    }

    async fn execute(&self, source: &SourceConfig) -> RunBody {
        let body = RunBody::default();
        let Some(connector) = self.connectors.get(source.connector) else {
            return body.failed(format!("no {} connector configured", source.connector));
        };
        let query = source.query();

        let raw_records = match connector.fetch(&query).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "fetch failed");
                return body.failed(err.to_string());
            }
        };
        let mut body = RunBody {
            fetched: raw_records.len(),
            ..body
        };

        if let Some(snapshots) = &self.snapshots {
            let rows: Vec<_> = raw_records.iter().map(|r| r.raw.clone()).collect();
            match snapshots.store_rows(&source.name, &rows).await {
                Ok(stored) => {
                    debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "raw snapshot archived");
                    body.snapshot = Some(stored.relative_path.display().to_string());
                }
                Err(err) => warn!(error = %err, "raw snapshot not archived"),
            }
        }

        let mapper = RecordMapper::for_source(source);
        let seen_at = self.clock.now();
        let mut records = Vec::with_capacity(raw_records.len());
        for (index, raw) in raw_records.iter().enumerate() {
            match mapper.map(raw, seen_at) {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!(index, reason = %err, "record skipped");
                    body.skipped += 1;
                    *body.skip_reasons.entry(err.to_string()).or_default() += 1;
                }
            }
        }

        match self.store.upsert_batch(&records).await {
            Ok(counts) => body.upserted = counts,
            Err(err) => {
                error!(error = %err, "upsert failed");
                return body.failed(format!("upsert failed: {err}"));
            }
        }

        match connector.fetch_schema(&query).await {
            Ok(fields) => body.fingerprint = Some(SchemaFingerprint::from_fields(fields)),
            Err(err) => warn!(error = %err, "schema not available; drift check skipped"),
        }

        if body.skipped > 0 {
            body.error = Some(format!("{} of {} records skipped", body.skipped, body.fetched));
        }
        body
    }

    /// Writes `<reports_dir>/<batch_id>/ingest_summary.json` and `health_summary.json`.
    pub async fn write_reports(&self, batch: &BatchReport, health: &HealthSummary) -> Result<PathBuf> {
        let dir = self.options.reports_dir.join(batch.batch_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let ingest = serde_json::to_vec_pretty(batch).context("serializing ingest summary")?;
        fs::write(dir.join("ingest_summary.json"), ingest)
            .await
            .context("writing ingest_summary.json")?;

        let health = serde_json::to_vec_pretty(health).context("serializing health summary")?;
        fs::write(dir.join("health_summary.json"), health)
            .await
            .context("writing health_summary.json")?;

        Ok(dir)
    }

    /// Runs everything, then reports and alerts. The scheduled job body.
    pub async fn run_all_and_report(&self) -> Result<(BatchReport, HealthSummary, PathBuf)> {
        let batch = self.run_all().await;
        let health = self.catalog.get_health_summary().await?;
        alert_unhealthy(&health);
        let dir = self.write_reports(&batch, &health).await?;
        Ok((batch, health, dir))
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.options.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.options.ingest_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                info!("scheduled ingest triggered");
                if let Err(err) = pipeline.run_all_and_report().await {
                    error!(error = %err, "scheduled ingest failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Logs a warning for every source that is not healthy.
pub fn alert_unhealthy(summary: &HealthSummary) {
    for source in summary.sources.iter().filter(|s| s.status != ReportedStatus::Healthy) {
        warn!(
            source = %source.name,
            status = ?source.status,
            staleness_hours = ?source.staleness_hours,
            consecutive_failures = source.consecutive_failures,
            last_error = source.last_error.as_deref().unwrap_or(""),
            "source needs attention"
        );
    }
}
