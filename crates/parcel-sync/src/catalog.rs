//! Per-source freshness and health bookkeeping.
//!
//! Run bookkeeping goes through [`DataCatalog::record_run_start`] and
//! [`DataCatalog::record_run_complete`]. The [`RunTicket`] returned by the
//! first holds the source's run lock until it is handed back to the second,
//! so two runs of one source never interleave. Upstream freshness checks
//! only touch the remote timestamps, under the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use parcel_core::catalog::{
    CatalogEntry, FreshnessCheck, Health, HealthSummary, RunOutcome, RunState, SchemaFingerprint,
};
use parcel_core::clock::Clock;
use parcel_storage::{monotonic_success, CatalogRepository, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof that a run of one source is in progress.
#[derive(Debug)]
pub struct RunTicket {
    pub source_name: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    _guard: OwnedMutexGuard<()>,
}

pub struct DataCatalog {
    repo: Arc<dyn CatalogRepository>,
    clock: Arc<dyn Clock>,
    run_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for DataCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCatalog").finish_non_exhaustive()
    }
}

impl DataCatalog {
    pub fn new(repo: Arc<dyn CatalogRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates entries for sources that have none. Returns how many were created.
    pub async fn seed(&self, entries: impl IntoIterator<Item = CatalogEntry>) -> Result<usize, CatalogError> {
        let mut created = 0;
        for entry in entries {
            if self.repo.insert_if_absent(&entry).await? {
                info!(source = %entry.source_name, "seeded catalog entry");
                created += 1;
            }
        }
        Ok(created)
    }

    pub async fn get_entry(&self, source_name: &str) -> Result<CatalogEntry, CatalogError> {
        self.repo
            .load(source_name)
            .await?
            .ok_or_else(|| CatalogError::UnknownSource(source_name.to_string()))
    }

    pub async fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.repo.load_all().await?)
    }

    /// Staleness is evaluated here, on every read; it is never stored.
    pub async fn get_health_summary(&self) -> Result<HealthSummary, CatalogError> {
        let entries = self.entries().await?;
        Ok(HealthSummary::from_entries(&entries, self.clock.now()))
    }

    /// Sources whose reported status is stale or failed.
    pub async fn due_sources(&self) -> Result<Vec<String>, CatalogError> {
        let now = self.clock.now();
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| entry.source_name)
            .collect())
    }

    fn run_lock(&self, source_name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(source_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Marks an attempt. Waits while another run of the same source is in flight.
    /// Health is left alone.
    pub async fn record_run_start(&self, source_name: &str) -> Result<RunTicket, CatalogError> {
        let guard = self.run_lock(source_name).lock_owned().await;
        let mut entry = self.get_entry(source_name).await?;

        let started_at = self.clock.now();
        let run_id = Uuid::new_v4();
        entry.last_attempt_at = Some(started_at);
        entry.run_state = RunState::Running;
        entry.last_run_id = Some(run_id);
        self.repo.save(&entry).await?;

        Ok(RunTicket {
            source_name: source_name.to_string(),
            run_id,
            started_at,
            _guard: guard,
        })
    }

    /// Applies a run outcome and releases the run lock.
    ///
    /// `fingerprint` is the schema observed during the run, when the source
    /// could report one. `row_count` is what the run delivered; a failed run
    /// keeps the previous count.
    pub async fn record_run_complete(
        &self,
        ticket: RunTicket,
        outcome: RunOutcome,
        fingerprint: Option<SchemaFingerprint>,
        error: Option<String>,
        row_count: Option<u64>,
    ) -> Result<CatalogEntry, CatalogError> {
        let mut entry = self.get_entry(&ticket.source_name).await?;
        let now = self.clock.now();
        entry.run_state = outcome.into();

        match outcome {
            RunOutcome::Failed => {
                entry.health = Health::Failed;
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = error;
                warn!(
                    source = %entry.source_name,
                    failures = entry.consecutive_failures,
                    error = entry.last_error.as_deref().unwrap_or("unknown"),
                    "ingest run failed"
                );
            }
            RunOutcome::Succeeded | RunOutcome::PartiallyFailed => {
                entry.last_success_at = Some(monotonic_success(entry.last_success_at, now));
                entry.consecutive_failures = 0;
                entry.last_error = error;
                if row_count.is_some() {
                    entry.row_count = row_count;
                }

                let drift = match (&entry.schema_fingerprint, &fingerprint) {
                    (Some(stored), Some(observed)) => stored.diff(observed),
                    _ => None,
                };
                if let Some(drift) = &drift {
                    warn!(
                        source = %entry.source_name,
                        added = ?drift.added_columns,
                        removed = ?drift.removed_columns,
                        changed = ?drift.changed_types,
                        "schema drift detected: {}",
                        drift.summary()
                    );
                }
                if fingerprint.is_some() {
                    entry.schema_fingerprint = fingerprint;
                }

                entry.health = if drift.is_some() || outcome == RunOutcome::PartiallyFailed {
                    Health::Degraded
                } else {
                    Health::Healthy
                };
                entry.last_drift = drift;
            }
        }

        self.repo.save(&entry).await?;
        info!(
            source = %entry.source_name,
            run_id = %ticket.run_id,
            outcome = ?outcome,
            health = ?entry.health,
            "catalog updated"
        );
        Ok(entry)
    }

    /// Records what upstream reported about its last modification. A failed
    /// lookup is reported back but leaves health alone; health belongs to runs.
    pub async fn record_remote_check(
        &self,
        source_name: &str,
        remote: Result<Option<DateTime<Utc>>, String>,
    ) -> Result<FreshnessCheck, CatalogError> {
        let _guard = self.run_lock(source_name).lock_owned().await;
        let mut entry = self.get_entry(source_name).await?;
        let now = self.clock.now();
        let previous = entry.remote_updated_at;

        let check = match remote {
            Ok(remote_updated_at) => {
                let needs_refresh = entry.needs_refresh(remote_updated_at, now);
                entry.remote_checked_at = Some(now);
                if remote_updated_at.is_some() {
                    entry.remote_updated_at = remote_updated_at;
                }
                self.repo.save(&entry).await?;
                FreshnessCheck {
                    source_name: entry.source_name.clone(),
                    checked_at: now,
                    needs_refresh,
                    remote_updated_at,
                    previous_remote_updated_at: previous,
                    last_success_at: entry.last_success_at,
                    error: None,
                }
            }
            Err(error) => {
                warn!(source = %source_name, error = %error, "freshness check failed");
                FreshnessCheck {
                    source_name: entry.source_name.clone(),
                    checked_at: now,
                    needs_refresh: false,
                    remote_updated_at: None,
                    previous_remote_updated_at: previous,
                    last_success_at: entry.last_success_at,
                    error: Some(error),
                }
            }
        };
        info!(
            source = %source_name,
            needs_refresh = check.needs_refresh,
            remote_updated_at = ?check.remote_updated_at,
            "freshness checked"
        );
        Ok(check)
    }
}
