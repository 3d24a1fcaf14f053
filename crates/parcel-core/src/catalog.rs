//! Catalog value types: per-source freshness, health and schema fingerprints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{ConnectorKind, DatasetKind};

/// A source is stale once this many refresh intervals pass without a success.
pub const STALENESS_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Failed,
}

/// Health as reported to operators; staleness overrides stored health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Healthy,
    Degraded,
    Failed,
    Stale,
}

impl From<Health> for ReportedStatus {
    fn from(value: Health) -> Self {
        match value {
            Health::Healthy => ReportedStatus::Healthy,
            Health::Degraded => ReportedStatus::Degraded,
            Health::Failed => ReportedStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl From<RunOutcome> for RunState {
    fn from(value: RunOutcome) -> Self {
        match value {
            RunOutcome::Succeeded => RunState::Succeeded,
            RunOutcome::PartiallyFailed => RunState::PartiallyFailed,
            RunOutcome::Failed => RunState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: String,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
        }
    }
}

/// Set of (field name, field type) pairs reported by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFingerprint {
    fields: BTreeMap<String, String>,
}

impl SchemaFingerprint {
    pub fn from_fields(fields: impl IntoIterator<Item = SchemaField>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|f| (f.name, f.field_type))
                .collect(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = SchemaField> + '_ {
        self.fields
            .iter()
            .map(|(name, field_type)| SchemaField::new(name, field_type))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First 16 hex chars of sha256 over sorted `name:type` lines; field order does not matter.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, field_type) in &self.fields {
            hasher.update(format!("{name}:{field_type}\n").as_bytes());
        }
        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(16);
        hex
    }

    pub fn diff(&self, observed: &SchemaFingerprint) -> Option<SchemaDrift> {
        let added_columns: Vec<String> = observed
            .fields
            .keys()
            .filter(|name| !self.fields.contains_key(*name))
            .cloned()
            .collect();
        let removed_columns: Vec<String> = self
            .fields
            .keys()
            .filter(|name| !observed.fields.contains_key(*name))
            .cloned()
            .collect();
        let changed_types: Vec<TypeChange> = self
            .fields
            .iter()
            .filter_map(|(name, before)| {
                let after = observed.fields.get(name)?;
                (after != before).then(|| TypeChange {
                    column: name.clone(),
                    from: before.clone(),
                    to: after.clone(),
                })
            })
            .collect();

        if added_columns.is_empty() && removed_columns.is_empty() && changed_types.is_empty() {
            None
        } else {
            Some(SchemaDrift {
                added_columns,
                removed_columns,
                changed_types,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub column: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDrift {
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub changed_types: Vec<TypeChange>,
}

impl SchemaDrift {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added_columns.is_empty() {
            parts.push(format!("added [{}]", self.added_columns.join(", ")));
        }
        if !self.removed_columns.is_empty() {
            parts.push(format!("removed [{}]", self.removed_columns.join(", ")));
        }
        if !self.changed_types.is_empty() {
            let changed = self
                .changed_types
                .iter()
                .map(|c| format!("{}: {} -> {}", c.column, c.from, c.to))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("retyped [{changed}]"));
        }
        parts.join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub source_name: String,
    pub display_name: String,
    pub connector: ConnectorKind,
    pub dataset: DatasetKind,
    pub refresh_interval_secs: i64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub schema_fingerprint: Option<SchemaFingerprint>,
    pub health: Health,
    pub run_state: RunState,
    pub last_run_id: Option<Uuid>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_drift: Option<SchemaDrift>,
    /// Rows the source delivered in its last successful run.
    pub row_count: Option<u64>,
    /// Upstream modification time seen by the last freshness check.
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub remote_checked_at: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn new(
        source_name: impl Into<String>,
        display_name: impl Into<String>,
        connector: ConnectorKind,
        dataset: DatasetKind,
        refresh_interval_secs: i64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            display_name: display_name.into(),
            connector,
            dataset,
            refresh_interval_secs,
            last_success_at: None,
            last_attempt_at: None,
            schema_fingerprint: None,
            health: Health::Healthy,
            run_state: RunState::NotStarted,
            last_run_id: None,
            consecutive_failures: 0,
            last_error: None,
            last_drift: None,
            row_count: None,
            remote_updated_at: None,
            remote_checked_at: None,
        }
    }

    pub fn staleness_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_success_at
            .map(|at| (now - at).num_seconds().max(0) as f64 / 3600.0)
    }

    /// Never-ingested sources count as stale.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_success_at {
            None => true,
            Some(at) => {
                let elapsed = (now - at).num_seconds() as f64;
                elapsed > self.refresh_interval_secs as f64 * STALENESS_FACTOR
            }
        }
    }

    pub fn reported_status(&self, now: DateTime<Utc>) -> ReportedStatus {
        if self.is_stale(now) {
            ReportedStatus::Stale
        } else {
            self.health.into()
        }
    }

    /// Stale or failed sources are due for a refresh.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.reported_status(now),
            ReportedStatus::Stale | ReportedStatus::Failed
        )
    }

    /// Whether upstream reports changes this source has not ingested yet.
    /// Without an upstream timestamp, falls back to [`CatalogEntry::is_due`].
    pub fn needs_refresh(&self, remote_updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (remote_updated_at, self.last_success_at) {
            (Some(remote), Some(ingested)) => remote > ingested,
            (Some(_), None) => true,
            (None, _) => self.is_due(now),
        }
    }

    pub fn health_view(&self, now: DateTime<Utc>) -> SourceHealth {
        SourceHealth {
            name: self.source_name.clone(),
            display_name: self.display_name.clone(),
            dataset: self.dataset,
            status: self.reported_status(now),
            health: self.health,
            run_state: self.run_state,
            last_success: self.last_success_at,
            last_attempt: self.last_attempt_at,
            staleness_hours: self.staleness_hours(now),
            expected_refresh_hours: self.refresh_interval_secs as f64 / 3600.0,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            schema_hash: self.schema_fingerprint.as_ref().map(SchemaFingerprint::digest),
            row_count: self.row_count,
            remote_updated_at: self.remote_updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub name: String,
    pub display_name: String,
    pub dataset: DatasetKind,
    pub status: ReportedStatus,
    pub health: Health,
    pub run_state: RunState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub staleness_hours: Option<f64>,
    pub expected_refresh_hours: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub schema_hash: Option<String>,
    pub row_count: Option<u64>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

/// Outcome of asking upstream when a source last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessCheck {
    pub source_name: String,
    pub checked_at: DateTime<Utc>,
    pub needs_refresh: bool,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub previous_remote_updated_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceHealth>,
    pub total_sources: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub stale: usize,
}

impl HealthSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CatalogEntry>, now: DateTime<Utc>) -> Self {
        let sources: Vec<SourceHealth> = entries.into_iter().map(|e| e.health_view(now)).collect();
        let count = |status: ReportedStatus| sources.iter().filter(|s| s.status == status).count();
        Self {
            generated_at: now,
            total_sources: sources.len(),
            healthy: count(ReportedStatus::Healthy),
            degraded: count(ReportedStatus::Degraded),
            failed: count(ReportedStatus::Failed),
            stale: count(ReportedStatus::Stale),
            sources,
        }
    }
}
