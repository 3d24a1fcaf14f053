//! Postgres/PostGIS backend. Geometry goes in as WKT and comes back as GeoJSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_core::catalog::{CatalogEntry, SchemaDrift, SchemaFingerprint};
use parcel_core::{
    AdjudicatedParcel, CityLimitPolygon, DatasetKind, Geometry, ParcelRecord, ParcelRequestCount, RequestStatus,
    ServiceRequestSummary, SpatialRecord, ZoningPolygon,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{CatalogRepository, ParcelSearch, RecordStore, StoreError, StoreResult, UpsertCounts};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

fn table_for(dataset: DatasetKind) -> (&'static str, &'static str) {
    match dataset {
        DatasetKind::Parcels => ("parcels", "parcel_id"),
        DatasetKind::Zoning => ("zoning_polygons", "zone_id"),
        DatasetKind::CityLimits => ("city_limits", "city_id"),
        DatasetKind::Adjudicated => ("adjudicated_parcels", "parcel_id"),
        DatasetKind::ServiceRequests => ("service_requests", "request_id"),
    }
}

fn enum_to_text<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: String) -> StoreResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(text))?)
}

fn geometry_from_column(raw: Option<String>) -> StoreResult<Option<Geometry>> {
    match raw {
        None => Ok(None),
        Some(text) => {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            Ok(Some(Geometry::from_geojson(&value)?))
        }
    }
}

fn required_geometry(raw: Option<String>) -> StoreResult<Geometry> {
    geometry_from_column(raw)?.ok_or(StoreError::Geometry(parcel_core::GeometryError::Missing))
}

/// `%term%` for ILIKE, with the pattern characters in `term` matched literally.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn limit_param(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_one(
        tx: &mut Transaction<'_, Postgres>,
        record: &SpatialRecord,
        content_hash: &str,
    ) -> StoreResult<UpsertOutcome> {
        let row: Option<PgRow> = match record {
            SpatialRecord::Parcel(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO parcels (parcel_id, owner_name, site_address, geom, source_name, content_hash, last_seen_at)
                    VALUES ($1, $2, $3, ST_GeomFromText($4, 4326), $5, $6, $7)
                    ON CONFLICT (parcel_id) DO UPDATE
                       SET owner_name = EXCLUDED.owner_name,
                           site_address = EXCLUDED.site_address,
                           geom = EXCLUDED.geom,
                           source_name = EXCLUDED.source_name,
                           content_hash = EXCLUDED.content_hash,
                           last_seen_at = EXCLUDED.last_seen_at,
                           updated_at = NOW()
                     WHERE parcels.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&r.parcel_id)
                .bind(&r.owner_name)
                .bind(&r.site_address)
                .bind(r.geometry.as_ref().map(Geometry::to_wkt))
                .bind(&r.source_name)
                .bind(content_hash)
                .bind(r.last_seen_at)
                .fetch_optional(&mut **tx)
                .await?
            }
            SpatialRecord::Zoning(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO zoning_polygons (zone_id, zone_code, zone_name, geom, source_name, content_hash, last_seen_at)
                    VALUES ($1, $2, $3, ST_GeomFromText($4, 4326), $5, $6, $7)
                    ON CONFLICT (zone_id) DO UPDATE
                       SET zone_code = EXCLUDED.zone_code,
                           zone_name = EXCLUDED.zone_name,
                           geom = EXCLUDED.geom,
                           source_name = EXCLUDED.source_name,
                           content_hash = EXCLUDED.content_hash,
                           last_seen_at = EXCLUDED.last_seen_at,
                           updated_at = NOW()
                     WHERE zoning_polygons.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&r.zone_id)
                .bind(&r.zone_code)
                .bind(&r.zone_name)
                .bind(r.geometry.to_wkt())
                .bind(&r.source_name)
                .bind(content_hash)
                .bind(r.last_seen_at)
                .fetch_optional(&mut **tx)
                .await?
            }
            SpatialRecord::CityLimit(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO city_limits (city_id, city_name, city_code, geom, source_name, content_hash, last_seen_at)
                    VALUES ($1, $2, $3, ST_GeomFromText($4, 4326), $5, $6, $7)
                    ON CONFLICT (city_id) DO UPDATE
                       SET city_name = EXCLUDED.city_name,
                           city_code = EXCLUDED.city_code,
                           geom = EXCLUDED.geom,
                           source_name = EXCLUDED.source_name,
                           content_hash = EXCLUDED.content_hash,
                           last_seen_at = EXCLUDED.last_seen_at,
                           updated_at = NOW()
                     WHERE city_limits.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&r.city_id)
                .bind(&r.city_name)
                .bind(&r.city_code)
                .bind(r.geometry.to_wkt())
                .bind(&r.source_name)
                .bind(content_hash)
                .bind(r.last_seen_at)
                .fetch_optional(&mut **tx)
                .await?
            }
            SpatialRecord::Adjudicated(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO adjudicated_parcels (parcel_id, status, owner_name, site_address, geom, source_name, content_hash, last_seen_at)
                    VALUES ($1, $2, $3, $4, ST_GeomFromText($5, 4326), $6, $7, $8)
                    ON CONFLICT (parcel_id) DO UPDATE
                       SET status = EXCLUDED.status,
                           owner_name = EXCLUDED.owner_name,
                           site_address = EXCLUDED.site_address,
                           geom = EXCLUDED.geom,
                           source_name = EXCLUDED.source_name,
                           content_hash = EXCLUDED.content_hash,
                           last_seen_at = EXCLUDED.last_seen_at,
                           updated_at = NOW()
                     WHERE adjudicated_parcels.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&r.parcel_id)
                .bind(&r.status)
                .bind(&r.owner_name)
                .bind(&r.site_address)
                .bind(r.geometry.as_ref().map(Geometry::to_wkt))
                .bind(&r.source_name)
                .bind(content_hash)
                .bind(r.last_seen_at)
                .fetch_optional(&mut **tx)
                .await?
            }
            SpatialRecord::ServiceRequest(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO service_requests (request_id, request_type, status, created_at, geom, source_name, content_hash, last_seen_at)
                    VALUES ($1, $2, $3, $4, ST_SetSRID(ST_MakePoint($5, $6), 4326), $7, $8, $9)
                    ON CONFLICT (request_id) DO UPDATE
                       SET request_type = EXCLUDED.request_type,
                           status = EXCLUDED.status,
                           created_at = EXCLUDED.created_at,
                           geom = EXCLUDED.geom,
                           source_name = EXCLUDED.source_name,
                           content_hash = EXCLUDED.content_hash,
                           last_seen_at = EXCLUDED.last_seen_at,
                           updated_at = NOW()
                     WHERE service_requests.content_hash IS DISTINCT FROM EXCLUDED.content_hash
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(&r.request_id)
                .bind(&r.request_type)
                .bind(enum_to_text(&r.status)?)
                .bind(r.created_at)
                .bind(r.location.x)
                .bind(r.location.y)
                .bind(&r.source_name)
                .bind(content_hash)
                .bind(r.last_seen_at)
                .fetch_optional(&mut **tx)
                .await?
            }
        };

        match row {
            Some(row) if row.try_get::<bool, _>("inserted")? => Ok(UpsertOutcome::Inserted),
            Some(_) => Ok(UpsertOutcome::Updated),
            None => {
                let (table, id_column) = table_for(record.dataset());
                let touch = format!("UPDATE {table} SET last_seen_at = GREATEST(last_seen_at, $2) WHERE {id_column} = $1");
                sqlx::query(&touch)
                    .bind(record.external_id())
                    .bind(record.last_seen_at())
                    .execute(&mut **tx)
                    .await?;
                Ok(UpsertOutcome::Unchanged)
            }
        }
    }
}

fn parcel_from_row(row: &PgRow) -> StoreResult<ParcelRecord> {
    Ok(ParcelRecord {
        parcel_id: row.try_get("parcel_id")?,
        owner_name: row.try_get("owner_name")?,
        site_address: row.try_get("site_address")?,
        geometry: geometry_from_column(row.try_get("geom")?)?,
        source_name: row.try_get("source_name")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn adjudicated_from_row(row: &PgRow) -> StoreResult<AdjudicatedParcel> {
    Ok(AdjudicatedParcel {
        parcel_id: row.try_get("parcel_id")?,
        status: row.try_get("status")?,
        owner_name: row.try_get("owner_name")?,
        site_address: row.try_get("site_address")?,
        geometry: geometry_from_column(row.try_get("geom")?)?,
        source_name: row.try_get("source_name")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn catalog_from_row(row: &PgRow) -> StoreResult<CatalogEntry> {
    let fingerprint: Option<Json<SchemaFingerprint>> = row.try_get("schema_fingerprint")?;
    let drift: Option<Json<SchemaDrift>> = row.try_get("last_drift")?;
    let failures: i32 = row.try_get("consecutive_failures")?;
    let row_count: Option<i64> = row.try_get("row_count")?;
    Ok(CatalogEntry {
        source_name: row.try_get("source_name")?,
        display_name: row.try_get("display_name")?,
        connector: enum_from_text(row.try_get("connector")?)?,
        dataset: enum_from_text(row.try_get("dataset")?)?,
        refresh_interval_secs: row.try_get("refresh_interval_secs")?,
        last_success_at: row.try_get::<Option<DateTime<Utc>>, _>("last_success_at")?,
        last_attempt_at: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt_at")?,
        schema_fingerprint: fingerprint.map(|Json(f)| f),
        health: enum_from_text(row.try_get("health")?)?,
        run_state: enum_from_text(row.try_get("run_state")?)?,
        last_run_id: row.try_get("last_run_id")?,
        consecutive_failures: failures.max(0) as u32,
        last_error: row.try_get("last_error")?,
        last_drift: drift.map(|Json(d)| d),
        row_count: row_count.map(|n| n.max(0) as u64),
        remote_updated_at: row.try_get("remote_updated_at")?,
        remote_checked_at: row.try_get("remote_checked_at")?,
    })
}

const CATALOG_COLUMNS: &str = "source_name, display_name, connector, dataset, refresh_interval_secs, \
     last_success_at, last_attempt_at, schema_fingerprint, health, run_state, last_run_id, \
     consecutive_failures, last_error, last_drift, row_count, remote_updated_at, remote_checked_at";

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_batch(&self, records: &[SpatialRecord]) -> StoreResult<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let content_hash = record.content_hash();
            match Self::upsert_one(&mut tx, record, &content_hash).await? {
                UpsertOutcome::Inserted => counts.inserted += 1,
                UpsertOutcome::Updated => counts.updated += 1,
                UpsertOutcome::Unchanged => counts.unchanged += 1,
            }
        }
        tx.commit().await?;
        debug!(
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            "upsert batch committed"
        );
        Ok(counts)
    }

    async fn get_parcel(&self, parcel_id: &str) -> StoreResult<Option<ParcelRecord>> {
        let row = sqlx::query(
            r#"
            SELECT parcel_id, owner_name, site_address, ST_AsGeoJSON(geom) AS geom, source_name, last_seen_at
              FROM parcels
             WHERE parcel_id = $1
            "#,
        )
        .bind(parcel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parcel_from_row).transpose()
    }

    async fn count(&self, dataset: DatasetKind) -> StoreResult<u64> {
        let (table, _) = table_for(dataset);
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn zoning_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<ZoningPolygon>> {
        let Some(geometry) = &parcel.geometry else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT zone_id, zone_code, zone_name, ST_AsGeoJSON(geom) AS geom, source_name, last_seen_at
              FROM zoning_polygons
             WHERE ST_Covers(geom, ST_GeomFromText($1, 4326))
             ORDER BY ST_Area(geom) ASC, zone_id ASC
             LIMIT 1
            "#,
        )
        .bind(geometry.to_wkt())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<ZoningPolygon> {
            Ok(ZoningPolygon {
                zone_id: row.try_get("zone_id")?,
                zone_code: row.try_get("zone_code")?,
                zone_name: row.try_get("zone_name")?,
                geometry: required_geometry(row.try_get("geom")?)?,
                source_name: row.try_get("source_name")?,
                last_seen_at: row.try_get("last_seen_at")?,
            })
        })
        .transpose()
    }

    async fn city_covering(&self, parcel: &ParcelRecord) -> StoreResult<Option<CityLimitPolygon>> {
        let Some(geometry) = &parcel.geometry else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT city_id, city_name, city_code, ST_AsGeoJSON(geom) AS geom, source_name, last_seen_at
              FROM city_limits
             WHERE ST_Covers(geom, ST_GeomFromText($1, 4326))
             ORDER BY ST_Area(geom) ASC, city_id ASC
             LIMIT 1
            "#,
        )
        .bind(geometry.to_wkt())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<CityLimitPolygon> {
            Ok(CityLimitPolygon {
                city_id: row.try_get("city_id")?,
                city_name: row.try_get("city_name")?,
                city_code: row.try_get("city_code")?,
                geometry: required_geometry(row.try_get("geom")?)?,
                source_name: row.try_get("source_name")?,
                last_seen_at: row.try_get("last_seen_at")?,
            })
        })
        .transpose()
    }

    async fn is_adjudicated(&self, parcel_id: &str) -> StoreResult<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM adjudicated_parcels WHERE parcel_id = $1)")
                .bind(parcel_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn service_requests_near(
        &self,
        parcel: &ParcelRecord,
        radius_m: f64,
    ) -> StoreResult<ServiceRequestSummary> {
        let mut summary = ServiceRequestSummary {
            radius_m,
            ..ServiceRequestSummary::default()
        };
        let Some(geometry) = &parcel.geometry else {
            return Ok(summary);
        };
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(request_type, 'Unknown') AS request_type, status, COUNT(*) AS n
              FROM service_requests
             WHERE ST_DWithin(geom::geography, ST_GeomFromText($1, 4326)::geography, $2)
             GROUP BY 1, 2
            "#,
        )
        .bind(geometry.to_wkt())
        .bind(radius_m)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let request_type: String = row.try_get("request_type")?;
            let status: RequestStatus = enum_from_text(row.try_get("status")?)?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            summary.total += n;
            match status {
                RequestStatus::Open => summary.open += n,
                RequestStatus::Closed => summary.closed += n,
            }
            *summary.by_type.entry(request_type).or_default() += n;
        }
        Ok(summary)
    }

    async fn search_parcels(&self, search: &ParcelSearch) -> StoreResult<Vec<ParcelRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT parcel_id, owner_name, site_address, ST_AsGeoJSON(geom) AS geom, source_name, last_seen_at
              FROM parcels
             WHERE ($1::text IS NULL OR site_address ILIKE $1)
               AND ($2::text IS NULL OR owner_name ILIKE $2)
               AND ($3::text IS NULL OR parcel_id = $3)
             ORDER BY parcel_id
             LIMIT $4
            "#,
        )
        .bind(search.address_term().map(like_pattern))
        .bind(search.owner_term().map(like_pattern))
        .bind(search.parcel_id_term())
        .bind(limit_param(search.limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parcel_from_row).collect()
    }

    async fn list_adjudicated(&self, limit: usize) -> StoreResult<Vec<AdjudicatedParcel>> {
        let rows = sqlx::query(
            r#"
            SELECT parcel_id, status, owner_name, site_address, ST_AsGeoJSON(geom) AS geom, source_name, last_seen_at
              FROM adjudicated_parcels
             ORDER BY parcel_id
             LIMIT $1
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(adjudicated_from_row).collect()
    }

    async fn parcels_in_zone(&self, zone_code: &str, limit: usize) -> StoreResult<Vec<ParcelRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT p.parcel_id, p.owner_name, p.site_address, ST_AsGeoJSON(p.geom) AS geom, p.source_name, p.last_seen_at
              FROM parcels p
             WHERE p.geom IS NOT NULL
               AND EXISTS (
                   SELECT 1 FROM zoning_polygons z
                    WHERE z.zone_code = $1 AND ST_Intersects(z.geom, p.geom)
               )
             ORDER BY p.parcel_id
             LIMIT $2
            "#,
        )
        .bind(zone_code)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parcel_from_row).collect()
    }

    async fn high_request_parcels(
        &self,
        min_requests: u64,
        radius_m: f64,
        limit: usize,
    ) -> StoreResult<Vec<ParcelRequestCount>> {
        let rows = sqlx::query(
            r#"
            SELECT p.parcel_id, p.owner_name, p.site_address, COUNT(sr.request_id) AS request_count
              FROM parcels p
              JOIN service_requests sr
                ON ST_DWithin(sr.geom::geography, p.geom::geography, $1)
             WHERE p.geom IS NOT NULL
             GROUP BY p.parcel_id, p.owner_name, p.site_address
            HAVING COUNT(sr.request_id) >= $2
             ORDER BY request_count DESC, p.parcel_id ASC
             LIMIT $3
            "#,
        )
        .bind(radius_m)
        .bind(min_requests.min(i64::MAX as u64) as i64)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<ParcelRequestCount> {
                Ok(ParcelRequestCount {
                    parcel_id: row.try_get("parcel_id")?,
                    owner_name: row.try_get("owner_name")?,
                    site_address: row.try_get("site_address")?,
                    request_count: row.try_get::<i64, _>("request_count")?.max(0) as u64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO data_catalog (source_name, display_name, connector, dataset, refresh_interval_secs)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_name) DO NOTHING
            "#,
        )
        .bind(&entry.source_name)
        .bind(&entry.display_name)
        .bind(enum_to_text(&entry.connector)?)
        .bind(enum_to_text(&entry.dataset)?)
        .bind(entry.refresh_interval_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load(&self, source_name: &str) -> StoreResult<Option<CatalogEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {CATALOG_COLUMNS} FROM data_catalog WHERE source_name = $1"
        ))
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(catalog_from_row).transpose()
    }

    async fn load_all(&self) -> StoreResult<Vec<CatalogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATALOG_COLUMNS} FROM data_catalog ORDER BY source_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(catalog_from_row).collect()
    }

    async fn save(&self, entry: &CatalogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO data_catalog (
                source_name, display_name, connector, dataset, refresh_interval_secs,
                last_success_at, last_attempt_at, schema_fingerprint, health, run_state,
                last_run_id, consecutive_failures, last_error, last_drift, row_count,
                remote_updated_at, remote_checked_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW())
            ON CONFLICT (source_name) DO UPDATE
               SET display_name = EXCLUDED.display_name,
                   connector = EXCLUDED.connector,
                   dataset = EXCLUDED.dataset,
                   refresh_interval_secs = EXCLUDED.refresh_interval_secs,
                   last_success_at = GREATEST(data_catalog.last_success_at, EXCLUDED.last_success_at),
                   last_attempt_at = EXCLUDED.last_attempt_at,
                   schema_fingerprint = EXCLUDED.schema_fingerprint,
                   health = EXCLUDED.health,
                   run_state = EXCLUDED.run_state,
                   last_run_id = EXCLUDED.last_run_id,
                   consecutive_failures = EXCLUDED.consecutive_failures,
                   last_error = EXCLUDED.last_error,
                   last_drift = EXCLUDED.last_drift,
                   row_count = EXCLUDED.row_count,
                   remote_updated_at = EXCLUDED.remote_updated_at,
                   remote_checked_at = EXCLUDED.remote_checked_at,
                   updated_at = NOW()
            "#,
        )
        .bind(&entry.source_name)
        .bind(&entry.display_name)
        .bind(enum_to_text(&entry.connector)?)
        .bind(enum_to_text(&entry.dataset)?)
        .bind(entry.refresh_interval_secs)
        .bind(entry.last_success_at)
        .bind(entry.last_attempt_at)
        .bind(entry.schema_fingerprint.as_ref().map(Json))
        .bind(enum_to_text(&entry.health)?)
        .bind(enum_to_text(&entry.run_state)?)
        .bind(entry.last_run_id)
        .bind(entry.consecutive_failures.min(i32::MAX as u32) as i32)
        .bind(&entry.last_error)
        .bind(entry.last_drift.as_ref().map(Json))
        .bind(entry.row_count.map(|n| n.min(i64::MAX as u64) as i64))
        .bind(entry.remote_updated_at)
        .bind(entry.remote_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_core::catalog::{Health, RunState};
    use parcel_core::ConnectorKind;

    #[test]
    fn enums_round_trip_through_text_columns() {
        assert_eq!(enum_to_text(&DatasetKind::CityLimits).unwrap(), "city_limits");
        assert_eq!(enum_to_text(&RunState::PartiallyFailed).unwrap(), "partially_failed");
        let health: Health = enum_from_text("degraded".to_string()).unwrap();
        assert_eq!(health, Health::Degraded);
        let connector: ConnectorKind = enum_from_text("geospatial".to_string()).unwrap();
        assert_eq!(connector, ConnectorKind::Geospatial);
        assert!(enum_from_text::<Health>("bogus".to_string()).is_err());
    }

    #[test]
    fn geometry_columns_parse_from_geojson_text() {
        let parsed = geometry_from_column(Some(
            r#"{"type":"MultiPolygon","coordinates":[[[[0,0],[1,0],[1,1],[0,1],[0,0]]]]}"#.to_string(),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(parsed.polygons().len(), 1);
        assert!(geometry_from_column(None).unwrap().is_none());
        assert!(required_geometry(None).is_err());
    }

    #[test]
    fn like_patterns_match_terms_literally() {
        assert_eq!(like_pattern("main st"), "%main st%");
        assert_eq!(like_pattern("100%_a\\b"), "%100\\%\\_a\\\\b%");
    }

    #[test]
    fn parcel_geometry_columns_accept_points() {
        let migration = include_str!("../../../migrations/0002_parcel_point_geometry.sql")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        for table in ["parcels", "adjudicated_parcels"] {
            assert!(migration.contains(&format!(
                "ALTER TABLE {table} ALTER COLUMN geom TYPE geometry(Geometry, 4326)"
            )));
        }
    }

    #[test]
    fn every_dataset_has_a_table() {
        for dataset in [
            DatasetKind::Parcels,
            DatasetKind::Zoning,
            DatasetKind::CityLimits,
            DatasetKind::Adjudicated,
            DatasetKind::ServiceRequests,
        ] {
            let (table, id) = table_for(dataset);
            assert!(!table.is_empty() && id.ends_with("_id"));
        }
    }
}
