//! Spatial context for a single parcel.

use std::sync::Arc;

use parcel_core::{CitySummary, ParcelOverlay, ZoningSummary};
use parcel_storage::{RecordStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("parcel {0} not found")]
    ParcelNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct OverlayService {
    store: Arc<dyn RecordStore>,
    radius_m: f64,
}

impl std::fmt::Debug for OverlayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayService")
            .field("radius_m", &self.radius_m)
            .finish_non_exhaustive()
    }
}

fn settle<T>(lookup: &'static str, result: Result<T, StoreError>, degraded: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(lookup, error = %err, "overlay lookup degraded");
            degraded.push(lookup.to_string());
            None
        }
    }
}

impl OverlayService {
    pub fn new(store: Arc<dyn RecordStore>, radius_m: f64) -> Self {
        Self { store, radius_m }
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    /// Fails only when the parcel itself cannot be found. Each sub-lookup
    /// that errors comes back as `None` and is named in `degraded_lookups`.
    pub async fn get_overlay(&self, parcel_id: &str) -> Result<ParcelOverlay, OverlayError> {
        let parcel = self
            .store
            .get_parcel(parcel_id)
            .await?
            .ok_or_else(|| OverlayError::ParcelNotFound(parcel_id.to_string()))?;

        let (zoning, city, adjudicated, requests) = tokio::join!(
            self.store.zoning_covering(&parcel),
            self.store.city_covering(&parcel),
            self.store.is_adjudicated(&parcel.parcel_id),
            self.store.service_requests_near(&parcel, self.radius_m),
        );

        let mut degraded = Vec::new();
        let zoning = settle("zoning", zoning, &mut degraded).flatten().map(|zone| ZoningSummary {
            code: zone.zone_code,
            name: zone.zone_name,
        });
        let city = settle("city", city, &mut degraded)
            .flatten()
            .map(|city| CitySummary { name: city.city_name });
        let adjudicated = settle("adjudicated", adjudicated, &mut degraded);
        let service_requests = settle("service_requests", requests, &mut degraded);

        debug!(parcel_id, degraded = degraded.len(), "overlay computed");
        Ok(ParcelOverlay {
            parcel_id: parcel.parcel_id,
            owner_name: parcel.owner_name,
            site_address: parcel.site_address,
            has_geometry: parcel.geometry.is_some(),
            zoning,
            city,
            adjudicated,
            service_requests,
            degraded_lookups: degraded,
        })
    }
}
