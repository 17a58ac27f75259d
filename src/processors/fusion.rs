use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::models::{Field, Measurement, MeasurementPatch, Reading};
use crate::processors::resolver::Candidate;
use crate::settings::FusionSettings;
use crate::storage::MeasurementStore;

/// Every candidate offered for one (station, time bucket).
#[derive(Debug, Clone, PartialEq)]
pub struct CellOffers {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    /// Per field, newest reading first; the resolver's precedence sort is
    /// stable, so within one source the freshest present value wins.
    pub offers: BTreeMap<Field, Vec<Candidate>>,
}

impl CellOffers {
    fn new(station_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.to_string(),
            timestamp,
            offers: BTreeMap::new(),
        }
    }

    /// Readings arrive in time order.
    fn push(&mut self, reading: Reading) {
        self.offers
            .entry(reading.field)
            .or_default()
            .insert(0, Candidate::new(reading.source, reading.value));
    }
}

/// Turns resolved patches into canonical rows, one per (station, timestamp).
pub struct FusionEngine {
    window: Duration,
}

impl FusionEngine {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            window: Duration::minutes(window_minutes.max(0)),
        }
    }

    pub fn from_settings(settings: &FusionSettings) -> Self {
        Self::new(settings.bucket_window_minutes)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Collapse historical duplicates and (re)assert the key constraint.
    /// Returns the number of rows removed.
    pub fn prepare(&self, store: &dyn MeasurementStore) -> Result<usize> {
        let removed = store.deduplicate_measurements()?;
        if removed > 0 {
            tracing::info!(removed, "Collapsed duplicate measurement rows");
        }
        store.ensure_unique_constraint()?;
        Ok(removed)
    }

    /// Group readings into cells: per station, readings closer than the
    /// window to the first reading of a bucket share that bucket, and the
    /// bucket takes the first reading's timestamp.
    pub fn group(&self, readings: impl IntoIterator<Item = Reading>) -> Vec<CellOffers> {
        let mut by_station: HashMap<String, Vec<Reading>> = HashMap::new();
        for reading in readings {
            by_station
                .entry(reading.station_key.clone())
                .or_default()
                .push(reading);
        }

        let mut cells = Vec::new();
        for (station_id, mut readings) in by_station {
            // stable, so arrival order survives within one instant
            readings.sort_by_key(|r| r.timestamp);

            let mut current: Option<CellOffers> = None;
            for reading in readings {
                if let Some(cell) = current.as_mut() {
                    if reading.timestamp - cell.timestamp <= self.window {
                        cell.push(reading);
                        continue;
                    }
                }

                cells.extend(current.take());
                let mut cell = CellOffers::new(&station_id, reading.timestamp);
                cell.push(reading);
                current = Some(cell);
            }
            cells.extend(current);
        }

        cells.sort_by(|a, b| {
            a.station_id
                .cmp(&b.station_id)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        cells
    }

    /// Snap a timestamp onto the station's nearest stored row within the window.
    pub fn bucket_timestamp(
        &self,
        store: &dyn MeasurementStore,
        station_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if self.window <= Duration::zero() {
            return Ok(timestamp);
        }
        Ok(store
            .find_measurement_near(station_id, timestamp, self.window)?
            .unwrap_or(timestamp))
    }

    /// Write one patch. Empty patches are not written and yield `None`.
    pub fn upsert(
        &self,
        store: &dyn MeasurementStore,
        station_id: &str,
        timestamp: DateTime<Utc>,
        patch: &MeasurementPatch,
    ) -> Result<Option<Measurement>> {
        if patch.is_empty() {
            return Ok(None);
        }

        let key_timestamp = self.bucket_timestamp(store, station_id, timestamp)?;
        if key_timestamp != timestamp {
            tracing::debug!(
                station_id,
                incoming = %timestamp,
                existing = %key_timestamp,
                "Merging into existing row within bucket window"
            );
        }

        store
            .upsert_measurement(station_id, key_timestamp, patch)
            .map(Some)
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(crate::utils::constants::DEFAULT_BUCKET_WINDOW_MINUTES)
    }
}
