use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{MeasurementStore, StoreConnector};
use crate::error::{PipelineError, Result};
use crate::models::{
    prediction, Field, Measurement, MeasurementPatch, Prediction, PredictionSet, Station,
};

#[derive(Debug, Default)]
struct State {
    stations: BTreeMap<String, Station>,
    /// Keyed by row id, so iteration is insertion order
    measurements: BTreeMap<i64, Measurement>,
    next_id: i64,
    unique_enforced: bool,
    predictions: PredictionSet,
}

impl State {
    fn find_key(&self, station_id: &str, timestamp: DateTime<Utc>) -> Option<i64> {
        self.measurements
            .iter()
            .find(|(_, m)| m.station_id == station_id && m.timestamp == timestamp)
            .map(|(id, _)| *id)
    }

    fn insert(&mut self, mut measurement: Measurement) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        measurement.id = Some(id);
        self.measurements.insert(id, measurement);
        id
    }
}

/// Process-local store. Clones share the same state, which makes it usable
/// as its own `StoreConnector`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stations(stations: Vec<Station>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            for station in stations {
                state.stations.insert(station.id.clone(), station);
            }
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::StorageConflict("in-memory store lock poisoned".to_string()))
    }

    /// Write a row without the key check, reproducing a legacy table that
    /// predates the uniqueness constraint.
    pub fn insert_raw(&self, measurement: Measurement) -> Result<i64> {
        let mut state = self.lock()?;
        if state.unique_enforced
            && state
                .find_key(&measurement.station_id, measurement.timestamp)
                .is_some()
        {
            return Err(PipelineError::StorageConflict(format!(
                "duplicate key ({}, {})",
                measurement.station_id, measurement.timestamp
            )));
        }
        Ok(state.insert(measurement))
    }

    pub fn measurement_count(&self) -> Result<usize> {
        Ok(self.lock()?.measurements.len())
    }

    pub fn is_unique_enforced(&self) -> Result<bool> {
        Ok(self.lock()?.unique_enforced)
    }
}

impl MeasurementStore for InMemoryStore {
    fn get_stations(&self) -> Result<Vec<Station>> {
        Ok(self.lock()?.stations.values().cloned().collect())
    }

    fn register_stations(&self, stations: &[Station]) -> Result<usize> {
        let mut state = self.lock()?;
        let mut added = 0;
        for station in stations {
            if !state.stations.contains_key(&station.id) {
                state.stations.insert(station.id.clone(), station.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    fn upsert_measurement(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        patch: &MeasurementPatch,
    ) -> Result<Measurement> {
        let mut state = self.lock()?;

        let id = match state.find_key(station_id, timestamp) {
            Some(id) => id,
            None => state.insert(Measurement::new(station_id, timestamp)),
        };

        let row = state
            .measurements
            .get_mut(&id)
            .ok_or_else(|| PipelineError::StorageConflict(format!("row {} vanished", id)))?;
        row.merge(patch);
        Ok(row.clone())
    }

    fn find_measurement_near(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock()?;
        Ok(state
            .measurements
            .values()
            .filter(|m| m.station_id == station_id)
            .map(|m| (m.timestamp, (m.timestamp - timestamp).num_seconds().abs()))
            .filter(|(_, gap)| *gap <= window.num_seconds())
            .min_by_key(|(ts, gap)| (*gap, *ts))
            .map(|(ts, _)| ts))
    }

    fn get_recent_measurements(&self, limit: usize, required: Field) -> Result<Vec<Measurement>> {
        let state = self.lock()?;
        let mut rows: Vec<Measurement> = state
            .measurements
            .values()
            .filter(|m| m.get(required).is_some())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn get_latest_measurement(&self, station_id: &str) -> Result<Option<Measurement>> {
        let state = self.lock()?;
        Ok(state
            .measurements
            .values()
            .filter(|m| m.station_id == station_id)
            .max_by_key(|m| (m.timestamp, m.id))
            .cloned())
    }

    fn all_measurements(&self) -> Result<Vec<Measurement>> {
        let state = self.lock()?;
        let mut rows: Vec<Measurement> = state.measurements.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.station_id
                .cmp(&b.station_id)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        Ok(rows)
    }

    fn replace_all_predictions(&self, predictions: &PredictionSet) -> Result<usize> {
        let mut state = self.lock()?;
        state.predictions = predictions.clone();
        Ok(predictions.values().map(Vec::len).sum())
    }

    fn get_predictions(&self, station_id: Option<&str>) -> Result<Vec<Prediction>> {
        let state = self.lock()?;
        let rows = prediction::flatten(&state.predictions);
        Ok(match station_id {
            Some(id) => rows.into_iter().filter(|p| p.station_id == id).collect(),
            None => rows,
        })
    }

    fn deduplicate_measurements(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let mut seen = BTreeSet::new();
        let mut doomed = Vec::new();

        // ascending id order, so the first row seen per key is the keeper
        for (id, m) in &state.measurements {
            if !seen.insert((m.station_id.clone(), m.timestamp)) {
                doomed.push(*id);
            }
        }

        for id in &doomed {
            state.measurements.remove(id);
        }
        Ok(doomed.len())
    }

    fn ensure_unique_constraint(&self) -> Result<()> {
        let mut state = self.lock()?;
        {
            let mut seen = BTreeSet::new();
            for m in state.measurements.values() {
                if !seen.insert((m.station_id.as_str(), m.timestamp)) {
                    return Err(PipelineError::StorageConflict(format!(
                        "cannot enforce uniqueness, duplicate key ({}, {})",
                        m.station_id, m.timestamp
                    )));
                }
            }
        }
        state.unique_enforced = true;
        Ok(())
    }
}

impl StoreConnector for InMemoryStore {
    fn connect(&self) -> Result<Box<dyn MeasurementStore>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionPoint;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_upsert_with_disjoint_fields_coalesces() -> Result<()> {
        let store = InMemoryStore::new();
        let t = ts(10, 0);

        store.upsert_measurement("S1", t, &MeasurementPatch::new().observed(Field::Pm25, 80.0))?;
        store.upsert_measurement("S1", t, &MeasurementPatch::new().observed(Field::TempC, 19.0))?;
        let row = store
            .upsert_measurement("S1", t, &MeasurementPatch::new().observed(Field::Pm25, 80.0))?;

        assert_eq!(store.measurement_count()?, 1);
        assert_eq!(row.get(Field::Pm25), Some(80.0));
        assert_eq!(row.get(Field::TempC), Some(19.0));
        Ok(())
    }

    #[test]
    fn test_dedup_keeps_lowest_id() -> Result<()> {
        let store = InMemoryStore::new();
        let t = ts(10, 0);

        let keeper = store.insert_raw(Measurement::new("S1", t).with_value(Field::Pm25, 1.0))?;
        store.insert_raw(Measurement::new("S1", t).with_value(Field::Pm25, 2.0))?;
        store.insert_raw(Measurement::new("S1", t).with_value(Field::Pm25, 3.0))?;
        store.insert_raw(Measurement::new("S2", t).with_value(Field::Pm25, 4.0))?;

        assert!(store.ensure_unique_constraint().is_err());
        assert_eq!(store.deduplicate_measurements()?, 2);
        store.ensure_unique_constraint()?;

        let rows = store.all_measurements()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, Some(keeper));
        assert_eq!(rows[0].get(Field::Pm25), Some(1.0));

        // legacy inserts are now rejected
        assert!(store.insert_raw(Measurement::new("S1", t)).is_err());
        Ok(())
    }

    #[test]
    fn test_find_measurement_near_picks_closest() -> Result<()> {
        let store = InMemoryStore::new();
        store.upsert_measurement("S1", ts(10, 0), &MeasurementPatch::new())?;
        store.upsert_measurement("S1", ts(10, 40), &MeasurementPatch::new())?;

        let window = Duration::minutes(30);
        assert_eq!(store.find_measurement_near("S1", ts(10, 25), window)?, Some(ts(10, 40)));
        assert_eq!(store.find_measurement_near("S1", ts(10, 10), window)?, Some(ts(10, 0)));
        assert_eq!(store.find_measurement_near("S1", ts(12, 0), window)?, None);
        assert_eq!(store.find_measurement_near("S2", ts(10, 0), window)?, None);
        Ok(())
    }

    #[test]
    fn test_recent_measurements_require_field() -> Result<()> {
        let store = InMemoryStore::new();
        store.upsert_measurement("S1", ts(8, 0), &MeasurementPatch::new().observed(Field::Pm25, 10.0))?;
        store.upsert_measurement("S1", ts(9, 0), &MeasurementPatch::new().observed(Field::TempC, 20.0))?;
        store.upsert_measurement("S1", ts(10, 0), &MeasurementPatch::new().observed(Field::Pm25, 30.0))?;

        let rows = store.get_recent_measurements(5, Field::Pm25)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, ts(10, 0));

        let latest = store.get_latest_measurement("S1")?.unwrap();
        assert_eq!(latest.timestamp, ts(10, 0));
        Ok(())
    }

    #[test]
    fn test_replace_all_predictions_drops_previous_set() -> Result<()> {
        let store = InMemoryStore::new();
        let point = PredictionPoint::new(ts(11, 0), 50.0, 0.8);

        let mut first = PredictionSet::new();
        first.insert("S1".to_string(), vec![point.clone()]);
        first.insert("S2".to_string(), vec![point.clone()]);
        store.replace_all_predictions(&first)?;

        let mut second = PredictionSet::new();
        second.insert("S2".to_string(), vec![point]);
        assert_eq!(store.replace_all_predictions(&second)?, 1);

        assert!(store.get_predictions(Some("S1"))?.is_empty());
        assert_eq!(store.get_predictions(None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_register_stations_is_insert_if_absent() -> Result<()> {
        let store = InMemoryStore::with_stations(vec![Station::new("DE-ITO", "ITO", 28.63, 77.24)]);
        let added = store.register_stations(&[
            Station::new("DE-ITO", "ITO renamed", 0.0, 0.0),
            Station::new("NO-SECTOR_62", "Sector 62", 28.62, 77.36),
        ])?;

        assert_eq!(added, 1);
        let stations = store.get_stations()?;
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "ITO");
        Ok(())
    }
}
