pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{PostgresConnector, PostgresStore};

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{Field, Measurement, MeasurementPatch, Prediction, PredictionSet, Station};

/// Persistence boundary for stations, canonical measurements and predictions.
///
/// Methods take `&self`; implementations synchronise internally so one
/// handle can be driven from a worker thread.
pub trait MeasurementStore: Send {
    fn get_stations(&self) -> Result<Vec<Station>>;

    /// Insert stations whose id is not yet known. Returns how many were new.
    fn register_stations(&self, stations: &[Station]) -> Result<usize>;

    /// Coalesce-on-write: creates the row if the key is new, otherwise merges
    /// the patch into it. Returns the row as stored.
    fn upsert_measurement(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        patch: &MeasurementPatch,
    ) -> Result<Measurement>;

    /// Timestamp of the station's stored row closest to `timestamp`, if one
    /// lies within `window`.
    fn find_measurement_near(
        &self,
        station_id: &str,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Most recent rows with `required` present, newest first.
    fn get_recent_measurements(&self, limit: usize, required: Field) -> Result<Vec<Measurement>>;

    fn get_latest_measurement(&self, station_id: &str) -> Result<Option<Measurement>>;

    /// Every stored row ordered by station and timestamp.
    fn all_measurements(&self) -> Result<Vec<Measurement>>;

    /// Atomically swap the whole prediction set. Returns the rows written.
    fn replace_all_predictions(&self, predictions: &PredictionSet) -> Result<usize>;

    fn get_predictions(&self, station_id: Option<&str>) -> Result<Vec<Prediction>>;

    /// Collapse rows sharing a key, keeping the lowest id. Returns rows removed.
    fn deduplicate_measurements(&self) -> Result<usize>;

    fn ensure_unique_constraint(&self) -> Result<()>;
}

/// Opens store handles; worker threads each call this for their own.
pub trait StoreConnector: Sync {
    fn connect(&self) -> Result<Box<dyn MeasurementStore>>;
}
