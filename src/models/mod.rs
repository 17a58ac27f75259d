pub mod measurement;
pub mod prediction;
pub mod reading;
pub mod station;

pub use measurement::{Field, Measurement, MeasurementPatch};
pub use prediction::{Prediction, PredictionPoint, PredictionSet};
pub use reading::{GridBatch, GridCell, GridKind, RawValue, Reading, SourceKind};
pub use station::{Station, StationRegistry};
