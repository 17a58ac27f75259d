use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub forecast_timestamp: DateTime<Utc>,
    pub predicted_pm25: f64,
    pub confidence: f64,
}

impl PredictionPoint {
    pub fn new(forecast_timestamp: DateTime<Utc>, predicted_pm25: f64, confidence: f64) -> Self {
        Self {
            forecast_timestamp,
            predicted_pm25,
            confidence,
        }
    }
}

/// Full prediction set written by one forecast run, keyed by station id.
pub type PredictionSet = BTreeMap<String, Vec<PredictionPoint>>;

/// Flattened row used for export and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub station_id: String,
    pub forecast_timestamp: DateTime<Utc>,
    pub predicted_pm25: f64,
    pub confidence: f64,
}

impl Prediction {
    pub fn from_point(station_id: &str, point: &PredictionPoint) -> Self {
        Self {
            station_id: station_id.to_string(),
            forecast_timestamp: point.forecast_timestamp,
            predicted_pm25: point.predicted_pm25,
            confidence: point.confidence,
        }
    }
}

pub fn flatten(set: &PredictionSet) -> Vec<Prediction> {
    set.iter()
        .flat_map(|(station_id, points)| {
            points
                .iter()
                .map(move |p| Prediction::from_point(station_id, p))
        })
        .collect()
}
