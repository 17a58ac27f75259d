use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::Field;
use crate::utils::constants::{NULL_MARKERS, SENTINEL_VALUES};

/// Upstream source family, ordered from most to least authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    GroundSensor,
    Satellite,
    WeatherModel,
}

impl SourceKind {
    /// Lower rank wins during resolution.
    pub fn precedence(&self) -> u8 {
        match self {
            SourceKind::GroundSensor => 0,
            SourceKind::Satellite => 1,
            SourceKind::WeatherModel => 2,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::GroundSensor => write!(f, "ground"),
            SourceKind::Satellite => write!(f, "satellite"),
            SourceKind::WeatherModel => write!(f, "weather"),
        }
    }
}

/// A value exactly as an upstream delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

impl RawValue {
    /// Numeric value, with every source-specific null marker mapped to `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RawValue::Missing => None,
            RawValue::Number(v) => finite_non_sentinel(*v),
            RawValue::Text(s) => {
                let trimmed = s.trim();
                if NULL_MARKERS
                    .iter()
                    .any(|marker| marker.eq_ignore_ascii_case(trimmed))
                {
                    return None;
                }
                trimmed.parse::<f64>().ok().and_then(finite_non_sentinel)
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        self.as_number().is_none()
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<Option<f64>> for RawValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(RawValue::Missing, RawValue::Number)
    }
}

impl From<&serde_json::Value> for RawValue {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Number(n) => n.as_f64().map_or(RawValue::Missing, RawValue::Number),
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            _ => RawValue::Missing,
        }
    }
}

fn finite_non_sentinel(v: f64) -> Option<f64> {
    if !v.is_finite() || SENTINEL_VALUES.iter().any(|s| (v - s).abs() < f64::EPSILON) {
        None
    } else {
        Some(v)
    }
}

/// One field value for a station at a time, as produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Registry id or a lookup key (station name).
    pub station_key: String,
    pub timestamp: DateTime<Utc>,
    pub source: SourceKind,
    pub field: Field,
    pub value: RawValue,
}

impl Reading {
    pub fn new(
        station_key: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: SourceKind,
        field: Field,
        value: impl Into<RawValue>,
    ) -> Self {
        Self {
            station_key: station_key.into(),
            timestamp,
            source,
            field,
            value: value.into(),
        }
    }
}

/// Resolution of gridded files differs by family, and so does the join cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridKind {
    Satellite,
    Weather,
}

impl GridKind {
    pub fn source(&self) -> SourceKind {
        match self {
            GridKind::Satellite => SourceKind::Satellite,
            GridKind::Weather => SourceKind::WeatherModel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub latitude: f64,
    pub longitude: f64,
    pub value: f64,
}

impl GridCell {
    pub fn new(latitude: f64, longitude: f64, value: f64) -> Self {
        Self {
            latitude,
            longitude,
            value,
        }
    }
}

/// All cells decoded from one grid file.
#[derive(Debug, Clone)]
pub struct GridBatch {
    pub label: String,
    pub kind: GridKind,
    pub field: Field,
    pub timestamp: DateTime<Utc>,
    pub cells: Vec<GridCell>,
}
