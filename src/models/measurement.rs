use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

/// One tracked slot of a canonical measurement row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Pm25,
    Pm10,
    No2,
    So2,
    Co,
    O3,
    Aqi,
    TempC,
    WindSpeed10m,
    WindSpeed80m,
    WindDir,
    PblHeight,
    Aod,
    No2Sat,
    So2Sat,
}

impl Field {
    pub const ALL: [Field; 15] = [
        Field::Pm25,
        Field::Pm10,
        Field::No2,
        Field::So2,
        Field::Co,
        Field::O3,
        Field::Aqi,
        Field::TempC,
        Field::WindSpeed10m,
        Field::WindSpeed80m,
        Field::WindDir,
        Field::PblHeight,
        Field::Aod,
        Field::No2Sat,
        Field::So2Sat,
    ];

    /// Column name in the relational store and in exports.
    pub fn column(&self) -> &'static str {
        match self {
            Field::Pm25 => "pm25",
            Field::Pm10 => "pm10",
            Field::No2 => "no2",
            Field::So2 => "so2",
            Field::Co => "co",
            Field::O3 => "o3",
            Field::Aqi => "aqi",
            Field::TempC => "temp_c",
            Field::WindSpeed10m => "wind_speed_10m",
            Field::WindSpeed80m => "wind_speed_80m",
            Field::WindDir => "wind_dir",
            Field::PblHeight => "pbl_height",
            Field::Aod => "aod",
            Field::No2Sat => "no2_sat",
            Field::So2Sat => "so2_sat",
        }
    }

    pub fn units(&self) -> &'static str {
        match self {
            Field::Pm25 | Field::Pm10 | Field::No2 | Field::So2 | Field::O3 => "µg/m³",
            Field::Co => "mg/m³",
            Field::Aqi | Field::Aod => "",
            Field::TempC => "°C",
            Field::WindSpeed10m | Field::WindSpeed80m => "km/h",
            Field::WindDir => "°",
            Field::PblHeight => "m",
            Field::No2Sat | Field::So2Sat => "µmol/m²",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for Field {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase();
        Field::ALL
            .into_iter()
            .find(|f| f.column() == needle)
            .ok_or_else(|| PipelineError::Config(format!("Unknown measurement field: '{}'", s)))
    }
}

/// Partial write for one (station, timestamp) key.
///
/// `observed` values come from real sources and replace whatever is stored.
/// `generated` values come from the fallback generator and only fill empty
/// slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPatch {
    pub observed: BTreeMap<Field, f64>,
    pub generated: BTreeMap<Field, f64>,
}

impl MeasurementPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(mut self, field: Field, value: f64) -> Self {
        self.observed.insert(field, value);
        self
    }

    pub fn generated(mut self, field: Field, value: f64) -> Self {
        self.generated.insert(field, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty() && self.generated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observed.len() + self.generated.len()
    }
}

/// Canonical, persisted row for a station at a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: Option<i64>,
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<Field, f64>,
    /// Slots whose current value came from the fallback generator.
    pub generated_fields: BTreeSet<Field>,
}

impl Measurement {
    pub fn new(station_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            station_id: station_id.into(),
            timestamp,
            values: BTreeMap::new(),
            generated_fields: BTreeSet::new(),
        }
    }

    pub fn with_value(mut self, field: Field, value: f64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        self.values.get(&field).copied()
    }

    pub fn is_generated(&self, field: Field) -> bool {
        self.generated_fields.contains(&field)
    }

    /// Coalesce-on-write merge. Returns the number of slots that changed.
    pub fn merge(&mut self, patch: &MeasurementPatch) -> usize {
        let mut changed = 0;

        for (field, value) in &patch.observed {
            if !value.is_finite() {
                continue;
            }
            if self.values.get(field) != Some(value) || self.generated_fields.contains(field) {
                changed += 1;
            }
            self.values.insert(*field, *value);
            self.generated_fields.remove(field);
        }

        for (field, value) in &patch.generated {
            if !value.is_finite() || self.values.contains_key(field) {
                continue;
            }
            self.values.insert(*field, *value);
            self.generated_fields.insert(*field);
            changed += 1;
        }

        changed
    }

    /// Feature vector for the given predictor columns; missing slots become 0.0.
    pub fn feature_vector(&self, predictors: &[Field]) -> Vec<f64> {
        predictors
            .iter()
            .map(|f| self.get(*f).unwrap_or(0.0))
            .collect()
    }
}
