use serde::Serialize;
use std::fmt;

use crate::models::Measurement;
use crate::settings::HeuristicSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    Poor,
    VeryPoor,
    Severe,
    Hazardous,
}

impl AqiCategory {
    const BANDED: [AqiCategory; 5] = [
        AqiCategory::Good,
        AqiCategory::Moderate,
        AqiCategory::Poor,
        AqiCategory::VeryPoor,
        AqiCategory::Severe,
    ];

    /// Band lookup; a value equal to a band's upper bound stays in that band.
    pub fn from_value(value: f64, bands: &[f64]) -> Self {
        bands
            .iter()
            .zip(Self::BANDED)
            .find(|(upper, _)| value <= **upper)
            .map(|(_, category)| category)
            .unwrap_or(AqiCategory::Hazardous)
    }

    pub fn advice(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Air quality is satisfactory. Enjoy the outdoors.",
            AqiCategory::Moderate => "Unusually sensitive people should reduce exertion.",
            AqiCategory::Poor => "Breathing discomfort for sensitive people.",
            AqiCategory::VeryPoor => "Wear an N95 mask. Sensitive groups should stay inside.",
            AqiCategory::Severe => "Healthy people should limit outdoor activity.",
            AqiCategory::Hazardous => "Avoid all outdoor exertion and keep windows shut.",
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::Poor => "Poor",
            AqiCategory::VeryPoor => "Very Poor",
            AqiCategory::Severe => "Severe",
            AqiCategory::Hazardous => "Hazardous",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAdvice {
    pub value: f64,
    pub category: AqiCategory,
    pub message: &'static str,
}

/// Advice for a row, driven by the configured risk field. `None` when the
/// row has no value for that field.
pub fn assess(measurement: &Measurement, heuristics: &HeuristicSettings) -> Option<HealthAdvice> {
    let value = measurement.get(heuristics.risk_field)?;
    let category = AqiCategory::from_value(value, &heuristics.aqi_bands);
    Some(HealthAdvice {
        value,
        category,
        message: category.advice(),
    })
}
