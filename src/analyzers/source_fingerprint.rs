use serde::Serialize;
use std::fmt;

use crate::models::{Field, Measurement};
use crate::settings::HeuristicSettings;

/// Dominant emission source suggested by pollutant ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LikelySource {
    IndustrialPlume,
    VehicularTraffic,
    DustOrBiomass,
    UrbanMix,
    Unknown,
}

impl fmt::Display for LikelySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LikelySource::IndustrialPlume => "industrial plume",
            LikelySource::VehicularTraffic => "vehicular traffic",
            LikelySource::DustOrBiomass => "dust or biomass burning",
            LikelySource::UrbanMix => "urban mix",
            LikelySource::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Pollutant ratios against PM2.5 for one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fingerprint {
    pub no2_ratio: f64,
    pub so2_ratio: f64,
    pub likely_source: LikelySource,
}

/// Classify a row by its NO2/PM2.5 and SO2/PM2.5 ratios, reading the gas
/// columns named in `heuristics`. Rules apply in order: industrial,
/// vehicular, dust, urban mix. Without a positive PM2.5
/// there is nothing to compare against.
pub fn classify(measurement: &Measurement, heuristics: &HeuristicSettings) -> Fingerprint {
    let pm25 = match measurement.get(Field::Pm25) {
        Some(v) if v > 0.0 => v,
        _ => {
            return Fingerprint {
                no2_ratio: 0.0,
                so2_ratio: 0.0,
                likely_source: LikelySource::Unknown,
            }
        }
    };

    let no2_ratio = measurement.get(heuristics.no2_field).unwrap_or(0.0) / pm25;
    let so2_ratio = measurement.get(heuristics.so2_field).unwrap_or(0.0) / pm25;

    let likely_source = if so2_ratio > heuristics.industrial_so2_ratio {
        LikelySource::IndustrialPlume
    } else if no2_ratio > heuristics.vehicular_no2_ratio {
        LikelySource::VehicularTraffic
    } else if pm25 > heuristics.dust_min_pm25 && no2_ratio < heuristics.dust_max_no2_ratio {
        LikelySource::DustOrBiomass
    } else {
        LikelySource::UrbanMix
    };

    Fingerprint {
        no2_ratio,
        so2_ratio,
        likely_source,
    }
}
