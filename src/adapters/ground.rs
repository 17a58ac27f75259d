//! Ground sensor network feed (data.gov.in real-time AQI resource).
//!
//! The feed returns one record per (station, pollutant) with string values
//! and a local-time `last_update` stamp.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;

use super::{AdapterOutput, HttpFetcher, SourceAdapter};
use crate::error::{PipelineError, Result};
use crate::models::{Field, RawValue, Reading, SourceKind, Station, StationRegistry};
use crate::processors::report::{SkipLog, SkipReason};
use crate::settings::{GroundSettings, HttpSettings};
use crate::utils::constants::GROUND_TIMESTAMP_FORMAT;

#[derive(Debug, Deserialize)]
struct GroundResponse {
    #[serde(default)]
    records: Vec<GroundRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroundRecord {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub latitude: Option<RawValue>,
    #[serde(default)]
    pub longitude: Option<RawValue>,
    #[serde(default)]
    pub pollutant_id: Option<String>,
    #[serde(default)]
    pub avg_value: Option<RawValue>,
}

/// Pollutant label as published by the feed, to the tracked field.
pub fn map_pollutant(label: &str) -> Option<Field> {
    match label.trim().to_uppercase().as_str() {
        "PM2.5" | "PM 2.5" => Some(Field::Pm25),
        "PM10" | "PM 10" => Some(Field::Pm10),
        "NO2" | "NITROGEN DIOXIDE" => Some(Field::No2),
        "SO2" | "SULFUR DIOXIDE" => Some(Field::So2),
        "CO" => Some(Field::Co),
        "OZONE" | "O3" => Some(Field::O3),
        "AQI" => Some(Field::Aqi),
        _ => None,
    }
}

/// Parse a `last_update` stamp given in a fixed local offset.
pub fn parse_local_timestamp(raw: &str, utc_offset_minutes: i32) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), GROUND_TIMESTAMP_FORMAT)?;
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
        PipelineError::Config(format!("UTC offset {} minutes is out of range", utc_offset_minutes))
    })?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| PipelineError::MalformedRecord(format!("ambiguous local time '{}'", raw)))
}

/// Registry id for a discovered station: two-letter city code plus the
/// first comma-separated segment of the station name, at most 50 chars.
pub fn derive_station_id(city: &str, station_name: &str) -> String {
    let city_code: String = city.chars().take(2).collect::<String>().to_uppercase();
    let first_segment = station_name.split(',').next().unwrap_or_default().replace(' ', "_");
    format!("{}-{}", city_code, first_segment).chars().take(50).collect()
}

/// Turn feed records into readings keyed by station name.
pub fn parse_records(records: &[GroundRecord], utc_offset_minutes: i32, skips: &mut SkipLog) -> Vec<Reading> {
    let mut readings = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        let Some(station) = record.station.as_deref().filter(|s| !s.trim().is_empty()) else {
            skips.record(SkipReason::MalformedRecord, format!("ground record {}", index), "missing station name");
            continue;
        };

        let Some(field) = record.pollutant_id.as_deref().and_then(map_pollutant) else {
            tracing::trace!(station, pollutant = ?record.pollutant_id, "Untracked pollutant");
            continue;
        };

        let timestamp = match record
            .last_update
            .as_deref()
            .ok_or_else(|| PipelineError::MalformedRecord("missing last_update".to_string()))
            .and_then(|raw| parse_local_timestamp(raw, utc_offset_minutes))
        {
            Ok(ts) => ts,
            Err(e) => {
                skips.record(SkipReason::MalformedRecord, station, e.to_string());
                continue;
            }
        };

        readings.push(Reading::new(
            station.trim(),
            timestamp,
            SourceKind::GroundSensor,
            field,
            record.avg_value.clone().unwrap_or(RawValue::Missing),
        ));
    }

    readings
}

/// Stations in the target cities that carry usable coordinates.
pub fn discover_stations(records: &[GroundRecord], target_cities: &[String]) -> Vec<Station> {
    let mut seen = BTreeSet::new();
    let mut stations = Vec::new();

    for record in records {
        let (Some(city), Some(name)) = (record.city.as_deref(), record.station.as_deref()) else {
            continue;
        };
        if !target_cities.iter().any(|c| c == city) {
            continue;
        }

        let id = derive_station_id(city, name);
        if !seen.insert(id.clone()) {
            continue;
        }

        let coordinates = (
            record.latitude.as_ref().and_then(RawValue::as_number),
            record.longitude.as_ref().and_then(RawValue::as_number),
        );
        if let (Some(lat), Some(lon)) = coordinates {
            let station = Station::new(id, name, lat, lon).with_city(city);
            if station.has_valid_coordinates() {
                stations.push(station);
            }
        }
    }

    stations
}

pub struct GroundSensorAdapter {
    settings: GroundSettings,
    fetcher: HttpFetcher,
}

impl GroundSensorAdapter {
    pub fn new(settings: &GroundSettings, http: &HttpSettings) -> Result<Self> {
        Ok(Self {
            settings: settings.clone(),
            fetcher: HttpFetcher::new("ground", http)?,
        })
    }

    fn fetch_records(&self, filter: Option<(&str, &str)>) -> Result<Vec<GroundRecord>> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| PipelineError::source_unavailable("ground", "no API key configured"))?;

        let filter = filter.map(|(name, value)| (format!("filters[{}]", name), value.to_string()));

        let mut query = vec![
            ("api-key", api_key.to_string()),
            ("format", "json".to_string()),
            ("limit", self.settings.record_limit.to_string()),
        ];
        if let Some((key, value)) = &filter {
            query.push((key.as_str(), value.clone()));
        }

        let url = format!("{}/{}", self.settings.base_url.trim_end_matches('/'), self.settings.resource_id);
        let response: GroundResponse = self.fetcher.get_json(&url, &query)?;
        tracing::info!(records = response.records.len(), "Fetched ground sensor records");
        Ok(response.records)
    }

    /// Station discovery across the country-wide feed.
    pub fn discover(&self) -> Result<Vec<Station>> {
        let records = self.fetch_records(Some(("country", "India")))?;
        let stations = discover_stations(&records, &self.settings.target_cities);
        tracing::info!(found = stations.len(), "Discovered stations in target cities");
        Ok(stations)
    }
}

impl SourceAdapter for GroundSensorAdapter {
    fn name(&self) -> &str {
        self.fetcher.source_name()
    }

    fn collect(&self, _registry: &StationRegistry, skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
        let filter = self.settings.state_filter.as_deref().map(|state| ("state", state));
        let records = self.fetch_records(filter)?;
        let readings = parse_records(&records, self.settings.utc_offset_minutes, skips);
        Ok(vec![AdapterOutput::Readings(readings)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "records": [
            {"country": "India", "state": "Delhi", "city": "Delhi",
             "station": "Anand Vihar, Delhi - DPCC", "last_update": "03-11-2024 15:00:00",
             "latitude": "28.647622", "longitude": "77.315809",
             "pollutant_id": "PM2.5", "avg_value": "312"},
            {"country": "India", "state": "Delhi", "city": "Delhi",
             "station": "Anand Vihar, Delhi - DPCC", "last_update": "03-11-2024 15:00:00",
             "latitude": "28.647622", "longitude": "77.315809",
             "pollutant_id": "NO2", "avg_value": "NA"},
            {"country": "India", "state": "Delhi", "city": "Delhi",
             "station": "Anand Vihar, Delhi - DPCC", "last_update": "03-11-2024 15:00:00",
             "pollutant_id": "NH3", "avg_value": "7"},
            {"country": "India", "state": "Haryana", "city": "Gurugram",
             "station": "Sector-51, Gurugram - HSPCB", "last_update": "bad",
             "latitude": "NA", "longitude": "NA",
             "pollutant_id": "OZONE", "avg_value": "41"}
        ]
    }"#;

    fn records() -> Vec<GroundRecord> {
        serde_json::from_str::<GroundResponse>(SAMPLE).unwrap().records
    }

    #[test]
    fn test_pollutant_mapping() {
        assert_eq!(map_pollutant("PM 2.5"), Some(Field::Pm25));
        assert_eq!(map_pollutant("pm10"), Some(Field::Pm10));
        assert_eq!(map_pollutant("Sulfur Dioxide"), Some(Field::So2));
        assert_eq!(map_pollutant("OZONE"), Some(Field::O3));
        assert_eq!(map_pollutant("NH3"), None);
    }

    #[test]
    fn test_local_timestamp_converted_to_utc() {
        let ts = parse_local_timestamp("03-11-2024 15:00:00", 330).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 11, 3, 9, 30, 0).unwrap());
        assert!(parse_local_timestamp("2024-11-03", 330).is_err());
    }

    #[test]
    fn test_parse_records_keeps_null_markers_and_skips_bad_rows() {
        let mut skips = SkipLog::default();
        let readings = parse_records(&records(), 330, &mut skips);

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].station_key, "Anand Vihar, Delhi - DPCC");
        assert_eq!(readings[0].field, Field::Pm25);
        assert_eq!(readings[0].value.as_number(), Some(312.0));
        assert_eq!(readings[1].field, Field::No2);
        assert!(readings[1].value.is_absent());

        assert_eq!(skips.get(SkipReason::MalformedRecord), 1);
    }

    #[test]
    fn test_discovery_derives_ids_and_requires_coordinates() {
        let cities = vec!["Delhi".to_string(), "Gurugram".to_string()];
        let stations = discover_stations(&records(), &cities);

        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, "DE-Anand_Vihar");
        assert_eq!(stations[0].city.as_deref(), Some("Delhi"));
        assert!((stations[0].latitude - 28.647622).abs() < 1e-9);
    }

    #[test]
    fn test_station_id_is_capped() {
        let id = derive_station_id("Noida", &"X".repeat(80));
        assert_eq!(id.chars().count(), 50);
        assert!(id.starts_with("NO-XXX"));
    }

    #[test]
    fn test_missing_api_key_is_source_unavailable() {
        let adapter = GroundSensorAdapter::new(&GroundSettings::default(), &HttpSettings::default()).unwrap();
        let err = adapter
            .collect(&StationRegistry::default(), &mut SkipLog::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
