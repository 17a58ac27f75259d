//! Point forecasts from the Open-Meteo API, one request per located station.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{AdapterOutput, HttpFetcher, SourceAdapter};
use crate::error::{PipelineError, Result};
use crate::models::{Field, RawValue, Reading, SourceKind, Station, StationRegistry};
use crate::processors::report::SkipLog;
use crate::processors::task_runner::TaskRunner;
use crate::settings::{HttpSettings, WeatherSettings};

const CURRENT_VARIABLES: &str = "temperature_2m,wind_speed_10m,wind_direction_10m";
const HOURLY_VARIABLES: &str = "wind_speed_80m,boundary_layer_height";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Deserialize)]
pub struct WeatherResponse {
    #[serde(default)]
    current: Option<CurrentBlock>,
    #[serde(default)]
    hourly: Option<HourlyBlock>,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    time: String,
    #[serde(default)]
    temperature_2m: Option<RawValue>,
    #[serde(default)]
    wind_speed_10m: Option<RawValue>,
    #[serde(default)]
    wind_direction_10m: Option<RawValue>,
}

#[derive(Debug, Default, Deserialize)]
struct HourlyBlock {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    wind_speed_80m: Vec<Option<f64>>,
    #[serde(default)]
    boundary_layer_height: Vec<Option<f64>>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Readings for one station from one API response. Times are UTC.
pub fn parse_response(station_id: &str, response: &WeatherResponse) -> Result<Vec<Reading>> {
    let current = response.current.as_ref().ok_or_else(|| {
        PipelineError::MalformedRecord(format!("weather response for {} has no current block", station_id))
    })?;
    let timestamp = parse_time(&current.time)?;

    let reading = |field: Field, value: Option<RawValue>| {
        Reading::new(
            station_id,
            timestamp,
            SourceKind::WeatherModel,
            field,
            value.unwrap_or(RawValue::Missing),
        )
    };

    let mut readings = vec![
        reading(Field::TempC, current.temperature_2m.clone()),
        reading(Field::WindSpeed10m, current.wind_speed_10m.clone()),
        reading(Field::WindDir, current.wind_direction_10m.clone()),
    ];

    // hourly series are indexed by the hour containing the current time
    if let Some(hourly) = &response.hourly {
        let slot = format!("{}:00", timestamp.format("%Y-%m-%dT%H"));
        if let Some(index) = hourly.time.iter().position(|t| *t == slot) {
            let at = |series: &[Option<f64>]| series.get(index).copied().flatten();
            readings.push(reading(Field::WindSpeed80m, at(&hourly.wind_speed_80m).map(RawValue::Number)));
            readings.push(reading(Field::PblHeight, at(&hourly.boundary_layer_height).map(RawValue::Number)));
        }
    }

    Ok(readings)
}

pub struct WeatherModelAdapter {
    settings: WeatherSettings,
    fetcher: HttpFetcher,
    runner: TaskRunner,
}

impl WeatherModelAdapter {
    pub fn new(settings: &WeatherSettings, http: &HttpSettings) -> Result<Self> {
        Ok(Self {
            settings: settings.clone(),
            fetcher: HttpFetcher::new("weather", http)?,
            runner: TaskRunner::new(http.max_workers),
        })
    }

    fn fetch_station(&self, station: &Station) -> Result<Vec<Reading>> {
        let query = [
            ("latitude", station.latitude.to_string()),
            ("longitude", station.longitude.to_string()),
            ("current", CURRENT_VARIABLES.to_string()),
            ("hourly", HOURLY_VARIABLES.to_string()),
            ("forecast_days", "1".to_string()),
            ("timezone", "UTC".to_string()),
        ];
        let response: WeatherResponse = self.fetcher.get_json(&self.settings.base_url, &query)?;
        parse_response(&station.id, &response)
    }
}

impl SourceAdapter for WeatherModelAdapter {
    fn name(&self) -> &str {
        self.fetcher.source_name()
    }

    fn collect(&self, registry: &StationRegistry, skips: &mut SkipLog) -> Result<Vec<AdapterOutput>> {
        let stations: Vec<Station> = registry.located().cloned().collect();
        if stations.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self.runner.run(
            stations,
            || Ok(()),
            |_, station| self.fetch_station(station),
            None,
        );

        let attempted = outcomes.len();
        let mut readings = Vec::new();
        let mut failed = 0;
        for outcome in outcomes {
            match outcome.result {
                Ok(batch) => readings.extend(batch),
                Err(e) => {
                    failed += 1;
                    skips.record_error(&outcome.item.id, &e);
                }
            }
        }

        if failed == attempted {
            return Err(PipelineError::source_unavailable(
                "weather",
                format!("all {} station requests failed", attempted),
            ));
        }

        tracing::info!(stations = attempted - failed, readings = readings.len(), "Fetched weather");
        Ok(vec![AdapterOutput::Readings(readings)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "latitude": 28.625, "longitude": 77.125,
        "current": {"time": "2024-11-03T09:45", "interval": 900,
                    "temperature_2m": 24.3, "wind_speed_10m": 4.7, "wind_direction_10m": null},
        "hourly": {"time": ["2024-11-03T08:00", "2024-11-03T09:00", "2024-11-03T10:00"],
                   "wind_speed_80m": [9.1, 10.4, 11.0],
                   "boundary_layer_height": [310.0, null, 520.0]}
    }"#;

    #[test]
    fn test_parse_response() {
        let response: WeatherResponse = serde_json::from_str(SAMPLE).unwrap();
        let readings = parse_response("DE-ITO", &response).unwrap();

        let value = |field: Field| {
            readings
                .iter()
                .find(|r| r.field == field)
                .map(|r| r.value.as_number())
                .unwrap()
        };

        assert_eq!(readings.len(), 5);
        assert!(readings.iter().all(|r| r.station_key == "DE-ITO"));
        assert_eq!(readings[0].timestamp, Utc.with_ymd_and_hms(2024, 11, 3, 9, 45, 0).unwrap());
        assert_eq!(value(Field::TempC), Some(24.3));
        assert_eq!(value(Field::WindDir), None);
        assert_eq!(value(Field::WindSpeed80m), Some(10.4));
        assert_eq!(value(Field::PblHeight), None);
    }

    #[test]
    fn test_missing_current_block_is_malformed() {
        let response: WeatherResponse = serde_json::from_str(r#"{"hourly": {}}"#).unwrap();
        let err = parse_response("S1", &response).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord(_)));
    }

    #[test]
    fn test_unreachable_api_is_source_unavailable() {
        let settings = WeatherSettings {
            base_url: "http://127.0.0.1:9/v1/forecast".to_string(),
        };
        let http = HttpSettings {
            request_delay_ms: 0,
            request_timeout_secs: 2,
            max_workers: 2,
        };
        let adapter = WeatherModelAdapter::new(&settings, &http).unwrap();
        let registry = StationRegistry::new(vec![Station::new("S1", "One", 28.7, 77.1)]);

        let mut skips = SkipLog::default();
        let err = adapter.collect(&registry, &mut skips).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        assert_eq!(skips.total(), 1);
    }
}
