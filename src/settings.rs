use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::{PipelineError, Result};
use crate::models::{Field, GridKind};
use crate::utils::constants::*;
use crate::utils::BoundingBox;

/// Every tunable of the pipeline, injected from a TOML file layered under
/// `AQF_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,

    #[validate(nested)]
    pub ground: GroundSettings,

    pub weather: WeatherSettings,

    pub grid: GridSettings,

    #[validate(nested)]
    pub http: HttpSettings,

    #[validate(nested)]
    pub spatial: SpatialSettings,

    #[validate(nested)]
    pub fusion: FusionSettings,

    pub resolver: ResolverSettings,

    #[validate(nested)]
    pub forecast: ForecastSettings,

    #[validate(nested)]
    pub heuristics: HeuristicSettings,
}

impl Settings {
    /// Load settings. An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let settings: Settings = Config::builder()
            .add_source(File::from(file.as_path()).required(path.is_some()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.check()?;
        Ok(settings)
    }

    /// Field validation plus the cross-field rules `validator` cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        for (field, range) in &self.resolver.fallback_ranges {
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(PipelineError::Config(format!(
                    "Fallback range for {} is invalid: [{}, {}]",
                    field, range.min, range.max
                )));
            }
        }

        for field in &self.resolver.fallback_fields {
            if !self.resolver.fallback_ranges.contains_key(field) {
                return Err(PipelineError::Config(format!(
                    "Fallback enabled for {} but no range is configured",
                    field
                )));
            }
        }

        if self.forecast.predictors.contains(&Field::Pm25) {
            return Err(PipelineError::Config(
                "pm25 is the forecast target and cannot be a predictor".to_string(),
            ));
        }

        if let Some(bbox) = &self.spatial.bbox {
            BoundingBox::new(bbox.min_lat, bbox.max_lat, bbox.min_lon, bbox.max_lon)?;
        }

        let bands = &self.heuristics.aqi_bands;
        if bands.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::Config(
                "AQI advice bands must be strictly increasing".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GroundSettings {
    pub api_key: Option<String>,

    #[validate(length(min = 1))]
    pub base_url: String,

    #[validate(length(min = 1))]
    pub resource_id: String,

    #[validate(range(min = 1, max = 10000))]
    pub record_limit: u32,

    pub state_filter: Option<String>,

    /// Cities whose stations are registered by station discovery
    pub target_cities: Vec<String>,

    #[validate(range(min = -720, max = 840))]
    pub utc_offset_minutes: i32,
}

impl Default for GroundSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_GROUND_BASE_URL.to_string(),
            resource_id: DEFAULT_GROUND_RESOURCE_ID.to_string(),
            record_limit: DEFAULT_GROUND_RECORD_LIMIT,
            state_filter: Some("Delhi".to_string()),
            target_cities: [
                "Delhi",
                "Gurugram",
                "Noida",
                "Ghaziabad",
                "Faridabad",
                "Greater Noida",
                "Sonipat",
                "Bahadurgarh",
                "Meerut",
                "Panipat",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            utc_offset_minutes: DEFAULT_GROUND_UTC_OFFSET_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub base_url: String,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WEATHER_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub sources: Vec<GridSourceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSourceSettings {
    pub dir: PathBuf,
    pub kind: GridKind,
    pub field: Field,
    #[serde(default = "default_grid_extension")]
    pub extension: String,
    #[serde(default)]
    pub use_mmap: bool,
}

fn default_grid_extension() -> String {
    "csv".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HttpSettings {
    /// Fixed delay between consecutive upstream requests
    pub request_delay_ms: u64,

    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,

    #[validate(range(min = 1, max = 256))]
    pub max_workers: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_workers: num_cpus::get().clamp(1, 8),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SpatialSettings {
    #[validate(range(exclusive_min = 0.0, max = 10.0))]
    pub satellite_cutoff_deg: f64,

    #[validate(range(exclusive_min = 0.0, max = 10.0))]
    pub weather_cutoff_deg: f64,

    /// Explicit area of interest; defaults to the padded station extent
    pub bbox: Option<BoundingBox>,

    #[validate(range(min = 0.0, max = 45.0))]
    pub bbox_padding_deg: f64,

    #[validate(range(min = 0.0, max = 90.0))]
    pub min_plausible_max_latitude: f64,
}

impl SpatialSettings {
    pub fn cutoff_for(&self, kind: GridKind) -> f64 {
        match kind {
            GridKind::Satellite => self.satellite_cutoff_deg,
            GridKind::Weather => self.weather_cutoff_deg,
        }
    }
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            satellite_cutoff_deg: DEFAULT_SATELLITE_CUTOFF_DEG,
            weather_cutoff_deg: DEFAULT_WEATHER_CUTOFF_DEG,
            bbox: None,
            bbox_padding_deg: DEFAULT_BBOX_PADDING_DEG,
            min_plausible_max_latitude: DEFAULT_MIN_PLAUSIBLE_MAX_LATITUDE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FusionSettings {
    /// Polls of the same station closer than this are one logical reading
    #[validate(range(min = 0, max = 720))]
    pub bucket_window_minutes: i64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            bucket_window_minutes: DEFAULT_BUCKET_WINDOW_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Fields for which the fallback generator may fill gaps. Empty disables it.
    pub fallback_fields: Vec<Field>,

    /// Plausible synthetic range per field
    pub fallback_ranges: BTreeMap<Field, ValueRange>,

    /// Seed for reproducible fallback values; entropy-seeded when unset
    pub fallback_seed: Option<u64>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        // Typical urban North-India ranges; the upper ends stay below the
        // "severe" bands so generated values never trigger advisories alone.
        let fallback_ranges = [
            (Field::Pm25, ValueRange::new(20.0, 180.0)),
            (Field::Pm10, ValueRange::new(40.0, 300.0)),
            (Field::No2, ValueRange::new(10.0, 80.0)),
            (Field::So2, ValueRange::new(2.0, 30.0)),
            (Field::Co, ValueRange::new(0.3, 3.0)),
            (Field::O3, ValueRange::new(10.0, 90.0)),
            (Field::Aqi, ValueRange::new(50.0, 300.0)),
        ]
        .into_iter()
        .collect();

        Self {
            fallback_fields: Vec::new(),
            fallback_ranges,
            fallback_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ForecastSettings {
    #[validate(range(min = 2000, max = 10000))]
    pub training_window: usize,

    #[validate(range(min = 1))]
    pub min_training_rows: usize,

    #[validate(range(min = 1, max = 168))]
    pub horizon_hours: usize,

    #[validate(range(min = 0.0))]
    pub floor: f64,

    #[validate(range(min = 0.0))]
    pub diurnal_amplitude: f64,

    #[validate(range(min = 0.0, exclusive_max = 24.0))]
    pub diurnal_peak_hour: f64,

    /// Local clock the diurnal cycle follows
    #[validate(range(min = -720, max = 840))]
    pub diurnal_utc_offset_minutes: i32,

    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub confidence_decay: f64,

    #[validate(length(min = 1))]
    pub predictors: Vec<Field>,

    #[validate(range(min = 0.0))]
    pub ridge_lambda: f64,

    /// Where the disposable model artifact is written, if anywhere
    pub model_path: Option<PathBuf>,

    /// Exclusive run lock; unset means the caller guarantees serial runs
    pub lock_path: Option<PathBuf>,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            training_window: DEFAULT_TRAINING_WINDOW,
            min_training_rows: DEFAULT_MIN_TRAINING_ROWS,
            horizon_hours: DEFAULT_HORIZON_HOURS,
            floor: DEFAULT_FORECAST_FLOOR,
            diurnal_amplitude: DEFAULT_DIURNAL_AMPLITUDE,
            diurnal_peak_hour: DEFAULT_DIURNAL_PEAK_HOUR,
            diurnal_utc_offset_minutes: DEFAULT_GROUND_UTC_OFFSET_MINUTES,
            confidence_decay: DEFAULT_CONFIDENCE_DECAY,
            predictors: vec![
                Field::Pm10,
                Field::No2,
                Field::So2,
                Field::Co,
                Field::O3,
                Field::TempC,
                Field::WindSpeed10m,
                Field::WindSpeed80m,
                Field::WindDir,
                Field::PblHeight,
                Field::Aod,
            ],
            ridge_lambda: DEFAULT_RIDGE_LAMBDA,
            model_path: None,
            lock_path: None,
        }
    }
}

/// Source-attribution and advisory thresholds. These came from field
/// calibration in one city and are kept tunable.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeuristicSettings {
    /// Columns read as NO2 and SO2 when fingerprinting; satellite columns by default
    pub no2_field: Field,
    pub so2_field: Field,

    #[validate(range(min = 0.0))]
    pub industrial_so2_ratio: f64,

    #[validate(range(min = 0.0))]
    pub vehicular_no2_ratio: f64,

    #[validate(range(min = 0.0))]
    pub dust_min_pm25: f64,

    #[validate(range(min = 0.0))]
    pub dust_max_no2_ratio: f64,

    /// Which field drives health advice
    pub risk_field: Field,

    /// Upper bounds of Good / Moderate / Poor / Very Poor / Severe
    #[validate(length(equal = 5))]
    pub aqi_bands: Vec<f64>,
}

impl Default for HeuristicSettings {
    fn default() -> Self {
        Self {
            no2_field: Field::No2Sat,
            so2_field: Field::So2Sat,
            industrial_so2_ratio: 0.15,
            vehicular_no2_ratio: 0.35,
            dust_min_pm25: 150.0,
            dust_max_no2_ratio: 0.2,
            risk_field: Field::Aqi,
            aqi_bands: vec![50.0, 100.0, 200.0, 300.0, 400.0],
        }
    }
}
