/// Text markers upstreams use for "no reading"
pub const NULL_MARKERS: &[&str] = &["", "NA", "N/A", "None", "null", "-", "--"];

/// Numeric sentinels upstreams use for "no reading"
pub const SENTINEL_VALUES: &[f64] = &[-999.0, -9999.0];

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "aq-fusion.toml";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "AQF";

/// Spatial join defaults (degrees)
pub const DEFAULT_SATELLITE_CUTOFF_DEG: f64 = 0.1;
pub const DEFAULT_WEATHER_CUTOFF_DEG: f64 = 0.05;
pub const DEFAULT_BBOX_PADDING_DEG: f64 = 0.5;
/// Grids whose largest latitude is below this look like scan angles
pub const DEFAULT_MIN_PLAUSIBLE_MAX_LATITUDE: f64 = 5.0;

/// Fusion defaults
pub const DEFAULT_BUCKET_WINDOW_MINUTES: i64 = 30;

/// Forecast defaults
pub const DEFAULT_TRAINING_WINDOW: usize = 5000;
pub const DEFAULT_MIN_TRAINING_ROWS: usize = 10;
pub const DEFAULT_HORIZON_HOURS: usize = 48;
pub const DEFAULT_FORECAST_FLOOR: f64 = 5.0;
pub const DEFAULT_DIURNAL_AMPLITUDE: f64 = 15.0;
pub const DEFAULT_DIURNAL_PEAK_HOUR: f64 = 2.0;
pub const DEFAULT_CONFIDENCE_DECAY: f64 = 0.99;
pub const DEFAULT_RIDGE_LAMBDA: f64 = 1e-6;
pub const MIN_CONFIDENCE: f64 = 0.05;
pub const MAX_CONFIDENCE: f64 = 0.99;

/// Upstream defaults
pub const DEFAULT_GROUND_BASE_URL: &str = "https://api.data.gov.in/resource";
pub const DEFAULT_GROUND_RESOURCE_ID: &str = "3b01bcb8-0b14-4abf-b6f2-c1bfd384ba69";
pub const DEFAULT_GROUND_RECORD_LIMIT: u32 = 1000;
/// data.gov.in timestamps are published in IST
pub const DEFAULT_GROUND_UTC_OFFSET_MINUTES: i32 = 330;
pub const GROUND_TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";
pub const DEFAULT_WEATHER_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Report detail retention
pub const MAX_REPORTED_SKIPS: usize = 50;

/// Export defaults
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10000;

/// Parquet compression options
pub const COMPRESSION_SNAPPY: &str = "snappy";
pub const COMPRESSION_GZIP: &str = "gzip";
pub const COMPRESSION_LZ4: &str = "lz4";
pub const COMPRESSION_ZSTD: &str = "zstd";
pub const COMPRESSION_NONE: &str = "none";
