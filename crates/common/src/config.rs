//! Bridge configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Location;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Opaque API token; sent as `x-api-key` when non-empty.
    #[serde(default)]
    pub api_key: String,

    /// Provider base URL (with trailing slash).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Locations to poll, one coordinator each.
    #[serde(default = "default_locations")]
    pub locations: Vec<LocationConfig>,

    /// Poll cadence and retry parameters.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Where to persist the latest snapshot per location (disabled if unset).
    #[serde(default)]
    pub snapshot_dir: Option<String>,

    /// Provider field mapping override.
    #[serde(default)]
    pub fields: Option<Vec<MetricSpec>>,
}

/// A single configured location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_location_name")]
    pub name: String,
    /// Provider identifier; defaults to `name`.
    #[serde(default)]
    pub id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationConfig {
    pub fn to_location(&self) -> Location {
        Location {
            id: self.id.clone().unwrap_or_else(|| self.name.clone()),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Polling cadence, jitter, backoff and request quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Fraction of the interval used as random ± offset for the first poll.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Upper bound on provider requests per coordinator.
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Maps one provider field to one reading metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Field name in the provider's daily payload.
    pub field: String,
    /// Metric name used in reading keys.
    pub metric: String,
    #[serde(flatten)]
    pub kind: MetricKind,
    /// Missing or mistyped required fields make the whole response malformed.
    #[serde(default)]
    pub required: bool,
}

impl MetricSpec {
    pub fn new(field: &str, metric: &str, kind: MetricKind, required: bool) -> Self {
        Self {
            field: field.to_string(),
            metric: metric.to_string(),
            kind,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricKind {
    /// Normalized to °C.
    Temperature {
        #[serde(default)]
        source_unit: TemperatureUnit,
    },
    /// Normalized to m/s.
    Speed {
        #[serde(default)]
        source_unit: SpeedUnit,
    },
    /// Millimetres.
    Precipitation,
    Percentage,
    /// Degrees; accepts a bare number or `{ "degree": n }`.
    Direction,
    /// Emits the numeric code plus a `condition` enum reading.
    WeatherCode,
    /// Emits a timestamp reading.
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[default]
    #[serde(rename = "km/h")]
    KilometersPerHour,
    #[serde(rename = "m/s")]
    MetersPerSecond,
    #[serde(rename = "mph")]
    MilesPerHour,
}

/// Field mapping for the Pleinchamp `forecasts-15d` daily payload.
pub fn default_pleinchamp_fields() -> Vec<MetricSpec> {
    use MetricKind::*;

    let celsius = || Temperature {
        source_unit: TemperatureUnit::Celsius,
    };
    let kmh = || Speed {
        source_unit: SpeedUnit::KilometersPerHour,
    };

    vec![
        MetricSpec::new("date", "date", Date, false),
        MetricSpec::new("weatherCode", "weather_code", WeatherCode, false),
        MetricSpec::new(
            "minAirTemperatureNearGround",
            "min_temperature_near_ground",
            celsius(),
            false,
        ),
        MetricSpec::new("minAirTemperature", "min_air_temperature", celsius(), true),
        MetricSpec::new("maxAirTemperature", "max_air_temperature", celsius(), true),
        MetricSpec::new("precipitationAmount", "precipitation", Precipitation, false),
        MetricSpec::new(
            "precipitationProbability",
            "precipitation_probability",
            Percentage,
            false,
        ),
        MetricSpec::new("relativeHumidity", "humidity", Percentage, false),
        MetricSpec::new("windDirection", "wind_direction", Direction, false),
        MetricSpec::new("windSpeedAt2m", "wind_speed", kmh(), false),
        MetricSpec::new("maxWindGustAt2m", "wind_gust", kmh(), false),
    ]
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://api.prod.pleinchamp.com/".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_location_name() -> String {
    "Backyard".to_string()
}

fn default_locations() -> Vec<LocationConfig> {
    Vec::new()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    1800
}

fn default_max_requests_per_hour() -> u32 {
    60
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            locations: default_locations(),
            polling: PollingConfig::default(),
            snapshot_dir: None,
            fields: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            jitter_ratio: default_jitter_ratio(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            max_requests_per_hour: default_max_requests_per_hour(),
        }
    }
}
