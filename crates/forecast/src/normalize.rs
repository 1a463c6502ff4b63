//! Provider payload → reading snapshot.
//!
//! Pure and deterministic: the same payload, `fetched_at` and sequence give
//! the same snapshot. Which provider fields become which readings is driven
//! by a list of [`MetricSpec`]s, so schema changes stay out of the core.

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use common::config::{default_pleinchamp_fields, MetricKind, MetricSpec, SpeedUnit, TemperatureUnit};
use common::{FetchError, ForecastSnapshot, Reading, ReadingKey, ReadingValue};
use pleinchamp_client::{RawDay, RawPayload};
use serde_json::Value;
use tracing::debug;

pub const FORECAST_LENGTH_METRIC: &str = "forecast_length";
pub const CONDITION_METRIC: &str = "condition";

/// Field-mapping driven normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    fields: Vec<MetricSpec>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(default_pleinchamp_fields())
    }
}

impl Normalizer {
    pub fn new(fields: Vec<MetricSpec>) -> Self {
        Self { fields }
    }

    pub fn normalize(
        &self,
        payload: &RawPayload,
        location_id: &str,
        fetched_at: DateTime<Utc>,
        sequence: u64,
    ) -> Result<ForecastSnapshot, FetchError> {
        let days = payload
            .forecast
            .as_ref()
            .ok_or_else(|| FetchError::malformed("payload has no `forecast` member"))?
            .ordered()?;

        if days.is_empty() {
            return Err(FetchError::malformed("payload contains no forecast days"));
        }

        let mut readings = Vec::with_capacity(1 + days.len() * self.fields.len());
        readings.push(Reading {
            key: ReadingKey::for_horizon(FORECAST_LENGTH_METRIC, "now"),
            value: ReadingValue::Numeric(days.len() as f64),
            unit: "d".into(),
            valid_at: fetched_at,
            fetched_at,
        });

        for (index, day) in days {
            let horizon = format!("+{index}d");
            let valid_at = self.valid_at(day, index, fetched_at);

            for spec in &self.fields {
                let Some(raw) = day.get(&spec.field) else {
                    if spec.required {
                        return Err(FetchError::malformed(format!(
                            "day {index}: missing required field `{}`",
                            spec.field
                        )));
                    }
                    continue;
                };

                match convert(&spec.kind, raw) {
                    Ok(values) => {
                        for (metric_override, value, unit) in values {
                            let metric: &str = match metric_override {
                                Some(m) => m,
                                None => &spec.metric,
                            };
                            readings.push(Reading {
                                key: ReadingKey::for_horizon(metric, &horizon),
                                value,
                                unit: unit.to_string(),
                                valid_at,
                                fetched_at,
                            });
                        }
                    }
                    Err(reason) if spec.required => {
                        return Err(FetchError::malformed(format!(
                            "day {index}: field `{}` {reason}",
                            spec.field
                        )));
                    }
                    Err(reason) => {
                        debug!("Skipping day {} field `{}`: {}", index, spec.field, reason);
                    }
                }
            }
        }

        Ok(ForecastSnapshot::new(location_id, sequence, fetched_at, readings))
    }

    /// The day's own date when present and parseable, otherwise
    /// midnight UTC of `fetched_at` plus `index` days.
    fn valid_at(&self, day: &RawDay, index: u32, fetched_at: DateTime<Utc>) -> DateTime<Utc> {
        let from_payload = self
            .fields
            .iter()
            .find(|s| s.kind == MetricKind::Date)
            .and_then(|s| day.get(&s.field))
            .and_then(Value::as_str)
            .and_then(parse_date);

        from_payload.unwrap_or_else(|| {
            let midnight = fetched_at
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive))
                .unwrap_or(fetched_at);
            midnight + ChronoDuration::days(i64::from(index))
        })
    }
}

/// Problems with a field mapping that would make two readings share a key.
/// Empty when the mapping is usable.
pub fn mapping_issues(fields: &[MetricSpec]) -> Vec<String> {
    let mut issues = Vec::new();
    let mut emitted: HashSet<&str> = HashSet::new();
    emitted.insert(FORECAST_LENGTH_METRIC);

    let mut weather_codes = 0;
    for spec in fields {
        if spec.metric.trim().is_empty() {
            issues.push(format!("fields: field {:?} has an empty metric", spec.field));
        }
        if spec.metric.contains('@') {
            issues.push(format!("fields: metric {:?} must not contain '@'", spec.metric));
        }

        let mut metrics = vec![spec.metric.as_str()];
        if spec.kind == MetricKind::WeatherCode {
            weather_codes += 1;
            metrics.push(CONDITION_METRIC);
        }
        for metric in metrics {
            if !emitted.insert(metric) {
                issues.push(format!("fields: metric {metric:?} is emitted more than once"));
            }
        }
    }

    if weather_codes > 1 {
        issues.push(format!(
            "fields: {weather_codes} weather_code fields; at most one is allowed"
        ));
    }
    issues
}

type Converted = Vec<(Option<&'static str>, ReadingValue, &'static str)>;

fn convert(kind: &MetricKind, raw: &Value) -> Result<Converted, String> {
    let converted = match kind {
        MetricKind::Temperature { source_unit } => {
            let v = number(raw)?;
            let celsius = match source_unit {
                TemperatureUnit::Celsius => v,
                TemperatureUnit::Fahrenheit => round2((v - 32.0) * 5.0 / 9.0),
            };
            vec![(None, ReadingValue::Numeric(celsius), "°C")]
        }
        MetricKind::Speed { source_unit } => {
            let v = number(raw)?;
            let mps = match source_unit {
                SpeedUnit::MetersPerSecond => v,
                SpeedUnit::KilometersPerHour => round2(v / 3.6),
                SpeedUnit::MilesPerHour => round2(v * 0.44704),
            };
            vec![(None, ReadingValue::Numeric(mps), "m/s")]
        }
        MetricKind::Precipitation => vec![(None, ReadingValue::Numeric(number(raw)?), "mm")],
        MetricKind::Percentage => vec![(None, ReadingValue::Numeric(number(raw)?), "%")],
        MetricKind::Direction => {
            let degrees = match raw {
                Value::Object(obj) => obj
                    .get("degree")
                    .ok_or_else(|| "has no `degree` member".to_string())
                    .and_then(number)?,
                other => number(other)?,
            };
            vec![(None, ReadingValue::Numeric(degrees.rem_euclid(360.0)), "°")]
        }
        MetricKind::WeatherCode => {
            let code = number(raw)?;
            if code.fract() != 0.0 {
                return Err(format!("is not an integer code ({code})"));
            }
            let condition = condition_for_code(code as i64);
            vec![
                (None, ReadingValue::Numeric(code), ""),
                (
                    Some(CONDITION_METRIC),
                    ReadingValue::Enum(condition.to_string()),
                    "",
                ),
            ]
        }
        MetricKind::Date => {
            let raw_date = raw.as_str().ok_or_else(|| "is not a string".to_string())?;
            let ts = parse_date(raw_date).ok_or_else(|| format!("is not a date ({raw_date:?})"))?;
            vec![(None, ReadingValue::Timestamp(ts), "")]
        }
    };
    Ok(converted)
}

fn number(raw: &Value) -> Result<f64, String> {
    let v = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("is not a number ({raw})"))?;

    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("is not finite ({v})"))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (UTC), or `YYYY-MM-DD` (midnight UTC).
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Provider weather code → condition name. Codes above 100 are the night
/// variants of the same condition.
pub fn condition_for_code(code: i64) -> &'static str {
    match code {
        1 => "sunny",
        101 => "clear-night",
        2 | 3 | 102 | 103 => "partlycloudy",
        4 | 104 => "cloudy",
        5 | 8 | 13 | 15 | 105 | 108 | 113 | 115 => "rainy",
        6 | 10 | 106 | 110 => "snowy-rainy",
        7 | 9 | 107 | 109 => "snowy",
        11 | 12 | 111 | 112 => "fog",
        14 | 114 => "lightning",
        16 | 116 => "exceptional",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ErrorKind;
    use pleinchamp_client::parse_payload;

    const SAMPLE: &str = r#"{
        "forecast": [
            {
                "date": "2026-06-12",
                "weatherCode": 2,
                "minAirTemperatureNearGround": 9.4,
                "minAirTemperature": 11.0,
                "maxAirTemperature": 24.5,
                "precipitationAmount": 0.4,
                "precipitationProbability": 20,
                "relativeHumidity": 64,
                "windDirection": {"degree": 225, "label": "SW"},
                "windSpeedAt2m": 18,
                "maxWindGustAt2m": 36,
                "sunshineDuration": 7.5
            },
            {
                "date": "2026-06-13T00:00:00Z",
                "weatherCode": 105,
                "minAirTemperature": 12.0,
                "maxAirTemperature": 19.0,
                "windDirection": 370
            }
        ]
    }"#;

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-12T08:00:00Z")
            .expect("valid ts")
            .with_timezone(&Utc)
    }

    fn normalize(body: &str) -> Result<ForecastSnapshot, FetchError> {
        let payload = parse_payload(body).expect("payload should parse");
        Normalizer::default().normalize(&payload, "backyard", fetched_at(), 1)
    }

    fn celsius() -> MetricKind {
        MetricKind::Temperature {
            source_unit: TemperatureUnit::Celsius,
        }
    }

    #[test]
    fn test_sample_payload_readings() {
        let snap = normalize(SAMPLE).expect("sample should normalize");

        assert_eq!(snap.location_id(), "backyard");
        assert_eq!(snap.value("forecast_length@now"), Some(&ReadingValue::Numeric(2.0)));
        assert_eq!(snap.value("max_air_temperature@+0d"), Some(&ReadingValue::Numeric(24.5)));
        assert_eq!(snap.value("wind_speed@+0d"), Some(&ReadingValue::Numeric(5.0)));
        assert_eq!(snap.value("wind_gust@+0d"), Some(&ReadingValue::Numeric(10.0)));
        assert_eq!(snap.value("wind_direction@+0d"), Some(&ReadingValue::Numeric(225.0)));
        assert_eq!(snap.value("wind_direction@+1d"), Some(&ReadingValue::Numeric(10.0)));
        assert_eq!(
            snap.value("condition@+0d"),
            Some(&ReadingValue::Enum("partlycloudy".into()))
        );
        assert_eq!(snap.value("condition@+1d"), Some(&ReadingValue::Enum("rainy".into())));
        assert!(snap.value("precipitation@+1d").is_none(), "absent optional field is skipped");
    }

    #[test]
    fn test_units_are_normalized() {
        let snap = normalize(SAMPLE).expect("sample should normalize");
        let unit_of = |key: &str| {
            snap.get(&ReadingKey::new(key))
                .map(|r| r.unit.clone())
                .expect("reading present")
        };

        assert_eq!(unit_of("max_air_temperature@+0d"), "°C");
        assert_eq!(unit_of("wind_speed@+0d"), "m/s");
        assert_eq!(unit_of("precipitation@+0d"), "mm");
        assert_eq!(unit_of("humidity@+0d"), "%");
    }

    #[test]
    fn test_valid_at_from_day_date() {
        let snap = normalize(SAMPLE).expect("sample should normalize");
        let day1 = snap
            .get(&ReadingKey::new("max_air_temperature@+1d"))
            .expect("reading present");
        assert_eq!(day1.valid_at.to_rfc3339(), "2026-06-13T00:00:00+00:00");
        assert_eq!(day1.fetched_at, fetched_at());
    }

    #[test]
    fn test_valid_at_falls_back_to_day_offset() {
        let snap = normalize(r#"{"forecast":{"0":{"minAirTemperature":1,"maxAirTemperature":2},"3":{"minAirTemperature":1,"maxAirTemperature":2}}}"#)
            .expect("should normalize");
        let day3 = snap
            .get(&ReadingKey::new("max_air_temperature@+3d"))
            .expect("reading present");
        assert_eq!(day3.valid_at.to_rfc3339(), "2026-06-15T00:00:00+00:00");
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let a = normalize(SAMPLE).expect("first");
        let b = normalize(SAMPLE).expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fahrenheit_source_converted() {
        let fields = vec![MetricSpec::new(
            "temp",
            "temperature",
            MetricKind::Temperature {
                source_unit: TemperatureUnit::Fahrenheit,
            },
            true,
        )];
        let payload = parse_payload(r#"{"forecast":[{"temp":68}]}"#).expect("parse");
        let snap = Normalizer::new(fields)
            .normalize(&payload, "x", fetched_at(), 1)
            .expect("normalize");
        assert_eq!(snap.value("temperature@+0d"), Some(&ReadingValue::Numeric(20.0)));
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let err = normalize(r#"{"forecast":[{"minAirTemperature":11.0}]}"#)
            .expect_err("missing max temp must fail");
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
        assert!(err.message.contains("maxAirTemperature"));
    }

    #[test]
    fn test_wrong_type_required_field_is_malformed() {
        let err = normalize(r#"{"forecast":[{"minAirTemperature":11.0,"maxAirTemperature":"hot"}]}"#)
            .expect_err("non-numeric max temp must fail");
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_wrong_type_optional_field_is_skipped() {
        let snap = normalize(
            r#"{"forecast":[{"minAirTemperature":11,"maxAirTemperature":20,"relativeHumidity":[1,2]}]}"#,
        )
        .expect("optional field errors are tolerated");
        assert!(snap.value("humidity@+0d").is_none());
    }

    #[test]
    fn test_missing_or_empty_forecast_is_malformed() {
        assert_eq!(
            normalize(r#"{"status":"ok"}"#).expect_err("no forecast").kind,
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            normalize(r#"{"forecast":[]}"#).expect_err("empty forecast").kind,
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn test_indexed_days_with_colliding_keys_are_malformed() {
        let err = normalize(r#"{"forecast":{"1":{"maxAirTemperature":2},"01":{"maxAirTemperature":9}}}"#)
            .expect_err("colliding day keys must fail");
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_default_mapping_has_no_issues() {
        assert!(mapping_issues(&default_pleinchamp_fields()).is_empty());
    }

    #[test]
    fn test_mapping_with_colliding_metrics_is_reported() {
        let fields = vec![
            MetricSpec::new("maxAirTemperature", "temp", celsius(), false),
            MetricSpec::new("minAirTemperature", "temp", celsius(), false),
            MetricSpec::new("weatherCode", "weather_code", MetricKind::WeatherCode, false),
            MetricSpec::new("nightCode", "night_code", MetricKind::WeatherCode, false),
            MetricSpec::new("days", FORECAST_LENGTH_METRIC, MetricKind::Percentage, false),
        ];

        let issues = mapping_issues(&fields).join("\n");
        assert!(issues.contains(r#""temp" is emitted more than once"#), "{issues}");
        assert!(issues.contains(r#""condition" is emitted more than once"#), "{issues}");
        assert!(issues.contains("2 weather_code fields"), "{issues}");
        assert!(issues.contains(r#""forecast_length" is emitted more than once"#), "{issues}");
    }

    #[test]
    fn test_condition_table() {
        assert_eq!(condition_for_code(1), "sunny");
        assert_eq!(condition_for_code(101), "clear-night");
        assert_eq!(condition_for_code(114), "lightning");
        assert_eq!(condition_for_code(42), "unknown");
    }
}
