//! Domain types shared across the bridge.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ATTRIBUTION: &str = "Data provided by Pleinchamp";

// ── Readings ──────────────────────────────────────────────────────────

/// Names one metric at one forecast horizon, e.g. `max_air_temperature@+1d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingKey(String);

impl ReadingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_horizon(metric: &str, horizon: &str) -> Self {
        Self(format!("{metric}@{horizon}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReadingKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Typed scalar carried by a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReadingValue {
    Numeric(f64),
    Enum(String),
    Timestamp(DateTime<Utc>),
}

impl ReadingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Numeric(v) => write!(f, "{v}"),
            ReadingValue::Enum(s) => f.write_str(s),
            ReadingValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub key: ReadingKey,
    pub value: ReadingValue,
    /// Normalized unit; empty for unitless values.
    pub unit: String,
    pub valid_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

// ── Snapshots ─────────────────────────────────────────────────────────

/// Immutable, ordered set of readings for one location from one poll.
///
/// Every reading's `fetched_at` equals the snapshot's `fetched_at`;
/// [`ForecastSnapshot::new`] enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    location_id: String,
    sequence: u64,
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    attribution: String,
    readings: Vec<Reading>,
}

impl ForecastSnapshot {
    pub fn new(
        location_id: impl Into<String>,
        sequence: u64,
        fetched_at: DateTime<Utc>,
        readings: Vec<Reading>,
    ) -> Self {
        let readings = readings
            .into_iter()
            .map(|mut r| {
                r.fetched_at = fetched_at;
                r
            })
            .collect();

        Self {
            location_id: location_id.into(),
            sequence,
            fetched_at,
            attribution: DEFAULT_ATTRIBUTION.to_string(),
            readings,
        }
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn attribution(&self) -> &str {
        &self.attribution
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn get(&self, key: &ReadingKey) -> Option<&Reading> {
        self.readings.iter().find(|r| &r.key == key)
    }

    pub fn value(&self, key: &str) -> Option<&ReadingValue> {
        self.readings
            .iter()
            .find(|r| r.key.as_str() == key)
            .map(|r| &r.value)
    }

    /// Key → value view, used for diffing.
    pub fn values_by_key(&self) -> HashMap<&ReadingKey, &ReadingValue> {
        self.readings.iter().map(|r| (&r.key, &r.value)).collect()
    }
}

// ── Location ──────────────────────────────────────────────────────────

/// Which forecast a coordinator polls. Fixed for the coordinator's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Provider-facing identifier; also used as the persistence key.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

// ── Coordinator state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Backoff { until: Instant, attempt: u32 },
}

impl PollState {
    pub fn label(&self) -> &'static str {
        match self {
            PollState::Idle => "idle",
            PollState::Polling => "polling",
            PollState::Backoff { .. } => "backoff",
        }
    }
}

/// Coarse health reported to consumers next to the cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastStatus {
    /// Last poll succeeded.
    Available,
    /// Serving last-known-good data after a transient failure.
    Stale,
    /// No usable data, or a failure that needs external correction.
    Unavailable,
}

impl fmt::Display for ForecastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForecastStatus::Available => "available",
            ForecastStatus::Stale => "stale",
            ForecastStatus::Unavailable => "unavailable",
        })
    }
}
