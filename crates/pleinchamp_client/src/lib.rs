//! Pleinchamp forecast API client.
//!
//! Single-attempt, authenticated fetch of the `forecasts-15d` endpoint,
//! parsed into a typed [`RawPayload`]. Failures are classified into
//! [`ErrorKind`]s; retrying is the caller's business.

pub mod rate_limit;

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Error, ErrorKind, FetchError, Location};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;
use url::Url;

pub use rate_limit::RequestQuota;

const FORECAST_PATH: &str = "forecasts-15d";
const API_KEY_HEADER: &str = "x-api-key";

// ── Response types ────────────────────────────────────────────────────

/// Response from `forecasts-15d`. Only the `forecast` member is read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub forecast: Option<ForecastDays>,
}

/// Daily forecasts, either as a list or as an object keyed by day index.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ForecastDays {
    List(Vec<RawDay>),
    Indexed(BTreeMap<String, RawDay>),
}

impl ForecastDays {
    /// Days ordered by index. Indexed keys must be distinct non-negative
    /// integers (`"1"` and `"01"` collide).
    pub fn ordered(&self) -> Result<Vec<(u32, &RawDay)>, FetchError> {
        match self {
            ForecastDays::List(days) => Ok(days
                .iter()
                .enumerate()
                .map(|(i, day)| (i as u32, day))
                .collect()),
            ForecastDays::Indexed(days) => {
                let mut ordered = days
                    .iter()
                    .map(|(key, day)| {
                        key.trim().parse::<u32>().map(|idx| (idx, day)).map_err(|_| {
                            FetchError::malformed(format!("forecast day key {key:?} is not an index"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                ordered.sort_by_key(|(idx, _)| *idx);
                if let Some(pair) = ordered.windows(2).find(|w| w[0].0 == w[1].0) {
                    return Err(FetchError::malformed(format!(
                        "forecast day index {} appears more than once",
                        pair[0].0
                    )));
                }
                Ok(ordered)
            }
        }
    }
}

/// One day's provider fields, kept untyped so the field mapping decides
/// what is read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RawDay(pub serde_json::Map<String, serde_json::Value>);

impl RawDay {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }
}

// ── Client ────────────────────────────────────────────────────────────

/// Pleinchamp API client with connection pooling and a bounded timeout.
#[derive(Debug, Clone)]
pub struct PleinchampClient {
    client: reqwest::Client,
    base_url: Url,
}

impl PleinchampClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let base_url = normalize_base_url(base_url)?;

        let client = reqwest::Client::builder()
            .user_agent("pleinchamp-bridge/0.1")
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build Pleinchamp HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// `forecasts-15d` URL for a location, coordinates rounded to 2 decimals.
    pub fn forecast_url(&self, location: &Location) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(FORECAST_PATH)
            .map_err(|e| FetchError::unreachable(format!("invalid forecast URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("latitude", &format!("{:.2}", location.latitude))
            .append_pair("longitude", &format!("{:.2}", location.longitude));
        Ok(url)
    }

    /// Fetch the daily forecast for a location. One attempt, no retries.
    pub async fn fetch(&self, location: &Location, api_key: &str) -> Result<RawPayload, FetchError> {
        let url = self.forecast_url(location)?;

        debug!("Fetching Pleinchamp forecast for {}: {}", location.name, url);

        let mut req = self.client.get(url).header("Accept", "application/json");
        if !api_key.is_empty() {
            req = req.header(API_KEY_HEADER, api_key);
        }

        let resp = req.send().await.map_err(|e| transport_error(&e))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = retry_after_from_headers(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body = resp.text().await.map_err(|e| transport_error(&e))?;
        let payload = parse_payload(&body)?;

        debug!(
            "Got Pleinchamp payload for {} ({} bytes)",
            location.name,
            body.len()
        );

        Ok(payload)
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, Error> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|e| Error::Config(format!("invalid base_url {raw:?}: {e}")))
}

pub fn parse_payload(body: &str) -> Result<RawPayload, FetchError> {
    serde_json::from_str(body)
        .map_err(|e| FetchError::malformed(format!("JSON parse error: {e}")))
}

fn format_reqwest_error(err: &reqwest::Error) -> String {
    // Keep chained causes so network failures (DNS/TLS/socket) are visible.
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !cause_msg.is_empty() && !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }

    message
}

fn transport_error(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::timeout(format_reqwest_error(err))
    } else {
        FetchError::unreachable(format_reqwest_error(err))
    }
}

fn summarize_body(raw: &str) -> String {
    const MAX_CHARS: usize = 500;
    let compact = raw.replace(['\n', '\r'], " ");
    match compact.char_indices().nth(MAX_CHARS) {
        Some((cut, _)) => format!("{}…", &compact[..cut]),
        None => compact,
    }
}

/// Map a non-success HTTP status to a fetch failure.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> FetchError {
    let message = format!("Pleinchamp returned {status}: {}", summarize_body(body));
    let kind = match status {
        401 | 403 => ErrorKind::Unauthorized,
        429 => ErrorKind::RateLimited { retry_after },
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Unreachable,
        _ => ErrorKind::MalformedResponse,
    };
    FetchError::new(kind, message)
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| parse_retry_after(raw, Utc::now()))
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}
