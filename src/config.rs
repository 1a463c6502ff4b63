//! Configuration loader: merges env vars, .env file, and the TOML config file.

use std::collections::HashSet;
use std::path::Path;

use common::config::BridgeConfig;
use common::Error;
use forecast::normalize::mapping_issues;
use forecast::persist::storage_key;

const MIN_POLL_INTERVAL_SECS: u64 = 60;
const MAX_POLL_INTERVAL_SECS: u64 = 240 * 60;

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn validate_config(config: &BridgeConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.locations.is_empty() {
        issues.push("locations must contain at least one location".into());
    }

    let mut seen_names = HashSet::new();
    let mut seen_keys = HashSet::new();
    for loc in &config.locations {
        if loc.name.trim().is_empty() {
            issues.push("locations[].name must not be empty".into());
        }
        if !seen_names.insert(loc.name.as_str()) {
            issues.push(format!("location name {:?} is used more than once", loc.name));
        }
        let id = loc.to_location().id;
        if id.trim().is_empty() {
            issues.push(format!("{}: id must not be empty", loc.name));
        }
        // Snapshots are stored per sanitized id, so "a/b" and "a_b" collide.
        if !seen_keys.insert(storage_key(&id)) {
            issues.push(format!(
                "{}: location id {:?} collides with another location",
                loc.name, id
            ));
        }
        if !(-89.0..=89.0).contains(&loc.latitude) {
            issues.push(format!("{}: latitude must be in [-89, 89]", loc.name));
        }
        if !(-180.0..=180.0).contains(&loc.longitude) {
            issues.push(format!("{}: longitude must be in [-180, 180]", loc.name));
        }
    }

    if config.request_timeout_secs == 0 {
        issues.push("request_timeout_secs must be > 0".into());
    }
    if url::Url::parse(config.base_url.trim()).is_err() {
        issues.push(format!("base_url {:?} is not a valid URL", config.base_url));
    }

    let polling = &config.polling;
    if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&polling.poll_interval_secs) {
        issues.push(format!(
            "polling.poll_interval_secs must be in [{MIN_POLL_INTERVAL_SECS}, {MAX_POLL_INTERVAL_SECS}]"
        ));
    }
    if !(0.0..=0.5).contains(&polling.jitter_ratio) {
        issues.push("polling.jitter_ratio must be in [0, 0.5]".into());
    }
    if polling.backoff_base_secs == 0 {
        issues.push("polling.backoff_base_secs must be > 0".into());
    }
    if polling.backoff_max_secs < polling.backoff_base_secs {
        issues.push("polling.backoff_max_secs must be >= polling.backoff_base_secs".into());
    }
    if polling.max_requests_per_hour == 0 {
        issues.push("polling.max_requests_per_hour must be > 0".into());
    }

    if let Some(fields) = &config.fields {
        if fields.is_empty() {
            issues.push("fields must not be empty when set".into());
        }
        issues.extend(mapping_issues(fields));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Environment overrides (highest priority). `lookup` is `std::env::var`
/// outside of tests.
fn apply_env_overrides(
    config: &mut BridgeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), Error> {
    if let Some(key) = lookup("PLEINCHAMP_API_KEY") {
        config.api_key = key.trim().to_string();
    }
    if let Some(url) = lookup("PLEINCHAMP_BASE_URL").and_then(non_empty) {
        config.base_url = url;
    }
    if let Some(raw) = lookup("PLEINCHAMP_TIMEOUT_SECS") {
        config.request_timeout_secs = parse_positive_u64(&raw, "PLEINCHAMP_TIMEOUT_SECS")?;
    }
    if let Some(raw) = lookup("PLEINCHAMP_POLL_INTERVAL_SECS") {
        config.polling.poll_interval_secs =
            parse_positive_u64(&raw, "PLEINCHAMP_POLL_INTERVAL_SECS")?;
    }
    if let Some(dir) = lookup("PLEINCHAMP_SNAPSHOT_DIR") {
        config.snapshot_dir = non_empty(dir);
    }
    Ok(())
}

fn parse_config(contents: &str, source: &str) -> Result<BridgeConfig, Error> {
    toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse {source}: {e}")))
}

/// Load bridge configuration from environment and optional config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Start with defaults.
    let mut config = BridgeConfig::default();

    // 3. Try loading the config file if it exists.
    if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        config = parse_config(&contents, &path.display().to_string())?;
    } else {
        tracing::warn!("{} not found; using defaults and environment", path.display());
    }

    // 4. Override with environment variables.
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // 5. Validate.
    if config.api_key.is_empty() {
        tracing::warn!("PLEINCHAMP_API_KEY is empty; requests will be sent unauthenticated");
    }

    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
api_key = "from-file"
snapshot_dir = "state"

[[locations]]
name = "Backyard"
latitude = 45.76
longitude = 4.84

[[locations]]
name = "Orchard"
id = "orchard-1"
latitude = 44.1
longitude = 5.2

[polling]
poll_interval_secs = 600
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    fn expect_issue(config: &BridgeConfig, needle: &str) {
        let err = validate_config(config).expect_err("config should be rejected");
        assert!(err.to_string().contains(needle), "missing {needle:?} in: {err}");
    }

    #[test]
    fn test_sample_file_parses_with_defaults() {
        let cfg = parse_config(SAMPLE, "sample").expect("sample should parse");

        assert_eq!(cfg.locations.len(), 2);
        assert_eq!(cfg.locations[1].to_location().id, "orchard-1");
        assert_eq!(cfg.polling.poll_interval_secs, 600);
        assert_eq!(cfg.polling.backoff_base_secs, 30);
        assert_eq!(cfg.request_timeout_secs, 10);
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut cfg = parse_config(SAMPLE, "sample").expect("sample should parse");
        apply_env_overrides(
            &mut cfg,
            env(&[
                ("PLEINCHAMP_API_KEY", " from-env "),
                ("PLEINCHAMP_POLL_INTERVAL_SECS", "900"),
                ("PLEINCHAMP_SNAPSHOT_DIR", ""),
            ]),
        )
        .expect("overrides should apply");

        assert_eq!(cfg.api_key, "from-env");
        assert_eq!(cfg.polling.poll_interval_secs, 900);
        assert_eq!(cfg.snapshot_dir, None);
    }

    #[test]
    fn test_bad_env_number_is_rejected() {
        let mut cfg = BridgeConfig::default();
        let err = apply_env_overrides(&mut cfg, env(&[("PLEINCHAMP_TIMEOUT_SECS", "0")]))
            .expect_err("zero timeout must fail");
        assert!(err.to_string().contains("PLEINCHAMP_TIMEOUT_SECS"));
    }

    #[test]
    fn test_validation_collects_issues() {
        let mut cfg = parse_config(SAMPLE, "sample").expect("sample should parse");
        cfg.locations[1].name = "Backyard".into();
        cfg.locations[0].latitude = 90.0;
        cfg.polling.poll_interval_secs = 30;
        cfg.polling.backoff_max_secs = 10;

        let err = validate_config(&cfg).expect_err("must fail").to_string();
        assert!(err.contains("used more than once"));
        assert!(err.contains("latitude"));
        assert!(err.contains("poll_interval_secs"));
        assert!(err.contains("backoff_max_secs"));
    }

    #[test]
    fn test_no_locations_is_rejected() {
        expect_issue(&BridgeConfig::default(), "at least one location");
    }

    #[test]
    fn test_colliding_location_ids_are_rejected() {
        let mut cfg = parse_config(SAMPLE, "sample").expect("sample should parse");
        cfg.locations[1].id = Some("Backyard".into());
        expect_issue(&cfg, "collides with another location");

        cfg.locations[0].id = Some("farm/north".into());
        cfg.locations[1].id = Some("farm_north".into());
        expect_issue(&cfg, "\"farm_north\" collides");
    }

    #[test]
    fn test_field_mapping_collisions_are_rejected() {
        use common::config::{MetricKind, MetricSpec};

        let mut cfg = parse_config(SAMPLE, "sample").expect("sample should parse");
        cfg.fields = Some(vec![
            MetricSpec::new("maxAirTemperature", "temp", MetricKind::Precipitation, false),
            MetricSpec::new("minAirTemperature", "temp", MetricKind::Precipitation, false),
        ]);
        expect_issue(&cfg, "\"temp\" is emitted more than once");

        cfg.fields = Some(vec![
            MetricSpec::new("weatherCode", "code", MetricKind::WeatherCode, false),
            MetricSpec::new("nightCode", "night_code", MetricKind::WeatherCode, false),
        ]);
        expect_issue(&cfg, "at most one is allowed");

        cfg.fields = Some(vec![MetricSpec::new(
            "rain",
            "rain@daily",
            MetricKind::Precipitation,
            false,
        )]);
        expect_issue(&cfg, "must not contain '@'");
    }

    #[test]
    fn test_jitter_ratio_bounds() {
        let mut cfg = parse_config(SAMPLE, "sample").expect("sample should parse");
        cfg.polling.jitter_ratio = 0.8;
        expect_issue(&cfg, "jitter_ratio");
    }
}
