//! pleinchamp-bridge: keeps Pleinchamp daily forecasts fresh per location.
//!
//! Single-binary Tokio application that:
//! 1. Loads locations and polling settings
//! 2. Runs one forecast coordinator per location
//! 3. Logs what changed and persists the latest snapshot
//! 4. Shuts every coordinator down on Ctrl+C

mod config;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use common::config::BridgeConfig;
use common::ForecastSnapshot;
use forecast::persist::{load_snapshot, save_snapshot};
use forecast::{CoordinatorSettings, ForecastCoordinator, ForecastSource, SnapshotUpdate};
use pleinchamp_client::PleinchampClient;

/// Pleinchamp forecast bridge
#[derive(Parser)]
#[command(name = "pleinchamp-bridge", about = "Pleinchamp forecast coordinator")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Refresh every location once, print the readings, then exit.
    #[arg(long)]
    once: bool,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pleinchamp_bridge=info,forecast=info,pleinchamp_client=info".into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!("Pleinchamp bridge starting up...");

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Locations: {:?}",
        cfg.locations.iter().map(|l| &l.name).collect::<Vec<_>>()
    );
    info!(
        "Polling: every {}s (±{:.0}%), backoff {}s..{}s, {} req/h",
        cfg.polling.poll_interval_secs,
        cfg.polling.jitter_ratio * 100.0,
        cfg.polling.backoff_base_secs,
        cfg.polling.backoff_max_secs,
        cfg.polling.max_requests_per_hour,
    );

    let client = match PleinchampClient::new(
        &cfg.base_url,
        Duration::from_secs(cfg.request_timeout_secs),
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("Client initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    let source: Arc<dyn ForecastSource> = Arc::new(client);
    let snapshot_dir = cfg.snapshot_dir.as_ref().map(PathBuf::from);

    let coordinators = match build_coordinators(&cfg, &source, snapshot_dir.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Coordinator setup failed: {}", e);
            std::process::exit(1);
        }
    };

    // ── Once mode ────────────────────────────────────────────────────
    if cli.once {
        let mut failed = 0;
        for coordinator in &coordinators {
            let name = &coordinator.location().name;
            match coordinator.refresh_now().await {
                Ok(snapshot) => print_snapshot(name, &snapshot),
                Err(e) => {
                    error!("❌ {}: {}", name, e);
                    failed += 1;
                }
            }
            coordinator.stop().await;
        }
        if failed > 0 {
            std::process::exit(1);
        }
        return;
    }

    // ── Start polling ────────────────────────────────────────────────
    let interval = cfg.polling.poll_interval();
    for coordinator in &coordinators {
        coordinator.start(interval);

        let c = Arc::clone(coordinator);
        tokio::spawn(async move {
            if let Err(e) = c.refresh_now().await {
                warn!("Initial refresh for {} failed: {}", c.location().name, e);
            }
        });
    }

    let hb_coordinators = coordinators.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            for c in &hb_coordinators {
                let (sequence, readings) = c
                    .current_snapshot()
                    .map_or((0, 0), |s| (s.sequence(), s.len()));
                info!(
                    "HEARTBEAT: location={} status={} state={} sequence={} readings={}{}",
                    c.location().name,
                    c.status(),
                    c.poll_state().label(),
                    sequence,
                    readings,
                    c.last_error()
                        .map(|e| format!(" last_error=\"{e}\""))
                        .unwrap_or_default(),
                );
            }
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────────
    info!("🚀 Bridge is running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        r = heartbeat_handle => {
            error!("Heartbeat task exited: {:?}", r);
        }
    }

    for coordinator in &coordinators {
        coordinator.stop().await;
    }

    info!("Pleinchamp bridge shut down.");
}

fn build_coordinators(
    cfg: &BridgeConfig,
    source: &Arc<dyn ForecastSource>,
    snapshot_dir: Option<&Path>,
) -> common::Result<Vec<Arc<ForecastCoordinator>>> {
    let mut coordinators = Vec::with_capacity(cfg.locations.len());

    for loc_cfg in &cfg.locations {
        let location = loc_cfg.to_location();
        let settings = CoordinatorSettings::from_config(cfg)?;

        let seed = match snapshot_dir {
            Some(dir) => match load_snapshot(dir, &location.id) {
                Ok(seed) => seed,
                Err(e) => {
                    warn!("Ignoring saved snapshot for {}: {}", location.name, e);
                    None
                }
            },
            None => None,
        };

        let coordinator = match seed {
            Some(snapshot) => {
                info!(
                    "Seeding {} with saved snapshot {} from {}",
                    location.name,
                    snapshot.sequence(),
                    snapshot.fetched_at()
                );
                ForecastCoordinator::with_initial_snapshot(
                    location,
                    cfg.api_key.clone(),
                    settings,
                    Arc::clone(source),
                    snapshot,
                )
            }
            None => ForecastCoordinator::new(
                location,
                cfg.api_key.clone(),
                settings,
                Arc::clone(source),
            ),
        };

        subscribe_logger(&coordinator);
        if let Some(dir) = snapshot_dir {
            subscribe_persistence(&coordinator, dir.to_path_buf());
        }

        coordinators.push(Arc::new(coordinator));
    }

    Ok(coordinators)
}

fn subscribe_logger(coordinator: &ForecastCoordinator) {
    let name = coordinator.location().name.clone();
    coordinator.subscribe(Arc::new(move |update: &SnapshotUpdate| {
        let snapshot = &update.snapshot;
        let changed = update
            .changed
            .iter()
            .map(|key| {
                let value = snapshot
                    .get(key)
                    .map_or_else(|| "(removed)".to_string(), |r| format!("{}{}", r.value, r.unit));
                format!("{key}={value}")
            })
            .collect::<Vec<_>>();
        info!(
            "📡 {} snapshot {}: {} changed [{}]",
            name,
            snapshot.sequence(),
            changed.len(),
            changed.join(", ")
        );
    }));
}

fn subscribe_persistence(coordinator: &ForecastCoordinator, dir: PathBuf) {
    coordinator.subscribe(Arc::new(snapshot_writer(dir)));
}

/// Subscriber that saves each installed snapshot on the blocking pool, so
/// disk I/O never stalls the coordinator task.
fn snapshot_writer(dir: PathBuf) -> impl Fn(&SnapshotUpdate) + Send + Sync + 'static {
    let last_saved = Arc::new(StdMutex::new(0u64));
    move |update: &SnapshotUpdate| {
        let dir = dir.clone();
        let snapshot = Arc::clone(&update.snapshot);
        let last_saved = Arc::clone(&last_saved);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = save_if_newer(&dir, &snapshot, &last_saved) {
                warn!("Snapshot save failed: {}", e);
            }
        });
    }
}

/// Writes are serialized by `last_saved`; a snapshot whose sequence is not
/// above the last one written is skipped. Returns whether a file was written.
fn save_if_newer(
    dir: &Path,
    snapshot: &ForecastSnapshot,
    last_saved: &StdMutex<u64>,
) -> common::Result<bool> {
    let mut last = last_saved
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if snapshot.sequence() <= *last {
        debug!(
            "Skipping save of snapshot {} for {}; {} already written",
            snapshot.sequence(),
            snapshot.location_id(),
            *last
        );
        return Ok(false);
    }
    save_snapshot(dir, snapshot)?;
    *last = snapshot.sequence();
    Ok(true)
}

fn print_snapshot(name: &str, snapshot: &ForecastSnapshot) {
    println!(
        "{} (sequence {}, fetched {}) — {}",
        name,
        snapshot.sequence(),
        snapshot.fetched_at().to_rfc3339(),
        snapshot.attribution()
    );
    for reading in snapshot.readings() {
        println!("  {:<36} {}{}", reading.key, reading.value, reading.unit);
    }
}
