//! Forecast Coordinator.
//!
//! One coordinator per location. All state transitions run on a single
//! actor task; the handle talks to it over a command channel and reads the
//! cache and health through `watch` channels, so accessors never block on a
//! poll in progress.
//!
//! ```text
//! Idle ──tick / refresh──▶ Polling ──ok / fatal──▶ Idle
//!                            │
//!                            └─transient─▶ Backoff ──expiry──▶ Polling
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    BridgeConfig, Error, FetchError, ForecastSnapshot, ForecastStatus, Location, PollState,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use pleinchamp_client::{RawPayload, RequestQuota};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{jittered, BackoffPolicy};
use crate::normalize::{mapping_issues, Normalizer};
use crate::registry::{ForecastSubscriber, SubscriberRegistry, SubscriptionHandle};
use crate::source::ForecastSource;

type PollResult = Result<Arc<ForecastSnapshot>, FetchError>;
type InFlight = BoxFuture<'static, (u64, Result<RawPayload, FetchError>)>;

/// Knobs that are not part of the host-facing `{api_key, location, interval}`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Random ± fraction applied to the first scheduled poll.
    pub jitter_ratio: f64,
    pub backoff: BackoffPolicy,
    /// Provider request budget. `None` disables client-side limiting.
    pub quota: Option<RequestQuota>,
    pub normalizer: Normalizer,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            jitter_ratio: 0.1,
            backoff: BackoffPolicy::default(),
            quota: None,
            normalizer: Normalizer::default(),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &BridgeConfig) -> common::Result<Self> {
        let normalizer = match &cfg.fields {
            Some(fields) => {
                let issues = mapping_issues(fields);
                if !issues.is_empty() {
                    return Err(Error::Config(issues.join("; ")));
                }
                Normalizer::new(fields.clone())
            }
            None => Normalizer::default(),
        };

        Ok(Self {
            jitter_ratio: cfg.polling.jitter_ratio,
            backoff: BackoffPolicy::from_config(&cfg.polling),
            quota: Some(RequestQuota::per_hour(cfg.polling.max_requests_per_hour)?),
            normalizer,
        })
    }
}

enum Command {
    Start(Duration),
    Refresh(oneshot::Sender<PollResult>),
    Stop,
}

/// Current and previous snapshot, swapped together.
#[derive(Debug, Clone, Default)]
struct Cache {
    current: Option<Arc<ForecastSnapshot>>,
    previous: Option<Arc<ForecastSnapshot>>,
}

#[derive(Debug, Clone)]
struct Health {
    status: ForecastStatus,
    poll_state: PollState,
    last_error: Option<FetchError>,
}

/// Handle to a running coordinator.
pub struct ForecastCoordinator {
    location: Location,
    commands: mpsc::UnboundedSender<Command>,
    cache: watch::Receiver<Cache>,
    health: watch::Receiver<Health>,
    registry: Arc<SubscriberRegistry>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ForecastCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastCoordinator")
            .field("location", &self.location.id)
            .field("status", &self.status())
            .field("poll_state", &self.poll_state())
            .finish()
    }
}

impl ForecastCoordinator {
    /// Spawn the coordinator actor in `Idle`. Must be called inside a Tokio
    /// runtime. Nothing is fetched until `start` or `refresh_now`.
    pub fn new(
        location: Location,
        api_key: impl Into<String>,
        settings: CoordinatorSettings,
        source: Arc<dyn ForecastSource>,
    ) -> Self {
        Self::spawn(location, api_key.into(), settings, source, None)
    }

    /// Like [`new`](Self::new), but serve `snapshot` (e.g. loaded from disk)
    /// as stale data until the first successful poll.
    pub fn with_initial_snapshot(
        location: Location,
        api_key: impl Into<String>,
        settings: CoordinatorSettings,
        source: Arc<dyn ForecastSource>,
        snapshot: ForecastSnapshot,
    ) -> Self {
        Self::spawn(location, api_key.into(), settings, source, Some(snapshot))
    }

    fn spawn(
        location: Location,
        api_key: String,
        settings: CoordinatorSettings,
        source: Arc<dyn ForecastSource>,
        seed: Option<ForecastSnapshot>,
    ) -> Self {
        let seed_sequence = seed.as_ref().map_or(0, ForecastSnapshot::sequence);
        let status = if seed.is_some() {
            ForecastStatus::Stale
        } else {
            ForecastStatus::Unavailable
        };

        let (cache_tx, cache_rx) = watch::channel(Cache {
            current: seed.map(Arc::new),
            previous: None,
        });
        let (health_tx, health_rx) = watch::channel(Health {
            status,
            poll_state: PollState::Idle,
            last_error: None,
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriberRegistry::new());

        let actor = Actor {
            location: location.clone(),
            api_key,
            settings,
            source,
            registry: Arc::clone(&registry),
            cache: cache_tx,
            health: health_tx,
            interval: None,
            next_tick: None,
            backoff_until: None,
            attempt: 0,
            in_flight: None,
            waiters: Vec::new(),
            next_sequence: seed_sequence,
        };
        let task = tokio::spawn(actor.run(cmd_rx));

        Self {
            location,
            commands: cmd_tx,
            cache: cache_rx,
            health: health_rx,
            registry,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Begin periodic polling. The first poll lands at `now ± jitter`;
    /// later calls are ignored.
    pub fn start(&self, poll_interval: Duration) {
        if self.commands.send(Command::Start(poll_interval)).is_err() {
            warn!("start() on stopped coordinator for {}", self.location.name);
        }
    }

    /// Poll now, or join the poll already in flight. During backoff the
    /// request waits for the backoff to expire.
    pub async fn refresh_now(&self) -> common::Result<Arc<ForecastSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Refresh(tx))
            .map_err(|_| Error::CoordinatorStopped)?;

        match rx.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::CoordinatorStopped),
        }
    }

    pub fn current_snapshot(&self) -> Option<Arc<ForecastSnapshot>> {
        self.cache.borrow().current.clone()
    }

    /// The snapshot that `current_snapshot` replaced.
    pub fn previous_snapshot(&self) -> Option<Arc<ForecastSnapshot>> {
        self.cache.borrow().previous.clone()
    }

    pub fn status(&self) -> ForecastStatus {
        self.health.borrow().status
    }

    pub fn poll_state(&self) -> PollState {
        self.health.borrow().poll_state
    }

    /// Most recent failure, cleared by the next successful poll.
    pub fn last_error(&self) -> Option<FetchError> {
        self.health.borrow().last_error.clone()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ForecastSubscriber>) -> SubscriptionHandle {
        self.registry.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// Cancel any in-flight or scheduled poll and wait for the actor to
    /// exit. Pending `refresh_now` callers get `CoordinatorStopped`.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Coordinator task for {} ended abnormally: {}", self.location.name, e);
            }
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────

enum Event {
    Command(Command),
    Completed(u64, Result<RawPayload, FetchError>),
    Timer,
}

struct Actor {
    location: Location,
    api_key: String,
    settings: CoordinatorSettings,
    source: Arc<dyn ForecastSource>,
    registry: Arc<SubscriberRegistry>,
    cache: watch::Sender<Cache>,
    health: watch::Sender<Health>,

    interval: Option<Duration>,
    next_tick: Option<Instant>,
    backoff_until: Option<Instant>,
    attempt: u32,

    in_flight: Option<InFlight>,
    waiters: Vec<oneshot::Sender<PollResult>>,

    /// Sequence handed to the most recently started poll.
    next_sequence: u64,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Coordinator for {} running", self.location.name);

        loop {
            let deadline = self.next_deadline();

            let event = tokio::select! {
                biased;
                cmd = commands.recv() => Event::Command(cmd.unwrap_or(Command::Stop)),
                (seq, result) = next_completion(&mut self.in_flight) => Event::Completed(seq, result),
                _ = sleep_until_opt(deadline) => Event::Timer,
            };

            match event {
                Event::Command(Command::Stop) => break,
                Event::Command(Command::Start(interval)) => self.on_start(interval),
                Event::Command(Command::Refresh(reply)) => self.on_refresh(reply),
                Event::Completed(seq, result) => self.on_completed(seq, result),
                Event::Timer => self.on_timer(),
            }
        }

        if self.in_flight.take().is_some() {
            info!("Cancelled in-flight poll for {}", self.location.name);
        }
        // Dropping the waiters tells their callers the coordinator stopped.
        self.waiters.clear();
        self.set_poll_state(PollState::Idle);
        info!("Coordinator for {} stopped", self.location.name);
    }

    /// Only one timer matters at a time: nothing while polling, the backoff
    /// expiry while backing off, otherwise the periodic tick.
    fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() {
            None
        } else if self.backoff_until.is_some() {
            self.backoff_until
        } else {
            self.next_tick
        }
    }

    fn on_start(&mut self, interval: Duration) {
        if interval.is_zero() {
            warn!("Ignoring start() with zero poll interval for {}", self.location.name);
            return;
        }
        if self.interval.is_some() {
            debug!("Coordinator for {} already started", self.location.name);
            return;
        }

        let first = jittered(interval, self.settings.jitter_ratio, &mut rand::thread_rng());
        self.interval = Some(interval);
        if self.in_flight.is_none() && self.backoff_until.is_none() {
            self.next_tick = Some(Instant::now() + first);
        }

        info!(
            "Polling {} every {}s (first poll in {:.1}s)",
            self.location.name,
            interval.as_secs(),
            first.as_secs_f64()
        );
    }

    fn on_refresh(&mut self, reply: oneshot::Sender<PollResult>) {
        self.waiters.push(reply);

        if self.in_flight.is_some() {
            debug!("Refresh for {} joined the poll in flight", self.location.name);
            return;
        }

        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                debug!(
                    "Refresh for {} queued until backoff expires in {:.1}s",
                    self.location.name,
                    (until - Instant::now()).as_secs_f64()
                );
                return;
            }
        }

        self.begin_poll();
    }

    fn on_timer(&mut self) {
        if self.backoff_until.is_some() {
            debug!("Backoff expired for {}", self.location.name);
        }
        self.begin_poll();
    }

    fn begin_poll(&mut self) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.backoff_until = None;
        self.next_tick = None;
        self.set_poll_state(PollState::Polling);

        debug!("Polling {} (sequence {})", self.location.name, sequence);

        let source = Arc::clone(&self.source);
        let quota = self.settings.quota.clone();
        let location = self.location.clone();
        let api_key = self.api_key.clone();

        self.in_flight = Some(
            async move {
                if let Some(quota) = quota {
                    quota.until_ready().await;
                }
                let result = source.fetch(&location, &api_key).await;
                (sequence, result)
            }
            .boxed(),
        );
    }

    fn on_completed(&mut self, sequence: u64, result: Result<RawPayload, FetchError>) {
        let fetched_at = Utc::now();
        let outcome = result.and_then(|payload| {
            self.settings
                .normalizer
                .normalize(&payload, &self.location.id, fetched_at, sequence)
        });

        match outcome {
            Ok(snapshot) => self.install(snapshot),
            Err(err) => self.fail(err),
        }
    }

    /// Sequences are taken when a poll starts and only one poll is ever in
    /// flight, so installs always happen in poll-start order.
    fn install(&mut self, snapshot: ForecastSnapshot) {
        let new = Arc::new(snapshot);
        let old = self.cache.borrow().current.clone();
        debug_assert!(old.as_ref().map_or(true, |o| o.sequence() < new.sequence()));

        self.cache.send_replace(Cache {
            current: Some(Arc::clone(&new)),
            previous: old.clone(),
        });
        self.attempt = 0;
        self.after_poll(ForecastStatus::Available, None);

        let notified = self.registry.notify(old.as_deref(), &new);
        info!(
            "Installed snapshot {} for {} ({} readings, {} subscribers notified)",
            new.sequence(),
            self.location.name,
            new.len(),
            notified
        );

        self.reply_all(Ok(new));
    }

    fn fail(&mut self, err: FetchError) {
        let has_cache = self.cache.borrow().current.is_some();

        if err.is_retriable() {
            let delay = self.settings.backoff.delay_for(self.attempt, &err.kind);
            self.attempt = self.attempt.saturating_add(1);
            let now = Instant::now();
            let until = now
                .checked_add(delay)
                .or_else(|| now.checked_add(self.settings.backoff.max))
                .unwrap_or(now);
            self.backoff_until = Some(until);

            warn!(
                "Poll for {} failed ({}); retry {} in {}s",
                self.location.name,
                err,
                self.attempt,
                delay.as_secs()
            );

            let status = if has_cache {
                ForecastStatus::Stale
            } else {
                ForecastStatus::Unavailable
            };
            self.health.send_replace(Health {
                status,
                poll_state: PollState::Backoff {
                    until: until.into_std(),
                    attempt: self.attempt,
                },
                last_error: Some(err.clone()),
            });
        } else {
            error!(
                "Poll for {} failed ({}); not retrying until the next scheduled poll",
                self.location.name, err
            );
            self.attempt = 0;
            self.after_poll(ForecastStatus::Unavailable, Some(err.clone()));
        }

        self.reply_all(Err(err));
    }

    /// Back to `Idle` with the next periodic tick scheduled.
    fn after_poll(&mut self, status: ForecastStatus, last_error: Option<FetchError>) {
        self.backoff_until = None;
        self.next_tick = self.interval.map(|interval| Instant::now() + interval);
        self.health.send_replace(Health {
            status,
            poll_state: PollState::Idle,
            last_error,
        });
    }

    fn set_poll_state(&self, poll_state: PollState) {
        self.health.send_modify(|h| h.poll_state = poll_state);
    }

    fn reply_all(&mut self, result: PollResult) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

async fn next_completion(slot: &mut Option<InFlight>) -> (u64, Result<RawPayload, FetchError>) {
    match slot.as_mut() {
        Some(fut) => {
            let out = fut.await;
            *slot = None;
            out
        }
        None => std::future::pending().await,
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
