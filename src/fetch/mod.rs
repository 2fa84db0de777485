//! The fetch engine: one long-lived worker per enabled feed, supervised by
//! a single control loop.
//!
//! The supervisor reconciles its fleet against the store on a timer and on
//! demand, routes worker failures into exponential backoff, and owns
//! shutdown. Workers are purely cooperative: every suspension point also
//! observes the worker's kill signal, and a killed worker never writes to
//! the store again.

mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::entity::{Entity, Feed};
use crate::parse::ParseError;
use crate::store::{Store, StoreError};
use worker::Worker;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("http status {0}")]
    Status(u16),

    #[error("response too large")]
    TooLarge,

    /// A WAF challenge page instead of a feed document. Backing off faster
    /// only makes these worse, so the supervisor pins the retry at the cap.
    #[error("blocked by a WAF challenge")]
    Waf,

    #[error("feed command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    fn is_waf(&self) -> bool {
        matches!(self, Self::Waf)
    }
}

/// Timing knobs, separated from the engine so tests can compress the
/// schedule.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How often the enabled-feed set is re-read from the store; the last
    /// line of defense against out-of-band edits.
    pub db_poll_period: Duration,
    /// Floor for the per-feed poll cadence, whatever a feed's TTL claims.
    pub min_poll_period: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub fetch_timeout: Duration,
    /// How long shutdown waits for workers before abandoning them.
    pub drain_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            db_poll_period: Duration::from_secs(60 * 5),
            min_poll_period: Duration::from_secs(60 * 15),
            backoff_floor: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(60 * 60 * 6),
            fetch_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum Control {
    FeedsChanged,
    Rerun(i64),
    RerunFailing,
}

/// Cheap cloneable handle the HTTP surface uses to poke the engine. All
/// methods are non-blocking and quietly drop the signal when the engine has
/// already shut down.
#[derive(Clone)]
pub struct FetchHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl FetchHandle {
    /// A feed was added, edited, or disabled in a way that affects polling.
    pub fn inform_feed_changed(&self) {
        let _ = self.tx.send(Control::FeedsChanged);
    }

    /// Fetch one feed now if its worker is waiting between polls.
    pub fn rerun_feed(&self, id: i64) {
        let _ = self.tx.send(Control::Rerun(id));
    }

    /// Wake every worker parked in failure backoff.
    pub fn rerun_failing(&self) {
        let _ = self.tx.send(Control::RerunFailing);
    }
}

struct FeedFailure {
    feed_id: i64,
    error: FetchError,
}

/// State shared between the supervisor and its workers. The locks are all
/// short-hold and never held across awaits.
pub(crate) struct Shared {
    options: EngineOptions,
    /// The current generation of the enabled-feed set. Workers re-read
    /// their feed from here each iteration instead of holding a borrow.
    feeds: StdRwLock<HashMap<i64, Feed>>,
    backoff: StdMutex<HashMap<i64, Duration>>,
    /// Per-host critical sections so one remote never sees concurrent
    /// requests from us. Keyed by DNS host, or by executable name for
    /// command feeds.
    hosts: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    rerun_failing: Notify,
}

impl Shared {
    fn feed(&self, id: i64) -> Option<Feed> {
        self.feeds.read().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    fn host_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.entry(key.to_owned()).or_default().clone()
    }

    fn reset_backoff(&self, id: i64) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = backoff.get_mut(&id) {
            *entry = self.options.backoff_floor;
        }
    }
}

struct WorkerChannels {
    kill: watch::Sender<bool>,
    rerun: mpsc::Sender<()>,
}

pub struct FetchEngine {
    store: Store,
    client: reqwest::Client,
    shared: Arc<Shared>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    error_tx: mpsc::Sender<FeedFailure>,
    error_rx: mpsc::Receiver<FeedFailure>,
    routines: HashMap<i64, WorkerChannels>,
    tasks: JoinSet<()>,
    last_polled: Option<Instant>,
}

impl FetchEngine {
    pub fn new(store: Store, options: EngineOptions) -> reqwest::Result<(Self, FetchHandle)> {
        let client = reqwest::Client::builder().timeout(options.fetch_timeout).build()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::channel(16);

        let engine = Self {
            store,
            client,
            shared: Arc::new(Shared {
                options,
                feeds: StdRwLock::default(),
                backoff: StdMutex::default(),
                hosts: StdMutex::default(),
                rerun_failing: Notify::new(),
            }),
            control_rx,
            error_tx,
            error_rx,
            routines: HashMap::new(),
            tasks: JoinSet::new(),
            last_polled: None,
        };
        Ok((engine, FetchHandle { tx: control_tx }))
    }

    /// The control loop. Runs until `shutdown` fires or the store fails
    /// underneath it, then drains the fleet and closes the store. Does not
    /// return until shutdown has completed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("fetch engine started");

        loop {
            if self.poll_due() {
                match self.reconcile().await {
                    Ok(()) => {}
                    Err(StoreError::Closed) if *shutdown.borrow() => break,
                    Err(error) => {
                        tracing::error!(%error, "reconciliation failed, shutting down");
                        break;
                    }
                }
            }

            let deadline = self.next_poll_deadline();
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                Some(failure) = self.error_rx.recv() => {
                    if self.handle_failure(failure, &shutdown) {
                        break;
                    }
                }
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(error) = result {
                        tracing::error!(%error, "worker task aborted abnormally");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        self.close().await;
    }

    fn poll_due(&self) -> bool {
        self.last_polled
            .is_none_or(|at| at.elapsed() >= self.shared.options.db_poll_period)
    }

    fn next_poll_deadline(&self) -> Instant {
        self.last_polled
            .map_or_else(Instant::now, |at| at + self.shared.options.db_poll_period)
    }

    /// Brings the worker fleet into agreement with the enabled-feed set:
    /// kills workers whose feeds left the set, spawns workers for new
    /// feeds, and swaps the shared map wholesale so worker lookups see the
    /// new generation.
    async fn reconcile(&mut self) -> Result<(), StoreError> {
        let feeds = self.store.current_feeds().await?;
        self.last_polled = Some(Instant::now());

        let desired: HashMap<i64, Feed> = feeds.into_iter().map(|f| (f.id(), f)).collect();
        tracing::debug!(feeds = desired.len(), "reconciling worker fleet");

        {
            let backoff = &self.shared.backoff;
            self.routines.retain(|id, channels| {
                if desired.contains_key(id) {
                    return true;
                }
                tracing::info!(feed_id = *id, "stopping worker for removed feed");
                let _ = channels.kill.send(true);
                backoff.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
                false
            });
        }

        let new: Vec<Feed> = desired
            .values()
            .filter(|f| !self.routines.contains_key(&f.id()))
            .cloned()
            .collect();
        for feed in new {
            let worker = self.spawn_channels(feed);
            self.tasks.spawn(worker.run());
        }

        *self.shared.feeds.write().unwrap_or_else(|e| e.into_inner()) = desired;
        Ok(())
    }

    /// Allocates a fresh kill/rerun pair for `feed` and registers it,
    /// replacing (and killing) any previous generation. The rerun side is
    /// never closed while registered, which keeps a queued restart from
    /// racing a new one.
    fn spawn_channels(&mut self, feed: Feed) -> Worker {
        let id = feed.id();
        tracing::debug!(feed = %feed, "starting worker");

        let (kill_tx, kill_rx) = watch::channel(false);
        let (rerun_tx, rerun_rx) = mpsc::channel(1);

        if let Some(old) = self
            .routines
            .insert(id, WorkerChannels { kill: kill_tx, rerun: rerun_tx })
        {
            let _ = old.kill.send(true);
        }
        self.shared
            .backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert(self.shared.options.backoff_floor);

        Worker::new(
            feed,
            self.store.clone(),
            self.client.clone(),
            self.shared.clone(),
            kill_rx,
            rerun_rx,
            self.error_tx.clone(),
        )
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::FeedsChanged => {
                // Rare enough that re-reading the whole feed set is simpler
                // than threading the changed feed through.
                self.last_polled = None;
            }
            Control::Rerun(id) => match self.routines.get(&id) {
                None => tracing::info!(feed_id = id, "cannot rerun feed, no worker running"),
                Some(channels) => match channels.rerun.try_send(()) {
                    Ok(()) => tracing::info!(feed_id = id, "rerunning feed on user request"),
                    Err(TrySendError::Full(())) => {
                        tracing::debug!(feed_id = id, "rerun already scheduled");
                    }
                    Err(TrySendError::Closed(())) => {
                        tracing::warn!(feed_id = id, "worker dropped its rerun channel");
                    }
                },
            },
            Control::RerunFailing => {
                tracing::info!("rerunning all failing feeds");
                self.shared.rerun_failing.notify_waiters();
            }
        }
    }

    /// Routes one worker failure: doubles that feed's backoff (capped), or
    /// pins it to the cap for WAF blocks, and parks a restart that will
    /// resume the worker after the delay unless killed or poked first.
    /// Returns true when the failure is fatal to the engine.
    fn handle_failure(&mut self, failure: FeedFailure, shutdown: &watch::Receiver<bool>) -> bool {
        let FeedFailure { feed_id, error } = failure;

        if let FetchError::Store(StoreError::Closed) = &error {
            if *shutdown.borrow() {
                return false;
            }
            tracing::error!(feed_id, "store closed outside shutdown, stopping engine");
            return true;
        }

        let Some(feed) = self.shared.feed(feed_id) else {
            tracing::warn!(feed_id, "failure reported for feed with no worker");
            return false;
        };

        let options = &self.shared.options;
        let delay = {
            let mut backoff = self.shared.backoff.lock().unwrap_or_else(|e| e.into_inner());
            let current = *backoff.get(&feed_id).unwrap_or(&options.backoff_floor);
            let delay = if error.is_waf() { options.backoff_cap } else { current };
            backoff.insert(feed_id, (delay * 2).min(options.backoff_cap));
            delay
        };

        tracing::warn!(feed = %feed, %error, ?delay, "worker failed, restarting after backoff");
        let worker = self.spawn_channels(feed);
        self.tasks.spawn(worker.run_after(delay));
        false
    }

    /// Kills the fleet, waits out the drain timeout, and closes the store.
    async fn close(&mut self) {
        tracing::info!("fetch engine closing");

        for (_, channels) in self.routines.drain() {
            let _ = channels.kill.send(true);
        }
        self.shared.feeds.write().unwrap_or_else(|e| e.into_inner()).clear();

        let drain_timeout = self.shared.options.drain_timeout;
        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(()) => tracing::info!("all workers exited"),
            Err(_) => {
                tracing::error!(?drain_timeout, "some workers failed to exit in time");
                self.tasks.abort_all();
            }
        }

        self.store.close().await;
        tracing::info!("fetch engine closed");
    }
}
