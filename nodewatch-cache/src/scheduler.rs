//! Background Refresh Scheduler
//!
//! Keeps hot cache keys warm independently of request traffic. Each
//! registered task re-fetches its key on a fixed interval through
//! [`TtlCache::refresh`], so scheduled refreshes share the singleflight path
//! with client reads.
//!
//! A single loop ticks at a fixed resolution and starts every task that is
//! due. A task still running when it comes due again skips that tick; ticks
//! are never queued. A failed run records its error and leaves the previously
//! cached value in place.

use crate::traits::Fetcher;
use crate::ttl::TtlCache;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nodewatch_core::ConfigError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Default scheduler tick resolution in milliseconds.
const DEFAULT_TICK_MS: u64 = 250;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the refresh scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop checks for due tasks (default: 250ms).
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Snapshot of one registered refresh task.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshTaskStatus {
    pub key: String,
    pub interval_ms: u64,
    pub ttl_ms: u64,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
}

#[derive(Debug)]
struct TaskState {
    next_due: Instant,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    runs: u64,
    failures: u64,
    skipped_ticks: u64,
}

struct RefreshTask<V> {
    key: String,
    interval: Duration,
    ttl: Duration,
    fetcher: Arc<dyn Fetcher<V>>,
    running: AtomicBool,
    state: Mutex<TaskState>,
}

impl<V> RefreshTask<V> {
    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> RefreshTaskStatus {
        let state = self.state();
        RefreshTaskStatus {
            key: self.key.clone(),
            interval_ms: self.interval.as_millis() as u64,
            ttl_ms: self.ttl.as_millis() as u64,
            running: self.running.load(Ordering::Acquire),
            last_run_at: state.last_run_at,
            last_success_at: state.last_success_at,
            last_error: state.last_error.clone(),
            runs: state.runs,
            failures: state.failures,
            skipped_ticks: state.skipped_ticks,
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Periodically refreshes registered cache keys.
pub struct RefreshScheduler<V> {
    cache: TtlCache<V>,
    tasks: DashMap<String, Arc<RefreshTask<V>>>,
    config: SchedulerConfig,
}

impl<V> RefreshScheduler<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: TtlCache<V>, config: SchedulerConfig) -> Self {
        Self {
            cache,
            tasks: DashMap::new(),
            config,
        }
    }

    pub fn cache(&self) -> &TtlCache<V> {
        &self.cache
    }

    /// Register a key for periodic refresh. The first run is due immediately.
    ///
    /// Registering a key again replaces its task.
    pub fn register(
        &self,
        key: impl Into<String>,
        interval: Duration,
        ttl: Duration,
        fetcher: Arc<dyn Fetcher<V>>,
    ) -> Result<(), ConfigError> {
        let key = key.into();
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                value: format!("{:?}", interval),
                reason: format!("refresh interval for {} must be greater than zero", key),
            });
        }

        let task = RefreshTask {
            key: key.clone(),
            interval,
            ttl,
            fetcher,
            running: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                next_due: Instant::now(),
                last_run_at: None,
                last_success_at: None,
                last_error: None,
                runs: 0,
                failures: 0,
                skipped_ticks: 0,
            }),
        };

        tracing::info!(
            key = %key,
            interval_ms = interval.as_millis() as u64,
            "Refresh task registered"
        );
        self.tasks.insert(key, Arc::new(task));
        Ok(())
    }

    /// Stop refreshing `key`. A run already in progress finishes.
    pub fn unregister(&self, key: &str) -> bool {
        self.tasks.remove(key).is_some()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn status(&self, key: &str) -> Option<RefreshTaskStatus> {
        self.tasks.get(key).map(|task| task.status())
    }

    /// Snapshots of every registered task, ordered by key.
    pub fn statuses(&self) -> Vec<RefreshTaskStatus> {
        let mut statuses: Vec<_> = self.tasks.iter().map(|task| task.status()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Start every task due at `now`. Returns the number of runs started.
    ///
    /// A due task whose previous run is still active has the tick counted in
    /// `skipped_ticks` instead.
    pub fn run_due(&self, now: Instant) -> usize {
        let due: Vec<Arc<RefreshTask<V>>> = self
            .tasks
            .iter()
            .filter(|task| task.state().next_due <= now)
            .map(|task| Arc::clone(task.value()))
            .collect();

        let mut started = 0;
        for task in due {
            {
                let mut state = task.state();
                if state.next_due > now {
                    continue;
                }
                state.next_due = now + task.interval;

                if task.running.swap(true, Ordering::AcqRel) {
                    state.skipped_ticks += 1;
                    tracing::debug!(key = %task.key, "Refresh still running, tick skipped");
                    continue;
                }
                state.last_run_at = Some(Utc::now());
                state.runs += 1;
            }

            started += 1;
            self.spawn_run(task);
        }
        started
    }

    fn spawn_run(&self, task: Arc<RefreshTask<V>>) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let fetcher = Arc::clone(&task.fetcher);
            let key = task.key.clone();
            let result = cache
                .refresh(&task.key, task.ttl, move || async move { fetcher.fetch(&key).await })
                .await;

            {
                let mut state = task.state();
                match result {
                    Ok(_) => {
                        state.last_success_at = Some(Utc::now());
                        state.last_error = None;
                    }
                    Err(err) => {
                        state.failures += 1;
                        tracing::warn!(key = %task.key, error = %err, "Scheduled refresh failed");
                        state.last_error = Some(err.to_string());
                    }
                }
            }
            task.running.store(false, Ordering::Release);
        });
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_ms = self.config.tick.as_millis() as u64,
            tasks = self.tasks.len(),
            "Refresh scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Refresh scheduler shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_due(Instant::now());
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}
