//! Self-healing watchdog for interception rules
//!
//! [`RuleWatchdog`] runs one background reconciliation task at a time. Every
//! tick the task asks an injected check whether the interception rules are
//! still loaded, and runs an injected reload action when they are not.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Active --stop / start--> Stopping --task exits--> Idle
//! ```
//!
//! Stopping a task is cooperative: the owner sends one value on the task's
//! single-slot cancel channel, waiting at most [`WatchdogConfig::handoff_timeout`]
//! for the send, then drops the sender. The task observes cancellation only
//! at the top of its wait, so an in-flight check or reload always completes.
//! The hand-off is bounded and never joins the old task; across a restart the
//! old and new tasks may overlap for a moment.
//!
//! # Example
//!
//! ```no_run
//! use fwwatch::core::watchdog::{RuleWatchdog, WatchdogConfig};
//!
//! # async fn example() {
//! let watchdog = RuleWatchdog::new(WatchdogConfig::default());
//! watchdog.start(|| true, || println!("reloading rules")).await;
//! // ...
//! watchdog.stop().await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default time between reconciliation ticks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on delivering a stop signal to a running task
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_millis(5);

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tunables for the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Time between reconciliation ticks. The first tick fires one full
    /// interval after start.
    pub check_interval: Duration,
    /// Maximum wait when signalling a task to stop
    pub handoff_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

/// Observable watchdog state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum WatchdogState {
    /// No task running and no handle held
    Idle,
    /// A task is owned and ticking
    Active,
    /// The handle was released but a cancelled task has not exited yet
    Stopping,
}

type LoadedCheck = Arc<dyn Fn() -> bool + Send + Sync>;
type ReloadAction = Arc<dyn Fn() + Send + Sync>;

/// Owner's side of one running reconciliation task
struct TaskHandle {
    generation: u64,
    cancel: mpsc::Sender<()>,
}

impl TaskHandle {
    /// Delivers the stop signal, waiting at most `bound`.
    ///
    /// Returns `false` only when the send timed out. A task that already
    /// exited counts as delivered.
    async fn signal(&self, bound: Duration) -> bool {
        match tokio::time::timeout(bound, self.cancel.send(())).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(generation = self.generation, "Watchdog task already exited");
                true
            }
            Err(_) => false,
        }
    }
}

/// Periodically verifies interception rules and reloads them when missing
pub struct RuleWatchdog {
    config: WatchdogConfig,
    handle: Mutex<Option<TaskHandle>>,
    generation: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl RuleWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Starts monitoring the interception rules.
    ///
    /// Any previous task is stopped first with the bounded hand-off. The new
    /// task is spawned on the current tokio runtime and this call returns
    /// without waiting for its first tick. Both callbacks run on the blocking
    /// pool; `reload` is called only on ticks where `is_loaded` returns
    /// `false`.
    pub async fn start<C, R>(&self, is_loaded: C, reload: R)
    where
        C: Fn() -> bool + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let mut slot = self.handle.lock().await;

        if let Some(previous) = slot.take() {
            if !previous.signal(self.config.handoff_timeout).await {
                error!(
                    generation = previous.generation,
                    "Timed out stopping previous rule watchdog"
                );
            }
            // Dropping the handle closes the old channel, which also ends the
            // old task if the signal never arrived.
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        let period = self.config.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task = ReconcileTask {
            generation,
            ticker,
            cancel: cancel_rx,
            is_loaded: Arc::new(is_loaded),
            reload: Arc::new(reload),
            _live: LiveTask::enter(&self.live),
        };
        tokio::spawn(task.run());

        *slot = Some(TaskHandle {
            generation,
            cancel: cancel_tx,
        });

        info!(generation, interval = ?period, "Started checking firewall rules");
    }

    /// Stops monitoring the interception rules. No-op when idle.
    ///
    /// The handle is always cleared, even when the stop signal could not be
    /// delivered within the hand-off bound.
    pub async fn stop(&self) {
        let mut slot = self.handle.lock().await;

        let Some(current) = slot.take() else {
            return;
        };

        if current.signal(self.config.handoff_timeout).await {
            debug!(generation = current.generation, "Stop signal delivered");
        } else {
            // A fresh single-slot channel always has room for one signal
            error!(
                generation = current.generation,
                "Timed out stopping rule watchdog"
            );
        }
        drop(current);
    }

    /// Returns `true` while a task handle is held
    pub async fn is_active(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Number of reconciliation tasks that have not exited yet
    pub fn running_tasks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> WatchdogState {
        if self.is_active().await {
            WatchdogState::Active
        } else if self.running_tasks() > 0 {
            WatchdogState::Stopping
        } else {
            WatchdogState::Idle
        }
    }

    /// Waits up to `bound` for every cancelled task to exit.
    ///
    /// Call after [`stop`](Self::stop) when nothing may touch the rules
    /// afterwards: a check or reload in flight at stop time still runs to
    /// completion. Returns `false` if tasks were still live at the deadline.
    pub async fn wait_idle(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        while self.running_tasks() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        true
    }
}

impl Default for RuleWatchdog {
    fn default() -> Self {
        Self::new(WatchdogConfig::default())
    }
}

/// Counts a task as live until dropped
struct LiveTask(Arc<AtomicUsize>);

impl LiveTask {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ReconcileTask {
    generation: u64,
    ticker: Interval,
    cancel: mpsc::Receiver<()>,
    is_loaded: LoadedCheck,
    reload: ReloadAction,
    _live: LiveTask,
}

impl ReconcileTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                signal = self.cancel.recv() => {
                    if signal.is_none() {
                        debug!(generation = self.generation, "Watchdog channel closed");
                    }
                    break;
                }
                _ = self.ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        info!(generation = self.generation, "Exit checking firewall rules");
    }

    /// One reconciliation tick
    async fn reconcile(&self) {
        let check = Arc::clone(&self.is_loaded);
        let loaded = match tokio::task::spawn_blocking(move || check()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(generation = self.generation, "Rule check failed: {e}");
                return;
            }
        };

        if loaded {
            debug!(generation = self.generation, "Interception rules present");
            return;
        }

        warn!(
            generation = self.generation,
            "Interception rules missing, reloading"
        );
        let reload = Arc::clone(&self.reload);
        if let Err(e) = tokio::task::spawn_blocking(move || reload()).await {
            error!(generation = self.generation, "Rule reload failed: {e}");
        }
    }
}
