use crate::config::{validate_interval, PollingConfig};
use crate::device_client::{DeviceClient, DeviceReading};
use crate::error::{EcotrackerError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Everything sensor entities may look at, published after every fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorState {
    pub config: PollingConfig,
    /// Last good reading; kept across failed fetches
    pub reading: Option<DeviceReading>,
    /// Error of the most recent fetch, cleared by the next success
    pub last_error: Option<EcotrackerError>,
    pub consecutive_failures: u32,
}

impl CoordinatorState {
    fn new(config: PollingConfig) -> Self {
        Self {
            config,
            reading: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    pub fn last_update_success(&self) -> bool {
        self.last_error.is_none()
    }
}

/// Polls one device on a fixed cadence and caches the latest reading.
///
/// The cadence is re-armed after each fetch completes, so a slow device
/// stretches the cycle instead of stacking requests. All fetches (scheduled
/// or requested through [`Coordinator::refresh`]) go through one lock, and a
/// caller that finds a fetch in flight waits for it rather than issuing its own.
/// Holding that lock across fetch and commit is what keeps commits in fetch
/// order.
pub struct Coordinator {
    client: Arc<dyn DeviceClient>,
    state: watch::Sender<CoordinatorState>,
    interval: watch::Sender<u32>,
    completed_at: watch::Sender<Instant>,
    fetch_lock: Mutex<()>,
    finished_fetches: AtomicU64,
    started: AtomicBool,
    active: AtomicBool,
    shutdown: Notify,
}

impl Coordinator {
    /// Fails with a validation error when `config` bypassed [`PollingConfig::new`]
    /// and carries an empty address or an out-of-range interval.
    pub fn new(config: PollingConfig, client: Arc<dyn DeviceClient>) -> Result<Arc<Self>> {
        config.validate()?;
        let (interval, _) = watch::channel(config.scan_interval);
        let (state, _) = watch::channel(CoordinatorState::new(config));
        let (completed_at, _) = watch::channel(Instant::now());
        Ok(Arc::new(Self {
            client,
            state,
            interval,
            completed_at,
            fetch_lock: Mutex::new(()),
            finished_fetches: AtomicU64::new(0),
            started: AtomicBool::new(false),
            active: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    /// Performs the first fetch, then keeps polling in a background task.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(address = %self.address(), "Coordinator already started");
            return;
        }
        self.active.store(true, Ordering::SeqCst);
        info!(
            address = %self.address(),
            interval = self.config().scan_interval,
            "Starting Ecotracker polling"
        );

        self.refresh().await;
        tokio::spawn(Arc::clone(self).run());
    }

    /// Cancels the pending tick. A fetch still in flight may finish, but its
    /// result is dropped.
    pub fn stop(&self) {
        self.started.store(true, Ordering::SeqCst);
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        // Commits check `active` under the state write lock; taking that lock
        // here waits out a commit that is already past the check.
        self.state.send_if_modified(|_| false);
        self.shutdown.notify_one();
        info!(address = %self.address(), "Stopped Ecotracker polling");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Changes the cadence; the pending tick is re-armed from the last completion.
    pub fn update_interval(&self, seconds: u32) -> Result<()> {
        let seconds = validate_interval(i64::from(seconds))?;
        self.state.send_if_modified(|state| {
            state.config.scan_interval = seconds;
            false
        });
        self.interval.send_replace(seconds);
        info!(address = %self.address(), interval = seconds, "Updated polling interval");
        Ok(())
    }

    pub fn config(&self) -> PollingConfig {
        self.state.borrow().config.clone()
    }

    pub fn current_reading(&self) -> Option<DeviceReading> {
        self.state.borrow().reading.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    /// Receiver that is notified after every committed fetch, failed or not.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Fetches now unless another fetch is already running, in which case
    /// this waits for that one to finish.
    pub async fn refresh(&self) {
        let seen = self.finished_fetches.load(Ordering::SeqCst);
        let _guard = self.fetch_lock.lock().await;
        if self.finished_fetches.load(Ordering::SeqCst) != seen {
            debug!(address = %self.address(), "Joined fetch already in flight");
            return;
        }
        if !self.is_active() {
            return;
        }

        let config = self.config();
        let result = self
            .client
            .fetch(&config.address, config.request_timeout())
            .await;
        self.finished_fetches.fetch_add(1, Ordering::SeqCst);

        if !self.commit(result) {
            debug!(address = %config.address, "Discarded fetch result");
        }
        self.completed_at.send_replace(Instant::now());
    }

    fn commit(&self, result: Result<DeviceReading>) -> bool {
        self.state.send_if_modified(|state| {
            if !self.active.load(Ordering::SeqCst) {
                return false;
            }
            match result {
                Ok(reading) => {
                    if state.consecutive_failures > 0 {
                        info!(address = %state.config.address, "Fetching Ecotracker data recovered");
                    }
                    debug!(
                        address = %state.config.address,
                        power_w = reading.power_w,
                        energy_in_kwh = reading.energy_in_kwh,
                        energy_out_kwh = reading.energy_out_kwh,
                        "Fetched reading"
                    );
                    state.reading = Some(reading);
                    state.last_error = None;
                    state.consecutive_failures = 0;
                }
                Err(err) => {
                    if state.last_error.is_none() {
                        warn!(address = %state.config.address, error = %err, "Error fetching Ecotracker data");
                    } else {
                        debug!(
                            address = %state.config.address,
                            error = %err,
                            failures = state.consecutive_failures + 1,
                            "Ecotracker still unreachable"
                        );
                    }
                    state.last_error = Some(err);
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                }
            }
            true
        })
    }

    // Re-arms from the latest completion, whether the fetch was scheduled or manual.
    async fn run(self: Arc<Self>) {
        let mut interval_rx = self.interval.subscribe();
        let mut completed_rx = self.completed_at.subscribe();

        loop {
            let seconds = *interval_rx.borrow_and_update();
            let completed_at = *completed_rx.borrow_and_update();
            let deadline = completed_at + Duration::from_secs(u64::from(seconds));
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.shutdown.notified() => break,
                Ok(()) = interval_rx.changed() => continue,
                Ok(()) = completed_rx.changed() => continue,
            }
            if !self.is_active() {
                break;
            }
            self.refresh().await;
        }

        debug!(address = %self.address(), "Polling task exiting");
    }

    fn address(&self) -> String {
        self.state.borrow().config.address.clone()
    }
}
