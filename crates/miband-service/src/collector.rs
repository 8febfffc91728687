//! Background poller.
//!
//! [`PollScheduler`] runs one task per configured band. Each task ticks at
//! the band's poll interval and asks its [`DevicePoller`] to refresh; the
//! poller skips refreshes that come sooner than the band's minimum interval
//! after the previous one. Scheduled refreshes are measured from their tick
//! deadline, so a late wakeup never pushes the next tick into the throttle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use miband_core::{
    BleLink, DeviceSession, RadioLink, RefreshOutcome, SharedSession, SnapshotStore,
};

use crate::config::{Config, ConfigError, DeviceConfig, ValidationError};
use crate::sensors::{SensorReading, sensor_readings};

/// Consecutive failures logged at `warn` before going quiet.
const LOUD_FAILURES: u32 = 3;

/// Refreshes one band, at most once per `min_interval`.
pub struct DevicePoller<L: RadioLink> {
    name: String,
    session: SharedSession<L>,
    poll_interval: Duration,
    min_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
}

impl<L: RadioLink> std::fmt::Debug for DevicePoller<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePoller")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("poll_interval", &self.poll_interval)
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

impl<L: RadioLink> DevicePoller<L> {
    /// Create a poller for `session`.
    pub fn new(
        name: impl Into<String>,
        session: DeviceSession<L>,
        poll_interval: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            session: Arc::new(session),
            poll_interval,
            min_interval,
            last_refresh: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Configured band name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The band's session.
    pub fn session(&self) -> &SharedSession<L> {
        &self.session
    }

    /// Snapshot the session writes to.
    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        self.session.snapshot()
    }

    /// Current named sensor values.
    pub fn sensors(&self) -> Vec<SensorReading> {
        sensor_readings(&self.name, self.snapshot())
    }

    /// Failed refreshes since the last one that produced anything.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Refresh unless the previous refresh started less than `min_interval`
    /// ago. Returns `None` when throttled.
    pub async fn poll(&self) -> Option<RefreshOutcome> {
        self.poll_at(Instant::now()).await
    }

    /// Like [`poll`](Self::poll), treating `at` as the refresh start.
    ///
    /// The scheduler passes its tick deadline here.
    pub async fn poll_at(&self, at: Instant) -> Option<RefreshOutcome> {
        if !self.claim_slot(at) {
            debug!("{}: refreshed recently, skipping", self.name);
            return None;
        }

        let outcome = self.session.refresh().await;
        self.record(outcome);
        Some(outcome)
    }

    fn claim_slot(&self, at: Instant) -> bool {
        let mut last = self
            .last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *last
            && at.saturating_duration_since(previous) < self.min_interval
        {
            return false;
        }
        *last = Some(at);
        true
    }

    fn record(&self, outcome: RefreshOutcome) {
        if outcome.produced_any() {
            let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
            if failures > LOUD_FAILURES {
                info!("{}: recovered after {} failed polls", self.name, failures);
            }
            if outcome == RefreshOutcome::PartialFailure {
                warn!("{}: refresh produced partial data", self.name);
            }
            for sensor in self.sensors() {
                info!("{}", sensor);
            }
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures <= LOUD_FAILURES {
            warn!("{}: poll failed (attempt {})", self.name, failures);
        } else if failures == LOUD_FAILURES + 1 {
            error!(
                "{}: poll failed {} times in a row, will continue trying silently",
                self.name, failures
            );
        } else {
            debug!("{}: poll failed ({} in a row)", self.name, failures);
        }
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting poller for {} ({}, interval: {:?})",
            self.name,
            self.session.link().address(),
            self.poll_interval
        );

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = tokio::select! {
                _ = shutdown.cancelled() => break,
                deadline = timer.tick() => deadline,
            };
            self.poll_at(deadline).await;
        }

        debug!("Poller for {} stopped", self.name);
    }
}

/// Runs a [`DevicePoller`] task per band until shut down.
pub struct PollScheduler<L: RadioLink> {
    pollers: Vec<Arc<DevicePoller<L>>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PollScheduler<BleLink> {
    /// Build BLE pollers for every configured band.
    ///
    /// Sessions are cancelled through children of `shutdown`.
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Result<Self, ConfigError> {
        let pollers = config
            .devices
            .iter()
            .map(|device| ble_poller(config, device, &shutdown))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(pollers, shutdown))
    }
}

/// Cancel `shutdown` when `signal` completes.
///
/// Sessions built from children of `shutdown` then abort their refresh and
/// disconnect. Abort the returned task once the work is done.
pub fn cancel_on<F>(signal: F, shutdown: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Interrupted, disconnecting");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    })
}

/// A BLE poller for one configured band.
pub fn ble_poller(
    config: &Config,
    device: &DeviceConfig,
    shutdown: &CancellationToken,
) -> Result<DevicePoller<BleLink>, ConfigError> {
    let link = BleLink::new(device.device_address()?, config.link.to_link_config());
    let session = DeviceSession::new(
        link,
        config.session.to_session_config(device.activity),
        Arc::new(SnapshotStore::new()),
    )
    .map_err(|e| {
        ConfigError::Validation(vec![ValidationError {
            field: "session".to_string(),
            message: e.to_string(),
        }])
    })?
    .with_cancellation(shutdown.child_token());

    Ok(DevicePoller::new(
        device.name.clone(),
        session,
        device.poll_interval(),
        device.min_interval(),
    ))
}

impl<L: RadioLink + 'static> PollScheduler<L> {
    /// Create a scheduler; nothing runs until [`start`](Self::start).
    pub fn new(pollers: Vec<DevicePoller<L>>, shutdown: CancellationToken) -> Self {
        Self {
            pollers: pollers.into_iter().map(Arc::new).collect(),
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// The pollers, in configuration order.
    pub fn pollers(&self) -> &[Arc<DevicePoller<L>>] {
        &self.pollers
    }

    /// Spawn one polling task per band.
    pub fn start(&mut self) {
        if self.pollers.is_empty() {
            info!("No devices configured for polling");
            return;
        }

        info!("Starting poller for {} device(s)", self.pollers.len());
        for poller in &self.pollers {
            let task = tokio::spawn(Arc::clone(poller).run(self.shutdown.clone()));
            self.tasks.push(task);
        }
    }

    /// Cancel every session and wait for the tasks to finish.
    ///
    /// In-flight refreshes still disconnect their link.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for poller in &self.pollers {
            poller.session.cancel();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Poller task failed: {}", e);
            }
        }
        info!("All pollers stopped");
    }
}
