//! The per-device refresh state machine.
//!
//! A [`DeviceSession`] owns one [`RadioLink`] and runs refresh cycles
//! against it: connect with a bounded budget, let the link settle, read the
//! battery level, subscribe to activity notifications and wait for one,
//! then disconnect. A cycle that fails at the link level is restarted as a
//! whole, up to its own budget. Every cycle ends with exactly one
//! `disconnect()`, whichever path it took.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use miband_core::{DeviceSession, MockLink, RefreshOutcome, SessionConfig, SnapshotStore};
//!
//! #[tokio::main(flavor = "current_thread", start_paused = true)]
//! async fn main() {
//!     let link = MockLink::builder().battery(73).activity(4200, 3100, 160).build();
//!     let snapshot = Arc::new(SnapshotStore::new());
//!     let session = DeviceSession::new(link, SessionConfig::default(), Arc::clone(&snapshot))
//!         .expect("valid config");
//!
//!     assert_eq!(session.refresh().await, RefreshOutcome::Success);
//!     assert_eq!(snapshot.battery().map(|b| b.percent), Some(73));
//!     assert_eq!(snapshot.activity().map(|a| a.steps), Some(4200));
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use miband_types::uuid::{
    ACTIVITY, BATTERY_LEVEL, DEVICE_NAME, HARDWARE_REVISION, SERIAL_NUMBER, SOFTWARE_REVISION,
};
use miband_types::{BatteryReading, DecodeError, DeviceInfo, Reading, ReadingKind};

use crate::error::{Error, LinkError, Result};
use crate::events::{EventDispatcher, EventReceiver, SessionEvent};
use crate::link::{ActivityHandles, AttributeTable, ConnectMode, RadioLink};
use crate::metrics::{SessionMetrics, SessionMetricsSummary};
use crate::retry::{RetryPolicy, Retryable, with_retry};
use crate::router::{DEFAULT_WAKEUP_CAPACITY, NotificationRouter, WakePolicy, Wakeup};
use crate::snapshot::SnapshotStore;

/// Default time to wait for a non-blocking connect to be confirmed.
pub const DEFAULT_CONNECT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(9);

/// Default interval between connection checks while confirming a connect.
pub const DEFAULT_CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default pause between connecting and the first read.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default time to wait for an activity notification.
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between link checks while waiting for a notification.
pub const DEFAULT_NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Establishing the connection.
    Connecting,
    /// Connected; reading.
    Connected,
    /// Subscribed; waiting for activity data.
    AwaitingNotification,
    /// Tearing down the connection.
    Disconnecting,
    /// The last refresh failed.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AwaitingNotification => "awaiting notification",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of one [`DeviceSession::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Every requested reading was produced.
    Success,
    /// Some requested readings were produced.
    PartialFailure,
    /// Nothing was produced, or the refresh gave up.
    Failure,
}

impl RefreshOutcome {
    /// Whether at least one reading was produced.
    pub fn produced_any(self) -> bool {
        !matches!(self, Self::Failure)
    }
}

/// Timing and retry configuration of a [`DeviceSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Connect attempts within one cycle.
    pub connect: RetryPolicy,
    /// Attempts per characteristic read.
    pub read: RetryPolicy,
    /// Whole-cycle restarts after a link failure.
    pub cycle: RetryPolicy,
    /// How connects are issued.
    pub connect_mode: ConnectMode,
    /// Upper bound on confirming a non-blocking connect.
    pub connect_confirm_timeout: Duration,
    /// Interval between connection checks while confirming.
    pub connect_poll_interval: Duration,
    /// Pause after connecting before the first read.
    pub settle_delay: Duration,
    /// Upper bound on waiting for an activity notification.
    pub notification_timeout: Duration,
    /// Interval between link checks while waiting.
    pub notification_poll_interval: Duration,
    /// Whether to subscribe for activity data at all.
    pub want_activity: bool,
    /// Which notifications end the wait.
    pub wake_policy: WakePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::for_connect(),
            read: RetryPolicy::for_read(),
            cycle: RetryPolicy::for_cycle(),
            connect_mode: ConnectMode::default(),
            connect_confirm_timeout: DEFAULT_CONNECT_CONFIRM_TIMEOUT,
            connect_poll_interval: DEFAULT_CONNECT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            notification_poll_interval: DEFAULT_NOTIFICATION_POLL_INTERVAL,
            want_activity: true,
            wake_policy: WakePolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Battery level only; no notification wait.
    pub fn battery_only() -> Self {
        Self::default().want_activity(false)
    }

    /// Short timeouts and budgets for bands that are close and awake.
    pub fn quick() -> Self {
        Self {
            connect: RetryPolicy::fixed(2, Duration::from_secs(1)),
            cycle: RetryPolicy::fixed(3, Duration::from_secs(1)),
            settle_delay: Duration::from_millis(250),
            notification_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    // ==================== Builder Methods ====================

    /// Set the connect retry policy.
    #[must_use]
    pub fn connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect = policy;
        self
    }

    /// Set the read retry policy.
    #[must_use]
    pub fn read_policy(mut self, policy: RetryPolicy) -> Self {
        self.read = policy;
        self
    }

    /// Set the whole-cycle retry policy.
    #[must_use]
    pub fn cycle_policy(mut self, policy: RetryPolicy) -> Self {
        self.cycle = policy;
        self
    }

    /// Set the connect mode.
    #[must_use]
    pub fn connect_mode(mut self, mode: ConnectMode) -> Self {
        self.connect_mode = mode;
        self
    }

    /// Set the non-blocking connect confirmation timeout.
    #[must_use]
    pub fn connect_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.connect_confirm_timeout = timeout;
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the notification timeout.
    #[must_use]
    pub fn notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Enable or disable the activity subscription.
    #[must_use]
    pub fn want_activity(mut self, want: bool) -> Self {
        self.want_activity = want;
        self
    }

    /// Set the wake policy.
    #[must_use]
    pub fn wake_policy(mut self, policy: WakePolicy) -> Self {
        self.wake_policy = policy;
        self
    }

    /// Check the configuration for nonsensical values.
    pub fn validate(&self) -> Result<()> {
        self.connect.validate()?;
        self.read.validate()?;
        self.cycle.validate()?;

        if self.connect_mode == ConnectMode::NonBlocking {
            if self.connect_confirm_timeout.is_zero() {
                return Err(Error::invalid_config(
                    "connect_confirm_timeout must be > 0 for non-blocking connects",
                ));
            }
            if self.connect_poll_interval.is_zero() {
                return Err(Error::invalid_config("connect_poll_interval must be > 0"));
            }
        }
        if self.want_activity {
            if self.notification_timeout.is_zero() {
                return Err(Error::invalid_config("notification_timeout must be > 0"));
            }
            if self.notification_poll_interval.is_zero() {
                return Err(Error::invalid_config(
                    "notification_poll_interval must be > 0",
                ));
            }
        }
        Ok(())
    }

    fn requested(&self) -> usize {
        if self.want_activity { 2 } else { 1 }
    }
}

/// Link error seen through the read budget: a dropped link is not worth
/// retrying on the same connection.
struct LiveLinkError(LinkError);

impl Retryable for LiveLinkError {
    fn is_retryable(&self) -> bool {
        !self.0.is_connection_lost() && self.0.is_retryable()
    }
}

impl std::fmt::Display for LiveLinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Readings produced during one refresh.
#[derive(Debug, Default)]
struct Produced {
    battery: AtomicBool,
    activity: AtomicBool,
}

impl Produced {
    fn mark(&self, kind: ReadingKind) {
        let flag = match kind {
            ReadingKind::BatteryLevel => &self.battery,
            ReadingKind::Activity => &self.activity,
        };
        flag.store(true, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        usize::from(self.battery.load(Ordering::SeqCst))
            + usize::from(self.activity.load(Ordering::SeqCst))
    }
}

/// Discovered attribute table and the activity handles derived from it.
#[derive(Debug, Clone)]
struct HandleCache {
    table: AttributeTable,
    handles: ActivityHandles,
}

/// How a notification wait ended without a link failure.
enum WaitResult {
    Woke(Wakeup),
    TimedOut,
}

/// A polling session with one band.
///
/// Share it as `Arc<DeviceSession<L>>`; all methods take `&self`. At most one
/// refresh runs at a time; concurrent callers queue.
pub struct DeviceSession<L: RadioLink> {
    link: L,
    config: SessionConfig,
    snapshot: Arc<SnapshotStore>,
    state: watch::Sender<SessionState>,
    cycle_lock: Mutex<()>,
    handle_cache: StdMutex<Option<HandleCache>>,
    cancel: CancellationToken,
    events: EventDispatcher,
    metrics: SessionMetrics,
}

impl<L: RadioLink> std::fmt::Debug for DeviceSession<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", self.link.address())
            .field("state", &self.state())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<L: RadioLink> DeviceSession<L> {
    /// Create a session that writes into `snapshot`.
    ///
    /// Fails with [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(link: L, config: SessionConfig, snapshot: Arc<SnapshotStore>) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            link,
            config,
            snapshot,
            state,
            cycle_lock: Mutex::new(()),
            handle_cache: StdMutex::new(None),
            cancel: CancellationToken::new(),
            events: EventDispatcher::default(),
            metrics: SessionMetrics::new(),
        })
    }

    /// Use `token` for cancellation, e.g. a child of a host shutdown token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // --- Accessors ---

    /// The underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The snapshot this session writes to.
    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        &self.snapshot
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Refresh and radio counters.
    pub fn metrics(&self) -> SessionMetricsSummary {
        self.metrics.summary()
    }

    /// Cancel the in-flight refresh, if any, and every later one.
    ///
    /// The interrupted cycle still disconnects.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Activity handles derived from the last discovered table.
    pub fn activity_handles(&self) -> Option<ActivityHandles> {
        self.lock_cache().as_ref().map(|cache| cache.handles)
    }

    /// Forget the cached attribute table so the next cycle re-derives handles.
    pub fn invalidate_handles(&self) {
        *self.lock_cache() = None;
    }

    // --- Operations ---

    /// Run one refresh: as many cycles as it takes to produce the readings,
    /// within the configured budgets.
    ///
    /// Never fails; the outcome says what was produced and the details are
    /// logged and published as [`SessionEvent`]s.
    #[tracing::instrument(level = "info", skip(self), fields(address = %self.link.address()))]
    pub async fn refresh(&self) -> RefreshOutcome {
        let _cycle = self.cycle_lock.lock().await;

        if self.cancel.is_cancelled() {
            debug!("Session cancelled, not refreshing");
            return self.finish(RefreshOutcome::Failure);
        }

        let started = Instant::now();
        let produced = Produced::default();
        let cycle_open = AtomicBool::new(false);
        let attempt = AtomicU32::new(0);

        let (produced, cycle_open, attempt) = (&produced, &cycle_open, &attempt);
        let cycles = async {
            with_retry(&self.config.cycle, "refresh cycle", || async move {
                let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
                if n > 1 {
                    self.metrics.record_cycle_retry();
                    info!(
                        "Restarting refresh cycle (attempt {}/{})",
                        n, self.config.cycle.max_attempts
                    );
                }
                cycle_open.store(true, Ordering::SeqCst);
                let result = self.cycle(produced).await;
                self.close_cycle(cycle_open).await;
                if let Err(e) = &result
                    && e.is_retryable()
                {
                    self.events.send(SessionEvent::CycleRetry {
                        device: self.link.address().clone(),
                        attempt: n,
                        error: e.to_string(),
                    });
                }
                result
            })
            .await
            .map_err(|failure| failure.error)
        };

        let result = self.guarded(cycle_open, cycles).await;

        let outcome = match result {
            Ok(()) if produced.count() == self.config.requested() => RefreshOutcome::Success,
            Ok(()) if produced.count() > 0 => RefreshOutcome::PartialFailure,
            Ok(()) => RefreshOutcome::Failure,
            Err(e) => {
                match &e {
                    Error::Cancelled => info!("Refresh cancelled"),
                    Error::ConnectExhausted { .. } => warn!("Refresh failed: {}", e),
                    _ => error!(
                        "Refresh failed after {} cycle(s): {}",
                        attempt.load(Ordering::SeqCst),
                        e
                    ),
                }
                RefreshOutcome::Failure
            }
        };

        debug!(
            "Refresh finished in {:?}: {:?}",
            started.elapsed(),
            outcome
        );
        self.finish(outcome)
    }

    /// Connect, read the device information strings, and disconnect.
    #[tracing::instrument(level = "info", skip(self), fields(address = %self.link.address()))]
    pub async fn identify(&self) -> Result<DeviceInfo> {
        let _cycle = self.cycle_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let cycle_open = AtomicBool::new(true);
        let body = async {
            let result = self.read_device_info().await;
            self.close_cycle(&cycle_open).await;
            result
        };
        let result = self.guarded(&cycle_open, body).await;

        self.set_state(if result.is_ok() {
            SessionState::Idle
        } else {
            SessionState::Failed
        });
        result
    }

    // --- Cycle internals ---

    /// Run `body` unless cancelled first; on cancellation close the cycle
    /// `body` left open.
    async fn guarded<T, F>(&self, cycle_open: &AtomicBool, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = body => r,
        };
        self.close_cycle(cycle_open).await;
        result
    }

    /// Disconnect if the current cycle has not done so yet.
    async fn close_cycle(&self, cycle_open: &AtomicBool) {
        if cycle_open.swap(false, Ordering::SeqCst) {
            self.set_state(SessionState::Disconnecting);
            if let Err(e) = self.link.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        }
    }

    /// One connect → read → wait cycle. The caller disconnects.
    async fn cycle(&self, produced: &Produced) -> Result<()> {
        self.connect().await?;

        if !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }

        let payload = self.read(BATTERY_LEVEL, "read battery").await?;
        match BatteryReading::from_bytes(&payload, OffsetDateTime::now_utc()) {
            Ok(reading) => {
                debug!("Battery level: {}%", reading.percent);
                self.store(Reading::Battery(reading), produced);
            }
            Err(e) => self.decode_failed(ReadingKind::BatteryLevel, &e),
        }

        if !self.config.want_activity {
            return Ok(());
        }

        let handles = self.resolve_handles().await?;
        let (router, mut wake_rx) = NotificationRouter::channel(
            handles.value,
            self.config.wake_policy,
            DEFAULT_WAKEUP_CAPACITY,
        );
        self.link
            .subscribe(handles.notify, router.into_callback())
            .await
            .inspect_err(|e| {
                if !e.is_connection_lost() {
                    // The table may have changed under us
                    self.invalidate_handles();
                }
            })?;

        self.set_state(SessionState::AwaitingNotification);
        match self.await_wakeup(&mut wake_rx).await? {
            WaitResult::Woke(Wakeup {
                sample: Some(sample),
                ..
            }) => {
                info!(
                    "Activity: {} steps, {} m, {} kcal",
                    sample.steps, sample.distance_m, sample.calories
                );
                self.store(Reading::Activity(sample), produced);
            }
            WaitResult::Woke(wakeup) if wakeup.handle == handles.value => {
                // The router already logged the decode failure
                self.metrics.record_decode_failure();
                self.events.send(SessionEvent::DecodeFailed {
                    device: self.link.address().clone(),
                    kind: ReadingKind::Activity,
                    error: "malformed activity notification".to_string(),
                });
            }
            WaitResult::Woke(wakeup) => {
                debug!(
                    "Woken by unrelated notification on {}; no activity data this cycle",
                    wakeup.handle
                );
            }
            WaitResult::TimedOut => {
                self.metrics.record_notification_timeout();
                warn!(
                    "No activity notification within {:?}",
                    self.config.notification_timeout
                );
            }
        }

        Ok(())
    }

    /// Connect within the connect budget.
    async fn connect(&self) -> Result<()> {
        self.set_state(SessionState::Connecting);

        with_retry(&self.config.connect, "connect", || self.connect_once())
            .await
            .map_err(|failure| Error::ConnectExhausted {
                attempts: failure.attempts,
                source: failure.error,
            })?;

        self.set_state(SessionState::Connected);
        Ok(())
    }

    async fn connect_once(&self) -> std::result::Result<(), LinkError> {
        let started = Instant::now();
        let result = async {
            self.link.connect(self.config.connect_mode).await?;
            if self.config.connect_mode == ConnectMode::NonBlocking {
                self.confirm_connected().await?;
            }
            Ok(())
        }
        .await;
        self.metrics
            .connects
            .record(result.is_ok(), started.elapsed());
        result
    }

    /// Poll a non-blocking connect until it is up or the timeout passes.
    async fn confirm_connected(&self) -> std::result::Result<(), LinkError> {
        let deadline = Instant::now() + self.config.connect_confirm_timeout;
        loop {
            if self.link.is_connected().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LinkError::timeout(
                    "confirm connection",
                    self.config.connect_confirm_timeout,
                ));
            }
            sleep(self.config.connect_poll_interval).await;
        }
    }

    /// Read a characteristic within the read budget.
    async fn read(&self, uuid: Uuid, operation: &str) -> Result<bytes::Bytes> {
        with_retry(&self.config.read, operation, || async move {
            let started = Instant::now();
            let result = self.link.read_by_uuid(uuid).await;
            self.metrics.reads.record(result.is_ok(), started.elapsed());
            result.map_err(LiveLinkError)
        })
        .await
        .map_err(|failure| Error::Link(failure.error.0))
    }

    /// Activity handles for the current connection.
    ///
    /// The table is discovered on every cycle and compared with the cached
    /// one; handles are only re-derived when it changed.
    async fn resolve_handles(&self) -> Result<ActivityHandles> {
        let table = AttributeTable::discover(&self.link).await?;

        if let Some(cached) = self.lock_cache().as_ref()
            && cached.table == table
        {
            return Ok(cached.handles);
        }

        let declaration = table
            .find_characteristic_handle(ACTIVITY)
            .ok_or(LinkError::CharacteristicNotFound { uuid: ACTIVITY })?;
        let handles = ActivityHandles::from_declaration(declaration).ok_or_else(|| {
            LinkError::DiscoveryFailed(format!("activity handle {} out of range", declaration))
        })?;

        let mut cache = self.lock_cache();
        match cache.as_ref() {
            Some(previous) => info!(
                "Attribute table changed, activity handle {} -> {}",
                previous.handles.declaration, handles.declaration
            ),
            None => debug!(
                "Activity handle {}, value {}, notify {}",
                handles.declaration, handles.value, handles.notify
            ),
        }
        *cache = Some(HandleCache { table, handles });
        Ok(handles)
    }

    /// Wait for the router to signal, re-checking the link every tick.
    async fn await_wakeup(&self, wake_rx: &mut mpsc::Receiver<Wakeup>) -> Result<WaitResult> {
        let deadline = Instant::now() + self.config.notification_timeout;
        let mut closed = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitResult::TimedOut);
            }
            let tick = self.config.notification_poll_interval.min(deadline - now);

            if closed {
                sleep(tick).await;
            } else {
                match timeout(tick, wake_rx.recv()).await {
                    Ok(Some(wakeup)) => {
                        return Ok(WaitResult::Woke(Self::prefer_sample(wakeup, wake_rx)));
                    }
                    Ok(None) => closed = true,
                    Err(_) => {}
                }
            }

            if !self.link.is_connected().await {
                warn!("Link dropped while waiting for activity data");
                return Err(LinkError::NotConnected.into());
            }
        }
    }

    /// A wakeup without data may be followed by one with data already queued.
    fn prefer_sample(first: Wakeup, wake_rx: &mut mpsc::Receiver<Wakeup>) -> Wakeup {
        if first.sample.is_some() {
            return first;
        }
        std::iter::from_fn(|| wake_rx.try_recv().ok())
            .find(|w| w.sample.is_some())
            .unwrap_or(first)
    }

    async fn read_device_info(&self) -> Result<DeviceInfo> {
        self.connect().await?;
        if !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }

        let name = self.read_string(DEVICE_NAME, "read device name").await?;
        let serial = self.read_string(SERIAL_NUMBER, "read serial").await?;
        let hardware = self
            .read_string(HARDWARE_REVISION, "read hardware revision")
            .await?;
        let software = self
            .read_string(SOFTWARE_REVISION, "read software revision")
            .await?;

        let info = DeviceInfo::builder()
            .name(name)
            .serial(serial)
            .hardware_revision(hardware)
            .software_revision(software)
            .build();
        info!("Identified {} ({})", info.name, info.software_revision);
        Ok(info)
    }

    /// Read a UTF-8 string characteristic; a missing one reads as empty.
    async fn read_string(&self, uuid: Uuid, operation: &str) -> Result<String> {
        match self.read(uuid, operation).await {
            Ok(data) => Ok(String::from_utf8_lossy(&data)
                .trim_end_matches('\0')
                .to_string()),
            Err(Error::Link(LinkError::CharacteristicNotFound { .. })) => {
                debug!("{} not present", uuid);
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    // --- Bookkeeping ---

    fn store(&self, reading: Reading, produced: &Produced) {
        produced.mark(reading.kind());
        if self.snapshot.set(reading) {
            self.events.send(SessionEvent::ReadingUpdated {
                device: self.link.address().clone(),
                reading,
            });
        }
    }

    fn decode_failed(&self, kind: ReadingKind, error: &DecodeError) {
        warn!("Failed to decode {}: {}", kind, error);
        self.metrics.record_decode_failure();
        self.events.send(SessionEvent::DecodeFailed {
            device: self.link.address().clone(),
            kind,
            error: error.to_string(),
        });
    }

    fn finish(&self, outcome: RefreshOutcome) -> RefreshOutcome {
        self.set_state(match outcome {
            RefreshOutcome::Failure => SessionState::Failed,
            _ => SessionState::Idle,
        });
        self.metrics.record_refresh(outcome);
        self.events.send(SessionEvent::RefreshFinished {
            device: self.link.address().clone(),
            outcome,
        });
        outcome
    }

    fn set_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("State {} -> {}", from, to);
            self.events.send(SessionEvent::StateChanged {
                device: self.link.address().clone(),
                from,
                to,
            });
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<HandleCache>> {
        self.handle_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
