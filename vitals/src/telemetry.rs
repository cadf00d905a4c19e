//! Process-wide telemetry context.
//!
//! [`Telemetry`] owns the event store, the metrics table, and the platform
//! hooks. It is created once at boot over a caller-supplied buffer and lives
//! for the rest of the process; [`Telemetry::teardown`] hands the buffer back.
//!
//! Every operation runs inside the injected [`CriticalSection`], one logical
//! operation per lock: a single metric update, or one whole
//! collect-serialize-reset cycle.
//!
//! # Heartbeat cycle
//!
//! ```text
//! heartbeat_tick()
//!   -> tally running heartbeat timers
//!   -> built-in reliability and battery metrics, if enabled
//!   -> collect hook (application sets end-of-interval values)
//!   -> flush staged trace event
//!   -> serialize heartbeat session -> EventStore (commit or roll back)
//!   -> reset heartbeat metrics
//! ```
//!
//! The platform drives `heartbeat_tick` from its own periodic timer, every
//! [`heartbeat_interval`](Telemetry::heartbeat_interval).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::builtin::{BatteryMonitor, Collectors, ConnectivityState};
use crate::config::{DeviceInfo, TelemetryConfig};
use crate::error::{MetricsError, Result, TraceError};
use crate::metrics::{self, MetricValue, MetricsTable};
use crate::platform::{Clock, CriticalSection, CriticalSectionGuard, MonotonicClock, NoopLock};
use crate::schema::{MetricKey, ResolvedSchema, SessionKey};
use crate::serializer;
use crate::storage::{DataSource, EventStorage, EventStore, NvEventStorage, PersistObserver};
use crate::trace::{TraceEvent, TraceMailbox};

/// Hook run once per heartbeat, right before serialization.
pub type CollectHook = Box<dyn FnMut(&mut MetricsTable) + Send>;

/// Callback run when a user session ends, before its metrics are serialized.
pub type SessionEndCallback = Box<dyn FnMut(&mut MetricsTable) + Send>;

/// Outcome of the storage size check run at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    /// Storage can hold the largest possible event.
    Ok,
    /// Storage cannot hold the largest possible event. Telemetry still runs,
    /// but events that do not fit are dropped.
    StorageTooSmall {
        /// Bytes the largest event needs, record header included.
        needed: usize,
        /// Storage capacity.
        available: usize,
    },
}

/// State guarded by the critical section.
struct Core<S> {
    store: EventStore<S>,
    metrics: MetricsTable,
    device: DeviceInfo,
    collect_hook: Option<CollectHook>,
    session_end_callbacks: Vec<Option<SessionEndCallback>>,
    mailbox: Arc<TraceMailbox>,
    mailbox_drops_reported: u32,
    dropped_events: u32,
    collectors: Collectors,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Core<S> {
    /// Commits the staged trace event, if any. Returns how many were written.
    fn flush_pending_traces(&mut self) -> usize {
        let busy_drops = self.mailbox.dropped();
        if busy_drops != self.mailbox_drops_reported {
            let missed = busy_drops.wrapping_sub(self.mailbox_drops_reported);
            warn!(missed, total = busy_drops, "trace events dropped while mailbox was busy");
            self.mailbox_drops_reported = busy_drops;
        }

        let Some(event) = self.mailbox.take() else {
            return 0;
        };
        match serializer::serialize_trace(&mut self.store, &self.device, &event) {
            Ok(_) => 1,
            Err(_) => {
                self.dropped_events = self.dropped_events.saturating_add(1);
                0
            }
        }
    }

    fn write_trace(&mut self, event: &TraceEvent) -> std::result::Result<(), TraceError> {
        self.flush_pending_traces();
        serializer::serialize_trace(&mut self.store, &self.device, event)
            .map(|_| ())
            .map_err(|_| {
                self.dropped_events = self.dropped_events.saturating_add(1);
                TraceError::OutOfSpace
            })
    }

    /// Tallies, serializes and resets `session`.
    fn collect_and_reset(&mut self, session: SessionKey, now_ms: u64) -> Result<()> {
        self.metrics.tally_session(session, now_ms);
        if session.is_heartbeat() {
            self.collectors.collect(&mut self.metrics, now_ms);
            if let Some(hook) = self.collect_hook.as_mut() {
                hook(&mut self.metrics);
            }
        }
        self.flush_pending_traces();

        let result =
            serializer::serialize_session(&mut self.store, &self.metrics, &self.device, session);
        self.metrics.reset_session(session);

        match result {
            Ok(size) => {
                debug!(session = session.raw(), size, "serialized session");
                Ok(())
            }
            Err(_) => {
                self.dropped_events = self.dropped_events.saturating_add(1);
                Err(MetricsError::OutOfSpace {
                    session: session.raw(),
                }
                .into())
            }
        }
    }
}

/// The telemetry context.
///
/// `S` is the event storage buffer, `C` the millisecond clock and `L` the
/// critical section hook.
///
/// # Examples
///
/// ```rust
/// use vitals::config::{DeviceInfo, TelemetryConfig};
/// use vitals::platform::{ManualClock, NoopLock};
/// use vitals::schema::{MetricDef, MetricKey, MetricsSchema};
/// use vitals::storage::DataSource;
/// use vitals::telemetry::Telemetry;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TelemetryConfig::new(
///     DeviceInfo::new("DEMO01", "main", "1.0.0", "hw1"),
///     MetricsSchema::new(vec![MetricDef::unsigned("boot_count")], vec![]),
/// );
/// let clock = ManualClock::new(0);
/// let mut telemetry = Telemetry::boot(vec![0u8; 256], &config, clock, NoopLock)?;
///
/// telemetry.add(MetricKey::new(0), 1)?;
/// telemetry.heartbeat_tick()?;
///
/// let size = telemetry.has_more().expect("heartbeat committed");
/// let mut event = vec![0u8; size];
/// assert!(telemetry.read(0, &mut event));
/// telemetry.mark_read();
/// # Ok(())
/// # }
/// ```
pub struct Telemetry<S = Box<[u8]>, C = MonotonicClock, L = NoopLock> {
    core: Core<S>,
    clock: C,
    lock: L,
    heartbeat_interval: Duration,
    boot_status: BootStatus,
}

impl<S, C, L> Telemetry<S, C, L>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
    C: Clock,
    L: CriticalSection,
{
    /// Boots telemetry over `storage`.
    ///
    /// Resolves the schema with any enabled built-in metrics, resets every
    /// metric, and checks that `storage` can hold the largest possible event. An undersized buffer is logged
    /// and reported through [`boot_status`](Self::boot_status) but does not
    /// fail the boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or `storage` is
    /// empty.
    pub fn boot(storage: S, config: &TelemetryConfig, clock: C, lock: L) -> Result<Self> {
        config.validate()?;
        let schema = config.effective_schema().resolve()?;
        let now_ms = clock.time_since_boot_ms();
        let collectors = Collectors::resolve(&config.builtins, &schema, now_ms)?;
        let mut store = EventStore::new(storage)?;
        store.set_read_batching(config.read_batch_max_bytes);

        let needed = largest_event_size(&schema, &config.device);
        let boot_status =
            match serializer::check_storage_size(store.storage_size(), needed) {
                Ok(()) => BootStatus::Ok,
                Err(MetricsError::StorageTooSmall { needed, available }) => {
                    warn!(needed, available, "event storage too small for largest event");
                    BootStatus::StorageTooSmall { needed, available }
                }
                Err(e) => return Err(e.into()),
            };

        let session_count = schema.session_count();
        let mut metrics = MetricsTable::new(schema);
        metrics.reset_all();

        info!(
            metrics = metrics.schema().len(),
            sessions = session_count,
            storage = store.storage_size(),
            "telemetry booted"
        );

        Ok(Self {
            core: Core {
                store,
                metrics,
                device: config.device.clone(),
                collect_hook: None,
                session_end_callbacks: (0..session_count).map(|_| None).collect(),
                mailbox: Arc::new(TraceMailbox::new()),
                mailbox_drops_reported: 0,
                dropped_events: 0,
                collectors,
            },
            clock,
            lock,
            heartbeat_interval: Duration::from_secs(u64::from(config.heartbeat_interval_secs)),
            boot_status,
        })
    }

    /// Releases the context and returns the storage buffer.
    pub fn teardown(self) -> S {
        self.core.store.into_storage()
    }

    fn locked<R>(&mut self, f: impl FnOnce(&mut Core<S>, u64) -> R) -> R {
        let now_ms = self.clock.time_since_boot_ms();
        let _guard = CriticalSectionGuard::new(&self.lock);
        f(&mut self.core, now_ms)
    }

    /// Result of the boot-time storage size check.
    pub fn boot_status(&self) -> BootStatus {
        self.boot_status
    }

    /// Interval at which the platform should call
    /// [`heartbeat_tick`](Self::heartbeat_tick).
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The resolved schema.
    pub fn schema(&self) -> &ResolvedSchema {
        self.core.metrics.schema()
    }

    /// Device identity stamped into every event.
    pub fn device(&self) -> &DeviceInfo {
        &self.core.device
    }

    /// Events dropped because they did not fit in storage.
    pub fn dropped_events(&self) -> u32 {
        self.core.dropped_events
    }

    /// Handle to the interrupt-context trace mailbox.
    pub fn trace_mailbox(&self) -> Arc<TraceMailbox> {
        Arc::clone(&self.core.mailbox)
    }

    /// Registers the hook run once per heartbeat before serialization.
    pub fn set_collect_hook(&mut self, hook: CollectHook) {
        self.locked(|core, _| core.collect_hook = Some(hook));
    }

    /// Registers the callback run when `session` ends.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if `session` is not a user
    /// session.
    pub fn on_session_end(&mut self, session: SessionKey, callback: SessionEndCallback) -> Result<()> {
        self.user_session_timer(session)?;
        self.locked(|core, _| {
            if let Some(slot) = core.session_end_callbacks.get_mut(session.index()) {
                *slot = Some(callback);
            }
        });
        Ok(())
    }

    /// Registers the callback told about storage levels after every commit.
    pub fn set_persist_observer(&mut self, observer: PersistObserver) {
        self.locked(|core, _| core.store.set_persist_observer(observer));
    }

    /// Attaches non-volatile backing storage.
    pub fn set_nv_storage(&mut self, nv: Box<dyn NvEventStorage + Send>) {
        self.locked(|core, _| core.store.set_nv_storage(nv));
    }

    /// Sets the payload limit for batched reads; `None` turns batching off.
    pub fn set_read_batching(&mut self, max_payload_bytes: Option<usize>) {
        self.locked(|core, _| core.store.set_read_batching(max_payload_bytes));
    }

    /// Feeds a connectivity state change to the built-in connectivity timers.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the connectivity group is
    /// not enabled.
    pub fn connectivity_state_change(&mut self, state: ConnectivityState) -> Result<()> {
        self.locked(|core, now| {
            core.collectors
                .connectivity_state_change(&mut core.metrics, state, now)
        })
    }

    /// Counts a successful sync with the backend.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the sync group is not
    /// enabled.
    pub fn record_sync_success(&mut self) -> Result<()> {
        self.locked(|core, _| core.collectors.record_sync(&mut core.metrics, true))
    }

    /// Counts a failed sync with the backend.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the sync group is not
    /// enabled.
    pub fn record_sync_failure(&mut self) -> Result<()> {
        self.locked(|core, _| core.collectors.record_sync(&mut core.metrics, false))
    }

    /// Tells the reliability group whether the last reboot was unexpected.
    /// The first reported hour is then not counted as crash-free.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the reliability group is not
    /// enabled.
    pub fn set_unexpected_reboot(&mut self, unexpected: bool) -> Result<()> {
        self.locked(|core, _| core.collectors.set_unexpected_reboot(unexpected))
    }

    /// Attaches the battery monitor and starts the first discharge interval.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the battery group is not
    /// enabled.
    pub fn set_battery_monitor(&mut self, monitor: Box<dyn BatteryMonitor + Send>) -> Result<()> {
        self.locked(|core, now| core.collectors.attach_battery_monitor(monitor, now))
    }

    /// Marks the current interval as not fully discharging, e.g. when a
    /// charger is connected. No charge drop is reported for it.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if the battery group is not
    /// enabled.
    pub fn battery_stopped_discharging(&mut self) -> Result<()> {
        self.locked(|core, _| core.collectors.battery_stopped_discharging())
    }

    /// Sets an unsigned metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_unsigned(&mut self, key: MetricKey, value: u32) -> Result<()> {
        self.locked(|core, _| core.metrics.set_unsigned(key, value))
    }

    /// Sets a signed metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_signed(&mut self, key: MetricKey, value: i32) -> Result<()> {
        self.locked(|core, _| core.metrics.set_signed(key, value))
    }

    /// Sets a string metric, truncating to its maximum length.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_string(&mut self, key: MetricKey, value: &str) -> Result<()> {
        self.locked(|core, _| core.metrics.set_string(key, value))
    }

    /// Adds to an integer metric, saturating at its bounds.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn add(&mut self, key: MetricKey, amount: i32) -> Result<()> {
        self.locked(|core, _| core.metrics.add(key, amount))
    }

    /// Starts a timer.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoChange`] if it is already running,
    /// [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn timer_start(&mut self, key: MetricKey) -> Result<()> {
        self.locked(|core, now| core.metrics.timer_start(key, now))
    }

    /// Stops a timer.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoChange`] if it is not running,
    /// [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn timer_stop(&mut self, key: MetricKey) -> Result<()> {
        self.locked(|core, now| core.metrics.timer_stop(key, now))
    }

    /// Reads an unsigned metric; `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_unsigned(&mut self, key: MetricKey) -> Result<Option<u32>> {
        self.locked(|core, _| core.metrics.read_unsigned(key))
    }

    /// Reads a signed metric; `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_signed(&mut self, key: MetricKey) -> Result<Option<i32>> {
        self.locked(|core, _| core.metrics.read_signed(key))
    }

    /// Reads a timer, tallying it first if it is running.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_timer(&mut self, key: MetricKey) -> Result<u32> {
        self.locked(|core, now| core.metrics.read_timer(key, now))
    }

    /// Reads a string metric into an owned `String`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_string(&mut self, key: MetricKey) -> Result<String> {
        self.locked(|core, _| core.metrics.read_string(key).map(str::to_owned))
    }

    /// Copies a string metric into `out`, truncating if `out` is shorter.
    ///
    /// Truncation never splits a character, so `out[..n]` is always valid
    /// UTF-8. Returns the number of bytes copied, `n`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] if `out` is empty,
    /// [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_string_into(&mut self, key: MetricKey, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Err(MetricsError::BadParameter {
                reason: "output buffer is empty".to_string(),
            }
            .into());
        }
        self.locked(|core, _| -> Result<usize> {
            let value = metrics::truncate_to(core.metrics.read_string(key)?, out.len());
            out[..value.len()].copy_from_slice(value.as_bytes());
            Ok(value.len())
        })
    }

    fn user_session_timer(&self, session: SessionKey) -> Result<MetricKey> {
        self.core.metrics.schema().session_timer(session).ok_or_else(|| {
            MetricsError::BadParameter {
                reason: format!("session {} is not a user session", session.raw()),
            }
            .into()
        })
    }

    /// Starts a user session: resets its metrics and starts its duration
    /// timer.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] for the heartbeat or an unknown
    /// session, or [`MetricsError::NoChange`] if the session is already
    /// running (its metrics are still reset).
    pub fn session_start(&mut self, session: SessionKey) -> Result<()> {
        let timer = self.user_session_timer(session)?;
        self.locked(|core, now| {
            core.metrics.reset_session(session);
            core.metrics.timer_start(timer, now)
        })
    }

    /// Ends a user session: runs its end callback, stops its duration timer,
    /// then serializes and resets its metrics.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::BadParameter`] for the heartbeat or an unknown
    /// session, [`MetricsError::NoChange`] if the session was not started
    /// (nothing is serialized), or [`MetricsError::OutOfSpace`] if the event
    /// did not fit.
    pub fn session_end(&mut self, session: SessionKey) -> Result<()> {
        let timer = self.user_session_timer(session)?;
        self.locked(|core, now| -> Result<()> {
            if let Some(Some(callback)) = core.session_end_callbacks.get_mut(session.index()) {
                callback(&mut core.metrics);
            }
            core.metrics.timer_stop(timer, now)?;
            core.collect_and_reset(session, now)
        })
    }

    /// Tallies, serializes and resets `session`. For the heartbeat session
    /// the collect hook runs first.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::OutOfSpace`] if the event did not fit. The
    /// metrics are reset either way.
    pub fn collect_and_reset(&mut self, session: SessionKey) -> Result<()> {
        if session.index() >= self.schema().session_count() {
            return Err(MetricsError::BadParameter {
                reason: format!("unknown session {}", session.raw()),
            }
            .into());
        }
        self.locked(|core, now| core.collect_and_reset(session, now))
    }

    /// Runs one heartbeat cycle.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::OutOfSpace`] if the heartbeat did not fit.
    pub fn heartbeat_tick(&mut self) -> Result<()> {
        self.collect_and_reset(SessionKey::HEARTBEAT)
    }

    /// Runs a heartbeat cycle immediately, outside the periodic schedule.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::OutOfSpace`] if the heartbeat did not fit.
    pub fn debug_trigger(&mut self) -> Result<()> {
        self.heartbeat_tick()
    }

    /// Tallies running heartbeat timers and logs every heartbeat metric.
    pub fn debug_print(&mut self) {
        self.locked(|core, now| {
            core.metrics.tally_session(SessionKey::HEARTBEAT, now);
            info!("Heartbeat keys/values:");
            let schema = core.metrics.schema();
            for &key in schema.session_metrics(SessionKey::HEARTBEAT) {
                let name = schema.metric(key).map_or("?", |m| m.name.as_ref());
                match core.metrics.value(key) {
                    Ok(MetricValue::Unsigned(Some(v)) | MetricValue::Timer(Some(v))) => {
                        info!("  {name}: {v}");
                    }
                    Ok(MetricValue::Timer(None)) => info!("  {name}: 0"),
                    Ok(MetricValue::Signed(Some(v))) => info!("  {name}: {v}"),
                    Ok(MetricValue::String(s)) => info!("  {name}: \"{s}\""),
                    Ok(MetricValue::Unsigned(None) | MetricValue::Signed(None)) | Err(_) => {
                        info!("  {name}: null");
                    }
                }
            }
        });
    }

    /// Encodes and stores a trace event, after flushing any staged one.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::OutOfSpace`] if the event did not fit.
    pub fn capture_trace(&mut self, reason: u32, pc: Option<u32>, lr: Option<u32>) -> Result<()> {
        let event = TraceEvent { reason, pc, lr };
        self.locked(|core, _| core.write_trace(&event))?;
        Ok(())
    }

    /// Commits the event staged from interrupt context, if any.
    ///
    /// Returns the number of events written.
    pub fn flush_pending_traces(&mut self) -> usize {
        self.locked(|core, _| core.flush_pending_traces())
    }

    /// Moves committed events into non-volatile storage, if attached.
    pub fn persist(&mut self) -> usize {
        self.locked(|core, _| core.store.persist())
    }

    /// Bytes used in RAM event storage.
    pub fn bytes_used(&mut self) -> usize {
        self.locked(|core, _| core.store.bytes_used())
    }

    /// Bytes free in RAM event storage.
    pub fn bytes_free(&mut self) -> usize {
        self.locked(|core, _| core.store.bytes_free())
    }

    /// Capacity of RAM event storage.
    pub fn storage_size(&self) -> usize {
        self.core.store.storage_size()
    }
}

impl<S, C, L> DataSource for Telemetry<S, C, L>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
    C: Clock,
    L: CriticalSection,
{
    fn has_more(&mut self) -> Option<usize> {
        self.locked(|core, _| core.store.has_more())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool {
        self.locked(|core, _| core.store.read(offset, buf))
    }

    fn mark_read(&mut self) {
        self.locked(|core, _| core.store.mark_read());
    }
}

/// Largest payload any event can need: every session and a trace.
fn largest_event_size(schema: &ResolvedSchema, device: &DeviceInfo) -> usize {
    schema
        .sessions()
        .map(|session| serializer::compute_worst_case_size(schema, device, session))
        .chain(std::iter::once(serializer::compute_trace_worst_case_size(
            device,
        )))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VitalsError;
    use crate::platform::ManualClock;
    use crate::schema::{MetricDef, MetricsSchema, SessionDef};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    const COUNT: MetricKey = MetricKey::new(0);
    const LABEL: MetricKey = MetricKey::new(1);
    const SENT: MetricKey = MetricKey::new(2);
    const UPLOAD: SessionKey = SessionKey::new(1);

    #[derive(Default)]
    struct CountingLock {
        depth: AtomicIsize,
        entries: AtomicUsize,
    }

    impl CriticalSection for CountingLock {
        fn lock(&self) {
            self.depth.fetch_add(1, Ordering::SeqCst);
            self.entries.fetch_add(1, Ordering::SeqCst);
        }

        fn unlock(&self) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn create_test_config() -> TelemetryConfig {
        TelemetryConfig::new(
            DeviceInfo::new("SN1", "app", "2.0", "rev"),
            MetricsSchema::new(
                vec![
                    MetricDef::unsigned("count"),
                    MetricDef::string("label", 8),
                    MetricDef::unsigned("sent").in_session("upload"),
                ],
                vec![SessionDef::new("upload")],
            ),
        )
    }

    fn boot(
        capacity: usize,
    ) -> (
        Telemetry<Vec<u8>, ManualClock, Arc<CountingLock>>,
        ManualClock,
        Arc<CountingLock>,
    ) {
        let clock = ManualClock::new(0);
        let lock = Arc::new(CountingLock::default());
        let telemetry = Telemetry::boot(
            vec![0u8; capacity],
            &create_test_config(),
            clock.clone(),
            Arc::clone(&lock),
        )
        .unwrap();
        (telemetry, clock, lock)
    }

    fn drain_all<D: DataSource>(source: &mut D) -> Vec<Vec<u8>> {
        let mut events = Vec::new();
        while let Some(size) = source.has_more() {
            let mut buf = vec![0; size];
            assert!(source.read(0, &mut buf));
            source.mark_read();
            events.push(buf);
        }
        events
    }

    #[test]
    fn test_boot_reports_storage_ok() {
        let (telemetry, _, _) = boot(256);
        assert_eq!(telemetry.boot_status(), BootStatus::Ok);
        assert_eq!(telemetry.heartbeat_interval(), Duration::from_secs(3600));
        assert_eq!(telemetry.schema().len(), 4);
    }

    #[test]
    fn test_boot_with_small_storage_still_runs() {
        let (mut telemetry, _, _) = boot(16);
        assert!(matches!(
            telemetry.boot_status(),
            BootStatus::StorageTooSmall { available: 16, .. }
        ));
        telemetry.set_unsigned(COUNT, 1).unwrap();
        assert!(telemetry.heartbeat_tick().is_err());
        assert_eq!(telemetry.dropped_events(), 1);
        assert_eq!(telemetry.bytes_used(), 0);
    }

    #[test]
    fn test_boot_rejects_invalid_config() {
        let mut config = create_test_config();
        config.schema.metrics.clear();
        let result = Telemetry::boot(vec![0u8; 64], &config, ManualClock::new(0), NoopLock);
        assert!(result.is_err());
    }

    #[test]
    fn test_lock_is_balanced() {
        let (mut telemetry, clock, lock) = boot(256);
        telemetry.set_unsigned(COUNT, 1).unwrap();
        telemetry.set_string(LABEL, "x").unwrap();
        assert!(telemetry.set_signed(COUNT, 1).is_err());
        telemetry.session_start(UPLOAD).unwrap();
        clock.advance(10);
        telemetry.session_end(UPLOAD).unwrap();
        telemetry.heartbeat_tick().unwrap();
        drain_all(&mut telemetry);

        assert_eq!(lock.depth.load(Ordering::SeqCst), 0);
        assert!(lock.entries.load(Ordering::SeqCst) >= 8);
    }

    #[test]
    fn test_heartbeat_commits_and_resets() {
        let (mut telemetry, _, _) = boot(256);
        telemetry.set_unsigned(COUNT, 5).unwrap();
        telemetry.set_string(LABEL, "hello").unwrap();
        telemetry.heartbeat_tick().unwrap();

        assert_eq!(telemetry.read_unsigned(COUNT).unwrap(), None);
        assert_eq!(telemetry.read_string(LABEL).unwrap(), "");
        assert_eq!(drain_all(&mut telemetry).len(), 1);
    }

    #[test]
    fn test_collect_hook_runs_before_serialize() {
        let (mut telemetry, _, _) = boot(256);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        telemetry.set_collect_hook(Box::new(move |metrics| {
            seen.fetch_add(1, Ordering::SeqCst);
            metrics.set_unsigned(COUNT, 77).unwrap();
        }));

        telemetry.heartbeat_tick().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = drain_all(&mut telemetry);
        // Heartbeat values array is the tail: [77, ""]
        assert!(events[0].ends_with(&[0x82, 0x18, 77, 0x60]));
    }

    #[test]
    fn test_builtin_metrics_collected_before_hook() {
        let mut config = create_test_config();
        config.builtins.reliability = true;
        config.builtins.sync = true;
        let clock = ManualClock::new(0);
        let mut telemetry =
            Telemetry::boot(vec![0u8; 256], &config, clock.clone(), NoopLock).unwrap();
        // Built-ins follow the declared metrics, before the session timer.
        let hours = telemetry.schema().key_of(crate::builtin::OPERATIONAL_HOURS).unwrap();
        assert_eq!(hours.raw(), 5);

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        telemetry.set_collect_hook(Box::new(move |metrics| {
            *sink.lock().unwrap() = metrics.read_unsigned(hours).unwrap();
        }));

        telemetry.record_sync_success().unwrap();
        clock.advance(60 * 60 * 1000);
        telemetry.heartbeat_tick().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(1));
        assert_eq!(drain_all(&mut telemetry).len(), 1);
    }

    #[test]
    fn test_builtin_api_requires_enabled_group() {
        let (mut telemetry, _, _) = boot(256);
        assert!(matches!(
            telemetry.record_sync_failure(),
            Err(VitalsError::Metrics(MetricsError::BadParameter { .. }))
        ));
        assert!(
            telemetry
                .connectivity_state_change(ConnectivityState::Connected)
                .is_err()
        );
        assert!(telemetry.set_unexpected_reboot(true).is_err());
        assert!(telemetry.battery_stopped_discharging().is_err());
    }

    #[test]
    fn test_session_lifecycle() {
        let (mut telemetry, clock, _) = boot(256);
        let ended = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ended);
        telemetry
            .on_session_end(
                UPLOAD,
                Box::new(move |metrics| {
                    *flag.lock().unwrap() = true;
                    metrics.set_unsigned(SENT, 3).unwrap();
                }),
            )
            .unwrap();

        telemetry.set_unsigned(SENT, 100).unwrap();
        telemetry.session_start(UPLOAD).unwrap();
        // Start discards values set before the session.
        assert_eq!(telemetry.read_unsigned(SENT).unwrap(), None);

        clock.advance(250);
        telemetry.session_end(UPLOAD).unwrap();
        assert!(*ended.lock().unwrap());
        assert_eq!(telemetry.read_unsigned(SENT).unwrap(), None);

        let events = drain_all(&mut telemetry);
        assert_eq!(events.len(), 1);
        // { 1: [3, 250] }
        assert!(events[0].ends_with(&[0xA1, 0x01, 0x82, 0x03, 0x18, 250]));
    }

    #[test]
    fn test_session_misuse() {
        let (mut telemetry, _, _) = boot(256);
        assert!(matches!(
            telemetry.session_end(UPLOAD),
            Err(VitalsError::Metrics(MetricsError::NoChange { .. }))
        ));
        assert_eq!(telemetry.bytes_used(), 0);

        telemetry.session_start(UPLOAD).unwrap();
        assert!(matches!(
            telemetry.session_start(UPLOAD),
            Err(VitalsError::Metrics(MetricsError::NoChange { .. }))
        ));
        assert!(matches!(
            telemetry.session_start(SessionKey::HEARTBEAT),
            Err(VitalsError::Metrics(MetricsError::BadParameter { .. }))
        ));
        assert!(matches!(
            telemetry.session_start(SessionKey::new(9)),
            Err(VitalsError::Metrics(MetricsError::BadParameter { .. }))
        ));
        assert!(telemetry.collect_and_reset(SessionKey::new(9)).is_err());
    }

    #[test]
    fn test_read_string_into() {
        let (mut telemetry, _, _) = boot(256);
        telemetry.set_string(LABEL, "abcdef").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(telemetry.read_string_into(LABEL, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        telemetry.set_string(LABEL, "añb").unwrap();
        let mut buf = [0u8; 2];
        let copied = telemetry.read_string_into(LABEL, &mut buf).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(std::str::from_utf8(&buf[..copied]).unwrap(), "a");
        let mut buf = [0u8; 3];
        assert_eq!(telemetry.read_string_into(LABEL, &mut buf).unwrap(), 3);
        assert_eq!(&buf, "añ".as_bytes());

        let mut empty = [0u8; 0];
        assert!(matches!(
            telemetry.read_string_into(LABEL, &mut empty),
            Err(VitalsError::Metrics(MetricsError::BadParameter { .. }))
        ));
    }

    #[test]
    fn test_staged_trace_flushed_before_next_commit() {
        let (mut telemetry, _, _) = boot(256);
        let mailbox = telemetry.trace_mailbox();
        mailbox.stage(TraceEvent::new(9)).unwrap();

        telemetry.heartbeat_tick().unwrap();
        let events = drain_all(&mut telemetry);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0][2], 2); // trace first
        assert_eq!(events[1][2], 1); // then the heartbeat
    }

    #[test]
    fn test_capture_trace() {
        let (mut telemetry, _, _) = boot(256);
        telemetry.trace_mailbox().stage(TraceEvent::new(1)).unwrap();
        telemetry.capture_trace(2, Some(0x10), None).unwrap();
        assert_eq!(telemetry.flush_pending_traces(), 0);

        let events = drain_all(&mut telemetry);
        assert_eq!(events.len(), 2);
        assert!(events[0].ends_with(&[0xA1, 0x06, 0x01]));
        assert!(events[1].ends_with(&[0xA2, 0x06, 0x02, 0x02, 0x10]));
    }

    #[test]
    fn test_debug_print_and_trigger() {
        let (mut telemetry, _, _) = boot(256);
        telemetry.set_unsigned(COUNT, 1).unwrap();
        telemetry.debug_print();
        assert_eq!(telemetry.read_unsigned(COUNT).unwrap(), Some(1));
        telemetry.debug_trigger().unwrap();
        assert_eq!(telemetry.read_unsigned(COUNT).unwrap(), None);
    }

    #[test]
    fn test_teardown_returns_storage() {
        let (telemetry, _, _) = boot(128);
        assert_eq!(telemetry.teardown().len(), 128);
    }
}
