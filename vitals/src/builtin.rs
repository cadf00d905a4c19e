//! Built-in heartbeat metrics maintained by the core.
//!
//! Each group is opt-in through [`BuiltinMetrics`] in the configuration. An
//! enabled group appends its metric definitions to the heartbeat session,
//! after every declared metric, so user keys are never shifted.
//!
//! | Group | Metrics | Fed by |
//! |---|---|---|
//! | connectivity | `connectivity_connected_time_ms`, `connectivity_expected_time_ms` (timers) | [`Telemetry::connectivity_state_change`](crate::telemetry::Telemetry::connectivity_state_change) |
//! | sync | `sync_successful`, `sync_failure` | [`Telemetry::record_sync_success`](crate::telemetry::Telemetry::record_sync_success) and `record_sync_failure` |
//! | reliability | `operational_hours`, `operational_crashfree_hours` | uptime, at every heartbeat |
//! | battery | `battery_soc_pct`, `battery_soc_pct_drop`, `battery_discharge_duration_ms` | a [`BatteryMonitor`], at every heartbeat |
//!
//! The reliability and battery groups are collected right after running
//! timers are tallied and before the user collect hook.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetricsError, Result, SchemaError, VitalsError};
use crate::metrics::MetricsTable;
use crate::schema::{MetricDef, MetricKey, ResolvedSchema};

/// Time the device was connected while it was expected to be.
pub const CONNECTED_TIME: &str = "connectivity_connected_time_ms";
/// Time the device was expected to be connected.
pub const EXPECTED_TIME: &str = "connectivity_expected_time_ms";
/// Successful syncs with the backend.
pub const SYNC_SUCCESSFUL: &str = "sync_successful";
/// Failed syncs with the backend.
pub const SYNC_FAILURE: &str = "sync_failure";
/// Whole hours of uptime.
pub const OPERATIONAL_HOURS: &str = "operational_hours";
/// Whole hours of uptime not followed by an unexpected reboot.
pub const OPERATIONAL_CRASHFREE_HOURS: &str = "operational_crashfree_hours";
/// Battery state of charge at the end of the interval.
pub const BATTERY_SOC_PCT: &str = "battery_soc_pct";
/// State of charge lost over a fully discharging interval.
pub const BATTERY_SOC_PCT_DROP: &str = "battery_soc_pct_drop";
/// Length of that discharging interval.
pub const BATTERY_DISCHARGE_DURATION_MS: &str = "battery_discharge_duration_ms";

const MS_PER_HOUR: u64 = 60 * 60 * 1000;

/// Which built-in metric groups are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinMetrics {
    /// Connected and expected-connected time.
    pub connectivity: bool,
    /// Sync success and failure counters.
    pub sync: bool,
    /// Operational and crash-free hours.
    pub reliability: bool,
    /// Battery charge-drop tracking.
    pub battery: bool,
}

impl BuiltinMetrics {
    /// Every group enabled.
    pub const ALL: Self = Self {
        connectivity: true,
        sync: true,
        reliability: true,
        battery: true,
    };

    /// Definitions of every metric the enabled groups need, in group order.
    pub fn metric_defs(&self) -> Vec<MetricDef> {
        let mut defs = Vec::new();
        if self.connectivity {
            defs.push(MetricDef::timer(CONNECTED_TIME));
            defs.push(MetricDef::timer(EXPECTED_TIME));
        }
        if self.sync {
            defs.push(MetricDef::unsigned(SYNC_SUCCESSFUL));
            defs.push(MetricDef::unsigned(SYNC_FAILURE));
        }
        if self.reliability {
            defs.push(MetricDef::unsigned(OPERATIONAL_HOURS));
            defs.push(MetricDef::unsigned(OPERATIONAL_CRASHFREE_HOURS));
        }
        if self.battery {
            defs.push(MetricDef::unsigned(BATTERY_SOC_PCT));
            defs.push(MetricDef::unsigned(BATTERY_SOC_PCT_DROP));
            defs.push(MetricDef::unsigned(BATTERY_DISCHARGE_DURATION_MS));
        }
        defs
    }
}

/// Connectivity state reported by the networking stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Connecting is not expected, e.g. the radio is off on purpose.
    Stopped,
    /// Connecting is expected but not yet established.
    Started,
    /// Connected.
    Connected,
    /// Connecting is expected but the link dropped.
    ConnectionLost,
}

/// Platform battery readings used by the battery group.
pub trait BatteryMonitor {
    /// Current state of charge, in percent times the platform's scale.
    fn state_of_charge(&mut self) -> u32;

    /// Whether the battery is discharging right now.
    fn is_discharging(&mut self) -> bool;
}

fn key(schema: &ResolvedSchema, name: &str) -> Result<MetricKey> {
    schema.key_of(name).ok_or_else(|| {
        SchemaError::MissingBuiltin {
            name: name.to_string(),
        }
        .into()
    })
}

struct ConnectivityKeys {
    connected: MetricKey,
    expected: MetricKey,
}

struct SyncKeys {
    successful: MetricKey,
    failure: MetricKey,
}

/// Uptime accounting for the reliability group.
struct Reliability {
    hours: MetricKey,
    crashfree_hours: MetricKey,
    last_heartbeat_ms: u64,
    /// Uptime not yet reported as whole hours.
    operational_ms: u64,
    unexpected_reboot: bool,
    counted_unexpected_reboot: bool,
}

impl Reliability {
    fn collect(&mut self, metrics: &mut MetricsTable, now_ms: u64) -> Result<()> {
        self.operational_ms += now_ms.saturating_sub(self.last_heartbeat_ms);
        self.last_heartbeat_ms = now_ms;

        let hours = self.operational_ms / MS_PER_HOUR;
        self.operational_ms -= hours * MS_PER_HOUR;
        if hours == 0 {
            return Ok(());
        }

        // The reboot that started this uptime costs one crash-free hour, once.
        let mut crashfree = hours;
        if !self.counted_unexpected_reboot {
            self.counted_unexpected_reboot = true;
            crashfree -= u64::from(self.unexpected_reboot);
        }

        metrics.add(self.hours, clamp_amount(hours))?;
        metrics.add(self.crashfree_hours, clamp_amount(crashfree))
    }
}

fn clamp_amount(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Discharge tracking for the battery group.
struct Battery {
    soc_pct: MetricKey,
    soc_pct_drop: MetricKey,
    discharge_duration_ms: MetricKey,
    monitor: Option<Box<dyn BatteryMonitor + Send>>,
    last_state_of_charge: u32,
    interval_start_ms: u64,
    stopped_discharging_during_interval: bool,
}

impl Battery {
    fn attach(&mut self, mut monitor: Box<dyn BatteryMonitor + Send>, now_ms: u64) {
        self.last_state_of_charge = monitor.state_of_charge();
        self.stopped_discharging_during_interval = !monitor.is_discharging();
        self.interval_start_ms = now_ms;
        self.monitor = Some(monitor);
    }

    fn collect(&mut self, metrics: &mut MetricsTable, now_ms: u64) -> Result<()> {
        let Some(monitor) = self.monitor.as_mut() else {
            debug!("no battery monitor attached, skipping battery metrics");
            return Ok(());
        };

        let stopped_during_interval = self.stopped_discharging_during_interval;
        let discharging = monitor.is_discharging();
        self.stopped_discharging_during_interval = !discharging;
        let state_of_charge = monitor.state_of_charge();

        if !discharging && !stopped_during_interval {
            warn!("battery stopped-discharging event missed, dropping discharge data");
        }
        // Only an interval that discharged throughout yields a drop.
        let interval_valid = discharging && !stopped_during_interval;

        let drop = i64::from(self.last_state_of_charge) - i64::from(state_of_charge);
        let duration_ms = now_ms.wrapping_sub(self.interval_start_ms);
        self.interval_start_ms = now_ms;
        self.last_state_of_charge = state_of_charge;

        if drop < 0 {
            debug!(drop, "battery charge rose, skipping drop");
        } else if interval_valid {
            // An unchanged charge is recorded as 0 rather than left unset.
            metrics.set_unsigned(self.soc_pct_drop, u32::try_from(drop).unwrap_or(u32::MAX))?;
            metrics.set_unsigned(
                self.discharge_duration_ms,
                u32::try_from(duration_ms).unwrap_or(u32::MAX),
            )?;
        }

        metrics.set_unsigned(self.soc_pct, state_of_charge)
    }
}

/// State of every enabled built-in group, kept under the telemetry lock.
#[derive(Default)]
pub(crate) struct Collectors {
    connectivity: Option<ConnectivityKeys>,
    sync: Option<SyncKeys>,
    reliability: Option<Reliability>,
    battery: Option<Battery>,
}

impl Collectors {
    /// Looks up the keys of every enabled group in the resolved schema.
    pub(crate) fn resolve(
        builtins: &BuiltinMetrics,
        schema: &ResolvedSchema,
        now_ms: u64,
    ) -> Result<Self> {
        let mut collectors = Self::default();
        if builtins.connectivity {
            collectors.connectivity = Some(ConnectivityKeys {
                connected: key(schema, CONNECTED_TIME)?,
                expected: key(schema, EXPECTED_TIME)?,
            });
        }
        if builtins.sync {
            collectors.sync = Some(SyncKeys {
                successful: key(schema, SYNC_SUCCESSFUL)?,
                failure: key(schema, SYNC_FAILURE)?,
            });
        }
        if builtins.reliability {
            collectors.reliability = Some(Reliability {
                hours: key(schema, OPERATIONAL_HOURS)?,
                crashfree_hours: key(schema, OPERATIONAL_CRASHFREE_HOURS)?,
                last_heartbeat_ms: now_ms,
                operational_ms: 0,
                unexpected_reboot: false,
                counted_unexpected_reboot: false,
            });
        }
        if builtins.battery {
            collectors.battery = Some(Battery {
                soc_pct: key(schema, BATTERY_SOC_PCT)?,
                soc_pct_drop: key(schema, BATTERY_SOC_PCT_DROP)?,
                discharge_duration_ms: key(schema, BATTERY_DISCHARGE_DURATION_MS)?,
                monitor: None,
                last_state_of_charge: 0,
                interval_start_ms: now_ms,
                stopped_discharging_during_interval: true,
            });
        }
        Ok(collectors)
    }

    /// Runs the groups collected at every heartbeat.
    pub(crate) fn collect(&mut self, metrics: &mut MetricsTable, now_ms: u64) {
        if let Some(reliability) = self.reliability.as_mut()
            && let Err(e) = reliability.collect(metrics, now_ms)
        {
            warn!(error = %e, "reliability metrics not recorded");
        }
        if let Some(battery) = self.battery.as_mut()
            && let Err(e) = battery.collect(metrics, now_ms)
        {
            warn!(error = %e, "battery metrics not recorded");
        }
    }

    pub(crate) fn connectivity_state_change(
        &self,
        metrics: &mut MetricsTable,
        state: ConnectivityState,
        now_ms: u64,
    ) -> Result<()> {
        let keys = self.connectivity.as_ref().ok_or_else(|| disabled("connectivity"))?;
        // Unbalanced starts and stops are expected here and ignored.
        let (expected, connected) = match state {
            ConnectivityState::Stopped => (
                metrics.timer_stop(keys.expected, now_ms),
                metrics.timer_stop(keys.connected, now_ms),
            ),
            ConnectivityState::Started => (metrics.timer_start(keys.expected, now_ms), Ok(())),
            ConnectivityState::Connected => (
                metrics.timer_start(keys.expected, now_ms),
                metrics.timer_start(keys.connected, now_ms),
            ),
            ConnectivityState::ConnectionLost => (
                metrics.timer_start(keys.expected, now_ms),
                metrics.timer_stop(keys.connected, now_ms),
            ),
        };
        ignore_no_change(expected)?;
        ignore_no_change(connected)
    }

    pub(crate) fn record_sync(&self, metrics: &mut MetricsTable, success: bool) -> Result<()> {
        let keys = self.sync.as_ref().ok_or_else(|| disabled("sync"))?;
        let key = if success { keys.successful } else { keys.failure };
        metrics.add(key, 1)
    }

    pub(crate) fn set_unexpected_reboot(&mut self, unexpected: bool) -> Result<()> {
        let reliability = self.reliability.as_mut().ok_or_else(|| disabled("reliability"))?;
        reliability.unexpected_reboot = unexpected;
        Ok(())
    }

    pub(crate) fn attach_battery_monitor(
        &mut self,
        monitor: Box<dyn BatteryMonitor + Send>,
        now_ms: u64,
    ) -> Result<()> {
        let battery = self.battery.as_mut().ok_or_else(|| disabled("battery"))?;
        battery.attach(monitor, now_ms);
        Ok(())
    }

    pub(crate) fn battery_stopped_discharging(&mut self) -> Result<()> {
        let battery = self.battery.as_mut().ok_or_else(|| disabled("battery"))?;
        battery.stopped_discharging_during_interval = true;
        Ok(())
    }
}

fn disabled(group: &str) -> VitalsError {
    MetricsError::BadParameter {
        reason: format!("built-in {group} metrics are not enabled"),
    }
    .into()
}

fn ignore_no_change(result: Result<()>) -> Result<()> {
    match result {
        Err(VitalsError::Metrics(MetricsError::NoChange { .. })) => Ok(()),
        other => other,
    }
}
