//! # vitals
//!
//! On-device telemetry core: transactional event storage and heartbeat
//! metrics.
//!
//! vitals collects typed metrics on a device, periodically serializes them
//! into compact CBOR events, and buffers those events in a fixed-size ring
//! until a transport drains them. It is built for long-running firmware-style
//! processes where storage is bounded and writes may come from interrupt
//! context.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Fixed-size storage supplied by the caller; no growth after boot
//! - All-or-nothing event writes: a record is committed whole or not at all
//! - Typed metrics with saturating arithmetic and 31-bit rollover-safe timers
//! - Lock-free staging of trace events from interrupt context
//! - Platform hooks for the clock, the critical section and non-volatile
//!   backing storage
//!
//! ## Quick Start
//!
//! ```rust
//! use vitals::{DataSource, DeviceInfo, MetricDef, MetricsSchema, Telemetry, TelemetryConfig};
//! use vitals::platform::{ManualClock, NoopLock};
//!
//! vitals::metric_keys! {
//!     BOOT_COUNT,
//!     FIRMWARE_TAG,
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::new(
//!     DeviceInfo::new("DEMO01", "main", "1.0.0", "hw1"),
//!     MetricsSchema::new(
//!         vec![MetricDef::unsigned("boot_count"), MetricDef::string("firmware_tag", 16)],
//!         vec![],
//!     ),
//! );
//!
//! let mut telemetry = Telemetry::boot(vec![0u8; 512], &config, ManualClock::new(0), NoopLock)?;
//! telemetry.add(BOOT_COUNT, 1)?;
//! telemetry.set_string(FIRMWARE_TAG, "nightly")?;
//!
//! // Normally driven by a periodic platform timer.
//! telemetry.heartbeat_tick()?;
//!
//! while let Some(size) = telemetry.has_more() {
//!     let mut event = vec![0u8; size];
//!     telemetry.read(0, &mut event);
//!     telemetry.mark_read();
//!     println!("event: {} bytes", event.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Telemetry`]: Process-wide context; owns storage and metrics
//! - [`TelemetryConfig`]: Device identity, heartbeat interval and schema
//! - [`MetricsSchema`]: Declares metrics and user sessions
//! - [`DataSource`]: Transport-side contract for draining events
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`telemetry`]: Boot, metric updates, sessions, heartbeat cycle
//! - [`config`]: Configuration loading and validation
//! - [`schema`]: Metric and session declarations, key assignment
//! - [`metrics`]: Typed metric table
//! - [`builtin`]: Optional connectivity, sync, reliability and battery metrics
//! - [`serializer`]: Event encoding and worst-case sizing
//! - [`cbor`]: Minimal capacity-aware CBOR encoder
//! - [`storage`]: Transactional event store over a ring buffer
//! - [`ring`]: Byte ring buffer
//! - [`trace`]: Trace events and the interrupt-context mailbox
//! - [`platform`]: Clock and critical section hooks
//! - [`error`]: Error types

pub mod builtin;
pub mod cbor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod ring;
pub mod schema;
pub mod serializer;
pub mod storage;
pub mod telemetry;
pub mod trace;

// Re-export primary API types at crate root for convenience.
pub use builtin::{BatteryMonitor, BuiltinMetrics, ConnectivityState};
pub use config::{DeviceInfo, TelemetryConfig};
pub use error::{Result, VitalsError};
pub use metrics::{MetricValue, MetricsTable};
pub use schema::{MetricDef, MetricKey, MetricType, MetricsSchema, SessionDef, SessionKey};
pub use storage::{DataSource, EventStorage, EventStore, NvEventStorage};
pub use telemetry::{BootStatus, Telemetry};
pub use trace::{TraceEvent, TraceMailbox};

/// Declares `MetricKey` constants in schema declaration order.
///
/// The first name gets key 0, the next key 1, and so on. List the names in
/// the same order as the metrics passed to [`MetricsSchema::new`]; session
/// duration timers come after every declared metric and are looked up with
/// [`ResolvedSchema::session_timer`](schema::ResolvedSchema::session_timer).
///
/// ```rust
/// vitals::metric_keys! {
///     UPTIME,
///     RESETS,
/// }
///
/// assert_eq!(UPTIME.raw(), 0);
/// assert_eq!(RESETS.raw(), 1);
/// ```
#[macro_export]
macro_rules! metric_keys {
    ($($name:ident),+ $(,)?) => {
        $crate::metric_keys!(@step 0u16; $($name),+);
    };
    (@step $index:expr; $name:ident $(, $rest:ident)*) => {
        #[allow(missing_docs)]
        pub const $name: $crate::schema::MetricKey = $crate::schema::MetricKey::new($index);
        $crate::metric_keys!(@step $index + 1u16; $($rest),*);
    };
    (@step $index:expr;) => {};
}
