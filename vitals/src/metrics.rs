//! Typed metric value table.
//!
//! [`MetricsTable`] holds one value slot per metric in a [`ResolvedSchema`].
//! Slots are a tagged enum, so every typed accessor checks the declared type
//! before touching the value and a mismatch never has side effects.
//!
//! # Value semantics
//!
//! - Unsigned and signed integers start unset and become set on the first
//!   `set` or `add`. `add` saturates at the type's bounds instead of wrapping.
//! - Timers accumulate milliseconds between `timer_start` and `timer_stop`.
//!   Clock readings are masked to 31 bits and the elapsed time is computed
//!   modulo 2^31, so a wrapping clock never produces a bogus delta. The
//!   accumulated value saturates at [`TIMER_MAX`].
//! - Strings hold at most the declared `max_length` bytes; longer writes are
//!   truncated at a character boundary.
//!
//! The table has no clock or lock of its own. The owning
//! [`Telemetry`](crate::telemetry::Telemetry) context passes in the current
//! time and serializes access.

use tracing::error;

use crate::error::{MetricsError, Result};
use crate::schema::{MetricKey, MetricType, ResolvedSchema, SessionKey};

/// Largest value a timer can hold (31 bits).
pub const TIMER_MAX: u32 = 0x7FFF_FFFF;

const TIMER_MODULUS: u32 = 0x8000_0000;

/// Masks a clock reading to the 31-bit timer domain.
#[allow(clippy::cast_possible_truncation)] // masked to 31 bits
fn timer_now(now_ms: u64) -> u32 {
    (now_ms & u64::from(TIMER_MAX)) as u32
}

/// Elapsed milliseconds between two masked readings, modulo 2^31.
fn timer_delta(start: u32, stop: u32) -> u32 {
    if stop >= start {
        stop - start
    } else {
        (TIMER_MODULUS - start) + stop
    }
}

/// Current value of a metric, as walked by the serializer and debug dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue<'a> {
    /// Unsigned integer; `None` when unset.
    Unsigned(Option<u32>),
    /// Signed integer; `None` when unset.
    Signed(Option<i32>),
    /// Accumulated milliseconds; `None` when nothing has accumulated yet.
    Timer(Option<u32>),
    /// String contents (empty after reset).
    String(&'a str),
}

#[derive(Debug, Clone, Copy, Default)]
struct TimerSlot {
    value: u32,
    is_set: bool,
    running: bool,
    start_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerOp {
    Start,
    Stop,
    Tally,
}

impl TimerSlot {
    /// Applies `op`; returns `false` if the timer was already in the
    /// requested state.
    fn update(&mut self, op: TimerOp, now_ms: u64) -> bool {
        let now = timer_now(now_ms);
        match (self.running, op) {
            (false, TimerOp::Start) => {
                self.start_ms = now;
                self.running = true;
                true
            }
            (true, TimerOp::Stop | TimerOp::Tally) => {
                let delta = timer_delta(self.start_ms, now);
                self.value = self.value.saturating_add(delta).min(TIMER_MAX);
                self.is_set = true;
                if op == TimerOp::Stop {
                    self.running = false;
                    self.start_ms = 0;
                } else {
                    self.start_ms = now;
                }
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.value = 0;
        self.is_set = false;
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Unsigned(Option<u32>),
    Signed(Option<i32>),
    Timer(TimerSlot),
    String { value: String, max_length: usize },
}

impl Slot {
    fn new(metric_type: MetricType, max_length: usize) -> Self {
        match metric_type {
            MetricType::Unsigned => Self::Unsigned(None),
            MetricType::Signed => Self::Signed(None),
            MetricType::Timer => Self::Timer(TimerSlot::default()),
            MetricType::String => Self::String {
                value: String::with_capacity(max_length),
                max_length,
            },
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            Self::Unsigned(_) => MetricType::Unsigned,
            Self::Signed(_) => MetricType::Signed,
            Self::Timer(_) => MetricType::Timer,
            Self::String { .. } => MetricType::String,
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Unsigned(v) => *v = None,
            Self::Signed(v) => *v = None,
            Self::Timer(timer) => timer.reset(),
            Self::String { value, .. } => value.clear(),
        }
    }
}

fn type_mismatch(key: MetricKey, expected: MetricType, actual: MetricType) -> MetricsError {
    error!(key = key.raw(), %expected, %actual, "metric type mismatch");
    MetricsError::TypeMismatch {
        key: key.raw(),
        expected,
        actual,
    }
}

/// Longest prefix of `value` that fits in `max_length` bytes without splitting
/// a character.
pub(crate) fn truncate_to(value: &str, max_length: usize) -> &str {
    let mut end = value.len().min(max_length);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// The live values of every metric in a schema.
///
/// # Examples
///
/// ```rust
/// use vitals::metrics::MetricsTable;
/// use vitals::schema::{MetricDef, MetricKey, MetricsSchema};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let schema = MetricsSchema::new(vec![MetricDef::unsigned("count")], vec![]).resolve()?;
/// let mut table = MetricsTable::new(schema);
/// let count = MetricKey::new(0);
///
/// assert_eq!(table.read_unsigned(count)?, None);
/// table.add(count, 3)?;
/// table.add(count, -5)?; // saturates at zero
/// assert_eq!(table.read_unsigned(count)?, Some(0));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MetricsTable {
    schema: ResolvedSchema,
    slots: Vec<Slot>,
}

impl MetricsTable {
    /// Allocates a slot for every metric in `schema`, all unset.
    pub fn new(schema: ResolvedSchema) -> Self {
        let slots = schema
            .metrics()
            .iter()
            .map(|m| Slot::new(m.metric_type, m.max_length))
            .collect();
        Self { schema, slots }
    }

    /// The schema this table was built from.
    pub fn schema(&self) -> &ResolvedSchema {
        &self.schema
    }

    fn slot(&self, key: MetricKey) -> Result<&Slot> {
        self.slots
            .get(key.index())
            .ok_or_else(|| MetricsError::KeyNotFound { key: key.raw() }.into())
    }

    fn slot_mut(&mut self, key: MetricKey) -> Result<&mut Slot> {
        self.slots
            .get_mut(key.index())
            .ok_or_else(|| MetricsError::KeyNotFound { key: key.raw() }.into())
    }

    /// Declared type of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] for a key outside the schema.
    pub fn metric_type(&self, key: MetricKey) -> Result<MetricType> {
        self.slot(key).map(Slot::metric_type)
    }

    /// Sets an unsigned metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_unsigned(&mut self, key: MetricKey, value: u32) -> Result<()> {
        match self.slot_mut(key)? {
            Slot::Unsigned(v) => {
                *v = Some(value);
                Ok(())
            }
            other => Err(type_mismatch(key, MetricType::Unsigned, other.metric_type()).into()),
        }
    }

    /// Sets a signed metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_signed(&mut self, key: MetricKey, value: i32) -> Result<()> {
        match self.slot_mut(key)? {
            Slot::Signed(v) => {
                *v = Some(value);
                Ok(())
            }
            other => Err(type_mismatch(key, MetricType::Signed, other.metric_type()).into()),
        }
    }

    /// Sets a string metric, truncating to its declared maximum length.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn set_string(&mut self, key: MetricKey, value: &str) -> Result<()> {
        match self.slot_mut(key)? {
            Slot::String {
                value: slot,
                max_length,
            } => {
                slot.clear();
                slot.push_str(truncate_to(value, *max_length));
                Ok(())
            }
            other => Err(type_mismatch(key, MetricType::String, other.metric_type()).into()),
        }
    }

    /// Adds `amount` to an integer metric, saturating at the type's bounds.
    ///
    /// An unset metric counts from zero.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`], or [`MetricsError::TypeMismatch`]
    /// for timers and strings.
    pub fn add(&mut self, key: MetricKey, amount: i32) -> Result<()> {
        match self.slot_mut(key)? {
            Slot::Unsigned(v) => {
                let current = v.unwrap_or(0);
                *v = Some(current.saturating_add_signed(amount));
                Ok(())
            }
            Slot::Signed(v) => {
                *v = Some(v.unwrap_or(0).saturating_add(amount));
                Ok(())
            }
            other => Err(type_mismatch(key, MetricType::Unsigned, other.metric_type()).into()),
        }
    }

    fn update_timer(&mut self, key: MetricKey, op: TimerOp, now_ms: u64) -> Result<bool> {
        match self.slot_mut(key)? {
            Slot::Timer(timer) => Ok(timer.update(op, now_ms)),
            other => Err(type_mismatch(key, MetricType::Timer, other.metric_type()).into()),
        }
    }

    /// Starts a timer at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoChange`] if the timer is already running,
    /// [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn timer_start(&mut self, key: MetricKey, now_ms: u64) -> Result<()> {
        if self.update_timer(key, TimerOp::Start, now_ms)? {
            Ok(())
        } else {
            Err(MetricsError::NoChange { key: key.raw() }.into())
        }
    }

    /// Stops a timer at `now_ms`, accumulating the elapsed interval.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoChange`] if the timer is not running,
    /// [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn timer_stop(&mut self, key: MetricKey, now_ms: u64) -> Result<()> {
        if self.update_timer(key, TimerOp::Stop, now_ms)? {
            Ok(())
        } else {
            Err(MetricsError::NoChange { key: key.raw() }.into())
        }
    }

    /// Whether a timer is running.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn timer_is_running(&self, key: MetricKey) -> Result<bool> {
        match self.slot(key)? {
            Slot::Timer(timer) => Ok(timer.running),
            other => Err(type_mismatch(key, MetricType::Timer, other.metric_type()).into()),
        }
    }

    /// Reads an unsigned metric; `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_unsigned(&self, key: MetricKey) -> Result<Option<u32>> {
        match self.slot(key)? {
            Slot::Unsigned(v) => Ok(*v),
            other => Err(type_mismatch(key, MetricType::Unsigned, other.metric_type()).into()),
        }
    }

    /// Reads a signed metric; `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_signed(&self, key: MetricKey) -> Result<Option<i32>> {
        match self.slot(key)? {
            Slot::Signed(v) => Ok(*v),
            other => Err(type_mismatch(key, MetricType::Signed, other.metric_type()).into()),
        }
    }

    /// Reads a timer, first tallying it up to `now_ms` if it is running.
    ///
    /// The timer keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_timer(&mut self, key: MetricKey, now_ms: u64) -> Result<u32> {
        match self.slot_mut(key)? {
            Slot::Timer(timer) => {
                timer.update(TimerOp::Tally, now_ms);
                Ok(timer.value)
            }
            other => Err(type_mismatch(key, MetricType::Timer, other.metric_type()).into()),
        }
    }

    /// Reads a string metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] or [`MetricsError::TypeMismatch`].
    pub fn read_string(&self, key: MetricKey) -> Result<&str> {
        match self.slot(key)? {
            Slot::String { value, .. } => Ok(value.as_str()),
            other => Err(type_mismatch(key, MetricType::String, other.metric_type()).into()),
        }
    }

    /// Current value of any metric, without tallying timers.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::KeyNotFound`] for a key outside the schema.
    pub fn value(&self, key: MetricKey) -> Result<MetricValue<'_>> {
        Ok(match self.slot(key)? {
            Slot::Unsigned(v) => MetricValue::Unsigned(*v),
            Slot::Signed(v) => MetricValue::Signed(*v),
            Slot::Timer(timer) => MetricValue::Timer(timer.is_set.then_some(timer.value)),
            Slot::String { value, .. } => MetricValue::String(value.as_str()),
        })
    }

    /// Tallies every running timer in `session` up to `now_ms`.
    pub fn tally_session(&mut self, session: SessionKey, now_ms: u64) {
        for key in self.schema.session_metrics(session) {
            if let Some(Slot::Timer(timer)) = self.slots.get_mut(key.index()) {
                timer.update(TimerOp::Tally, now_ms);
            }
        }
    }

    /// Resets every metric in `session`.
    ///
    /// Integers become unset, strings empty, and timers return to zero while
    /// keeping their running state.
    pub fn reset_session(&mut self, session: SessionKey) {
        for key in self.schema.session_metrics(session) {
            if let Some(slot) = self.slots.get_mut(key.index()) {
                slot.reset();
            }
        }
    }

    /// Resets every metric in every session, stopping all timers.
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
            if let Slot::Timer(timer) = slot {
                timer.running = false;
                timer.start_ms = 0;
            }
        }
    }
}
