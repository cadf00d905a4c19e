//! Declarative metrics schema.
//!
//! A schema is a fixed, ordered list of metric definitions plus an ordered list
//! of user sessions. It is declared once before boot, either as `static`
//! arrays built with the `const fn` constructors below or loaded from a JSON
//! configuration file, and is never changed at runtime.
//!
//! # Keys
//!
//! Every metric gets a stable [`MetricKey`]: its index in declaration order.
//! The [`metric_keys!`](crate::metric_keys) macro generates matching
//! constants. Sessions are keyed the same way, with [`SessionKey::HEARTBEAT`]
//! (index 0) reserved for the always-running heartbeat session and user
//! sessions numbered from 1.
//!
//! Each user session also owns an implicit timer metric named
//! `<session>__duration`. These are appended after all declared metrics, in
//! session order, so declared keys are never shifted.
//!
//! Metric order is part of the wire format: values are encoded positionally.
//! Keep schemas append-only across firmware versions.
//!
//! # Example
//!
//! ```rust
//! use vitals::schema::{MetricDef, MetricsSchema, SessionDef};
//!
//! static METRICS: &[MetricDef] = &[
//!     MetricDef::unsigned("boot_count"),
//!     MetricDef::signed("temperature_c").with_range(-40, 125),
//!     MetricDef::timer("radio_on_ms"),
//!     MetricDef::string("fw_channel", 8),
//!     MetricDef::unsigned("bytes_sent").in_session("upload"),
//! ];
//! static SESSIONS: &[SessionDef] = &[SessionDef::new("upload")];
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = MetricsSchema::from_static(METRICS, SESSIONS).resolve()?;
//! assert_eq!(schema.len(), 6); // five declared + upload__duration
//! assert_eq!(schema.key_of("upload__duration").map(|k| k.index()), Some(5));
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Name of the implicit heartbeat session.
pub const HEARTBEAT_SESSION_NAME: &str = "heartbeat";

/// Suffix of the implicit per-session duration timer.
pub const SESSION_DURATION_SUFFIX: &str = "__duration";

/// Largest `max_length` a string metric may declare.
pub const MAX_STRING_LENGTH: usize = 255;

/// Value type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// `u32` value, saturating on `add`.
    Unsigned,
    /// `i32` value, saturating on `add`.
    Signed,
    /// Accumulated milliseconds with start/stop, 31-bit range.
    Timer,
    /// Bounded UTF-8 string.
    String,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsigned => "unsigned",
            Self::Signed => "signed",
            Self::Timer => "timer",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a metric: its index in the resolved schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey(u16);

impl MetricKey {
    /// Creates a key for the metric at `index`.
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// The raw key value.
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// The key as a table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u8);

impl SessionKey {
    /// The always-running heartbeat session.
    pub const HEARTBEAT: Self = Self(0);

    /// Creates a key for the session at `index` (0 is the heartbeat).
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// The raw key value, also used as the session id on the wire.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// The key as a table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the heartbeat session.
    pub const fn is_heartbeat(self) -> bool {
        self.0 == 0
    }
}

/// Declaration of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDef {
    /// Unique metric name.
    pub name: Cow<'static, str>,

    /// Value type.
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Expected minimum, informational for integer metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,

    /// Expected maximum, informational for integer metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,

    /// Maximum length in bytes. Required for string metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Owning user session; `None` means the heartbeat session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Cow<'static, str>>,
}

impl MetricDef {
    const fn plain(name: &'static str, metric_type: MetricType) -> Self {
        Self {
            name: Cow::Borrowed(name),
            metric_type,
            min: None,
            max: None,
            max_length: None,
            session: None,
        }
    }

    /// Declares an unsigned integer metric.
    pub const fn unsigned(name: &'static str) -> Self {
        Self::plain(name, MetricType::Unsigned)
    }

    /// Declares a signed integer metric.
    pub const fn signed(name: &'static str) -> Self {
        Self::plain(name, MetricType::Signed)
    }

    /// Declares a timer metric.
    pub const fn timer(name: &'static str) -> Self {
        Self::plain(name, MetricType::Timer)
    }

    /// Declares a string metric holding at most `max_length` bytes.
    pub const fn string(name: &'static str, max_length: usize) -> Self {
        let mut def = Self::plain(name, MetricType::String);
        def.max_length = Some(max_length);
        def
    }

    /// Sets the expected value range.
    #[must_use]
    pub const fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Scopes the metric to a user session.
    #[must_use]
    pub const fn in_session(mut self, session: &'static str) -> Self {
        // Plain assignment would drop the old value, which const eval rejects.
        // Every constructor leaves `session` empty or borrowed, so nothing leaks.
        std::mem::forget(std::mem::replace(
            &mut self.session,
            Some(Cow::Borrowed(session)),
        ));
        self
    }
}

/// Declaration of one user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDef {
    /// Unique session name.
    pub name: Cow<'static, str>,
}

impl SessionDef {
    /// Declares a session.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }
}

/// Unvalidated schema declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSchema {
    /// User sessions in declaration order.
    #[serde(default)]
    pub sessions: Vec<SessionDef>,

    /// Metrics in declaration order.
    pub metrics: Vec<MetricDef>,
}

impl MetricsSchema {
    /// Creates a schema from owned definitions.
    pub fn new(metrics: Vec<MetricDef>, sessions: Vec<SessionDef>) -> Self {
        Self { sessions, metrics }
    }

    /// Creates a schema from `static` definition tables.
    pub fn from_static(metrics: &'static [MetricDef], sessions: &'static [SessionDef]) -> Self {
        Self::new(metrics.to_vec(), sessions.to_vec())
    }

    /// Validates the schema without resolving it.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.resolve().map(|_| ())
    }

    /// Validates the schema and assigns keys.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if:
    /// - no metrics are declared
    /// - a metric or session name is empty, repeated or has characters outside
    ///   `[A-Za-z0-9_.]`
    /// - a metric references an undeclared session
    /// - a metric declares `min > max`
    /// - a string metric's `max_length` is missing, zero or above
    ///   [`MAX_STRING_LENGTH`]
    /// - there are more metrics or sessions than keys can index
    pub fn resolve(&self) -> Result<ResolvedSchema> {
        if self.metrics.is_empty() {
            return Err(SchemaError::Empty.into());
        }

        let session_count = self.sessions.len() + 1;
        if session_count > usize::from(u8::MAX) {
            return Err(SchemaError::TooManySessions {
                count: self.sessions.len(),
            }
            .into());
        }
        let metric_count = self.metrics.len() + self.sessions.len();
        if metric_count > usize::from(u16::MAX) {
            return Err(SchemaError::TooManyMetrics {
                count: metric_count,
            }
            .into());
        }

        let mut sessions: Vec<Cow<'static, str>> = Vec::with_capacity(session_count);
        sessions.push(Cow::Borrowed(HEARTBEAT_SESSION_NAME));
        for session in &self.sessions {
            validate_name(&session.name)?;
            if sessions.contains(&session.name) {
                return Err(SchemaError::DuplicateSession {
                    name: session.name.to_string(),
                }
                .into());
            }
            sessions.push(session.name.clone());
        }

        let mut metrics = Vec::with_capacity(metric_count);
        let mut names = HashSet::with_capacity(metric_count);
        for def in &self.metrics {
            validate_name(&def.name)?;
            let session = resolve_session(&sessions, def)?;
            let max_length = validate_def(def)?;
            metrics.push(MetricInfo {
                key: MetricKey::new(key_index(metrics.len())),
                name: def.name.clone(),
                metric_type: def.metric_type,
                session,
                min: def.min,
                max: def.max,
                max_length,
            });
        }

        let mut session_timers = vec![None; session_count];
        for (index, name) in sessions.iter().enumerate().skip(1) {
            let key = MetricKey::new(key_index(metrics.len()));
            session_timers[index] = Some(key);
            metrics.push(MetricInfo {
                key,
                name: Cow::Owned(format!("{name}{SESSION_DURATION_SUFFIX}")),
                metric_type: MetricType::Timer,
                session: SessionKey::new(session_index(index)),
                min: None,
                max: None,
                max_length: 0,
            });
        }

        for metric in &metrics {
            if !names.insert(metric.name.as_ref()) {
                return Err(SchemaError::DuplicateMetric {
                    name: metric.name.to_string(),
                }
                .into());
            }
        }

        let mut session_metrics = vec![Vec::new(); session_count];
        for metric in &metrics {
            session_metrics[metric.session.index()].push(metric.key);
        }

        Ok(ResolvedSchema {
            metrics,
            sessions,
            session_timers,
            session_metrics,
        })
    }
}

#[allow(clippy::cast_possible_truncation)] // bounded by the TooManyMetrics check
fn key_index(index: usize) -> u16 {
    index as u16
}

#[allow(clippy::cast_possible_truncation)] // bounded by the TooManySessions check
fn session_index(index: usize) -> u8 {
    index as u8
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(SchemaError::InvalidName {
            name: name.to_string(),
        }
        .into());
    }
    Ok(())
}

fn resolve_session(sessions: &[Cow<'static, str>], def: &MetricDef) -> Result<SessionKey> {
    let Some(name) = &def.session else {
        return Ok(SessionKey::HEARTBEAT);
    };
    sessions
        .iter()
        .position(|s| s == name)
        .map(|index| SessionKey::new(session_index(index)))
        .ok_or_else(|| {
            SchemaError::UnknownSession {
                metric: def.name.to_string(),
                session: name.to_string(),
            }
            .into()
        })
}

/// Checks per-type constraints and returns the effective string length.
fn validate_def(def: &MetricDef) -> Result<usize> {
    if let (Some(min), Some(max)) = (def.min, def.max)
        && min > max
    {
        return Err(SchemaError::InvalidRange {
            metric: def.name.to_string(),
            min,
            max,
        }
        .into());
    }

    if def.metric_type != MetricType::String {
        return Ok(0);
    }

    match def.max_length {
        Some(len) if (1..=MAX_STRING_LENGTH).contains(&len) => Ok(len),
        other => Err(SchemaError::StringTooLong {
            metric: def.name.to_string(),
            max_length: other.unwrap_or(0),
        }
        .into()),
    }
}

/// A metric after validation, with its key and owning session assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricInfo {
    /// Stable key.
    pub key: MetricKey,
    /// Metric name.
    pub name: Cow<'static, str>,
    /// Value type.
    pub metric_type: MetricType,
    /// Owning session.
    pub session: SessionKey,
    /// Expected minimum.
    pub min: Option<i64>,
    /// Expected maximum.
    pub max: Option<i64>,
    /// Maximum string length in bytes; 0 for non-string metrics.
    pub max_length: usize,
}

/// A validated schema with keys assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    metrics: Vec<MetricInfo>,
    sessions: Vec<Cow<'static, str>>,
    session_timers: Vec<Option<MetricKey>>,
    session_metrics: Vec<Vec<MetricKey>>,
}

impl ResolvedSchema {
    /// Number of metrics, including session duration timers.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Always `false`: a resolved schema has at least one metric.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// All metrics in key order.
    pub fn metrics(&self) -> &[MetricInfo] {
        &self.metrics
    }

    /// Looks up a metric by key.
    pub fn metric(&self, key: MetricKey) -> Option<&MetricInfo> {
        self.metrics.get(key.index())
    }

    /// Looks up a metric key by name.
    pub fn key_of(&self, name: &str) -> Option<MetricKey> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.key)
    }

    /// Number of sessions, including the heartbeat.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every session key, heartbeat first.
    pub fn sessions(&self) -> impl Iterator<Item = SessionKey> + '_ {
        (0..self.sessions.len()).map(|index| SessionKey::new(session_index(index)))
    }

    /// Looks up a session key by name.
    pub fn session_key(&self, name: &str) -> Option<SessionKey> {
        self.sessions
            .iter()
            .position(|s| s == name)
            .map(|index| SessionKey::new(session_index(index)))
    }

    /// Name of a session.
    pub fn session_name(&self, session: SessionKey) -> Option<&str> {
        self.sessions.get(session.index()).map(AsRef::as_ref)
    }

    /// Keys of the metrics owned by `session`, in key order.
    pub fn session_metrics(&self, session: SessionKey) -> &[MetricKey] {
        self.session_metrics
            .get(session.index())
            .map_or(&[][..], Vec::as_slice)
    }

    /// The implicit duration timer of a user session.
    pub fn session_timer(&self, session: SessionKey) -> Option<MetricKey> {
        self.session_timers.get(session.index()).copied().flatten()
    }
}
