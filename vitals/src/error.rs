//! Error types for the vitals telemetry core.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::MetricType;

/// The main error type for all vitals operations.
///
/// Every failure in the core is local and synchronous: nothing here is ever
/// escalated to a fault or a reset. Storage failures are recovered by rollback
/// and surface only as counted drops; metric misuse is reported to the caller.
#[derive(Error, Debug)]
pub enum VitalsError {
    /// Error from the ring buffer byte store.
    #[error("ring buffer error: {0}")]
    Ring(#[from] RingError),

    /// Error from a metrics table operation.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Error during schema validation.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error capturing a trace event.
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),

    /// Error encoding an event.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// Errors from [`RingBuffer`](crate::ring::RingBuffer) operations.
///
/// All ring operations are all-or-nothing: when one of these is returned the
/// buffer is unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The caller supplied a zero-length storage region.
    #[error("ring storage must not be empty")]
    EmptyStorage,

    /// Not enough free space for the requested write.
    #[error("insufficient space: requested {requested} bytes, {available} available")]
    InsufficientSpace {
        /// Bytes the caller tried to write.
        requested: usize,
        /// Bytes currently free.
        available: usize,
    },

    /// The requested range lies outside the unread region.
    #[error("range {offset}+{len} exceeds {read_size} readable bytes")]
    OutOfBounds {
        /// Requested offset from the oldest unread byte (or from the end).
        offset: usize,
        /// Requested length.
        len: usize,
        /// Bytes currently readable.
        read_size: usize,
    },
}

/// Errors returned by the metrics API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// The key is outside the schema.
    #[error("metric key {key} not found")]
    KeyNotFound {
        /// The raw key index.
        key: u16,
    },

    /// The operation expects a different metric type than the one declared.
    #[error("metric key {key} is {actual:?}, operation expects {expected:?}")]
    TypeMismatch {
        /// The raw key index.
        key: u16,
        /// The type the operation works on.
        expected: MetricType,
        /// The declared type of the metric.
        actual: MetricType,
    },

    /// A parameter was unusable (empty output buffer, unknown session, ...).
    #[error("bad parameter: {reason}")]
    BadParameter {
        /// What was wrong with the parameter.
        reason: String,
    },

    /// A timer or session was already in the requested state.
    #[error("metric key {key} already in requested state")]
    NoChange {
        /// The raw key index of the timer.
        key: u16,
    },

    /// The storage cannot hold the largest possible event.
    #[error("storage too small: need {needed} bytes, have {available}")]
    StorageTooSmall {
        /// Bytes the worst-case event needs, including the record header.
        needed: usize,
        /// Total storage capacity.
        available: usize,
    },

    /// Serializing a session ran out of storage space and was rolled back.
    #[error("out of storage space serializing session {session}")]
    OutOfSpace {
        /// Index of the session that was dropped.
        session: u8,
    },
}

/// Errors that can occur during schema validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No metrics are declared.
    #[error("at least one metric must be declared")]
    Empty,

    /// Two metrics share a name.
    #[error("duplicate metric name '{name}'")]
    DuplicateMetric {
        /// The repeated name.
        name: String,
    },

    /// Two sessions share a name.
    #[error("duplicate session name '{name}'")]
    DuplicateSession {
        /// The repeated name.
        name: String,
    },

    /// A metric references a session that is not declared.
    #[error("metric '{metric}' references unknown session '{session}'")]
    UnknownSession {
        /// The metric name.
        metric: String,
        /// The session name it references.
        session: String,
    },

    /// A ranged metric has `min > max`.
    #[error("metric '{metric}' has invalid range {min}..={max}")]
    InvalidRange {
        /// The metric name.
        metric: String,
        /// Declared minimum.
        min: i64,
        /// Declared maximum.
        max: i64,
    },

    /// A string metric has an unusable maximum length.
    #[error("string metric '{metric}' has invalid max length {max_length}")]
    StringTooLong {
        /// The metric name.
        metric: String,
        /// Declared maximum length.
        max_length: usize,
    },

    /// More metrics than a [`MetricKey`](crate::schema::MetricKey) can index.
    #[error("too many metrics: {count}")]
    TooManyMetrics {
        /// Number of metrics declared, including session timers.
        count: usize,
    },

    /// More sessions than a [`SessionKey`](crate::schema::SessionKey) can index.
    #[error("too many sessions: {count}")]
    TooManySessions {
        /// Number of sessions declared.
        count: usize,
    },

    /// A metric or session name is empty or contains unsupported characters.
    #[error("invalid name '{name}'")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// An enabled built-in metric group has no definition in the schema.
    #[error("built-in metric '{name}' is not declared")]
    MissingBuiltin {
        /// The missing metric name.
        name: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config path (empty when parsed from a string).
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The configuration could not be written out as JSON.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The heartbeat interval must be non-zero.
    #[error("heartbeat interval must be greater than zero")]
    InvalidHeartbeatInterval,
}

/// Errors that can occur when capturing a trace event.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// The event did not fit in storage and was rolled back.
    #[error("out of storage space for trace event")]
    OutOfSpace,

    /// The staging slot was claimed by a concurrent producer or flush.
    #[error("trace mailbox busy")]
    MailboxBusy,
}

/// Errors from the [`Encoder`](crate::cbor::Encoder).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The destination cannot take the next item.
    #[error("encoder out of space: item needs {needed} bytes, {remaining} remaining")]
    OutOfSpace {
        /// Bytes the item needs.
        needed: usize,
        /// Bytes left in the destination budget.
        remaining: usize,
    },
}

/// Type alias for `Result<T, VitalsError>`.
pub type Result<T> = std::result::Result<T, VitalsError>;
