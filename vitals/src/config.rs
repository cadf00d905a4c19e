//! Telemetry configuration.
//!
//! A [`TelemetryConfig`] bundles everything fixed at build time: the device
//! identity stamped into every event, the heartbeat interval, and the metrics
//! schema. It can be built in code or loaded from JSON:
//!
//! ```json
//! {
//!   "device": {
//!     "device_serial": "DEMO01",
//!     "software_type": "main",
//!     "software_version": "1.0.0",
//!     "hardware_version": "hw1"
//!   },
//!   "heartbeat_interval_secs": 3600,
//!   "builtins": { "connectivity": true, "reliability": true },
//!   "read_batch_max_bytes": 512,
//!   "schema": {
//!     "sessions": [{ "name": "upload" }],
//!     "metrics": [
//!       { "name": "boot_count", "type": "unsigned" },
//!       { "name": "bytes_sent", "type": "unsigned", "session": "upload" }
//!     ]
//!   }
//! }
//! ```
//!
//! `builtins` and `read_batch_max_bytes` are optional and off by default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::builtin::BuiltinMetrics;
use crate::error::{ConfigError, Result};
use crate::schema::MetricsSchema;

/// Default heartbeat interval: one hour.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u32 = 3600;

fn default_heartbeat_interval_secs() -> u32 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

/// Identity fields encoded into every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device serial number.
    pub device_serial: String,
    /// Firmware image type, e.g. `main` or `bootloader`.
    pub software_type: String,
    /// Firmware version.
    pub software_version: String,
    /// Hardware revision.
    pub hardware_version: String,
}

impl DeviceInfo {
    /// Creates device info from its four fields.
    pub fn new(
        device_serial: impl Into<String>,
        software_type: impl Into<String>,
        software_version: impl Into<String>,
        hardware_version: impl Into<String>,
    ) -> Self {
        Self {
            device_serial: device_serial.into(),
            software_type: software_type.into(),
            software_version: software_version.into(),
            hardware_version: hardware_version.into(),
        }
    }
}

/// Complete telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Device identity.
    pub device: DeviceInfo,

    /// Seconds between heartbeats. Driving the timer is up to the platform;
    /// the core only records the interval.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u32,

    /// Metrics schema.
    pub schema: MetricsSchema,

    /// Built-in metric groups added to the heartbeat.
    #[serde(default)]
    pub builtins: BuiltinMetrics,

    /// Payload limit for batched reads; `None` hands out one event per read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_batch_max_bytes: Option<usize>,
}

impl TelemetryConfig {
    /// Creates a configuration with the default heartbeat interval.
    pub fn new(device: DeviceInfo, schema: MetricsSchema) -> Self {
        Self {
            device,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            schema,
            builtins: BuiltinMetrics::default(),
            read_batch_max_bytes: None,
        }
    }

    /// The declared schema with the enabled built-in metrics appended.
    pub fn effective_schema(&self) -> MetricsSchema {
        let mut schema = self.schema.clone();
        schema.metrics.extend(self.builtins.metric_defs());
        schema
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be read or parsed, or any validation error from
    /// [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path.to_path_buf())
    }

    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON, or any validation
    /// error from [`validate`](Self::validate).
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::parse(text, PathBuf::new())
    }

    fn parse(text: &str, path: PathBuf) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the heartbeat interval and the effective schema.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidHeartbeatInterval`] for a zero interval
    /// or a [`SchemaError`](crate::error::SchemaError) from schema validation,
    /// including a declared metric that collides with a built-in one.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval.into());
        }
        self.effective_schema().validate()
    }

    /// Serializes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e).into())
    }
}
