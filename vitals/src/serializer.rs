//! Event encoding.
//!
//! Turns a session's metric values, or a trace event, into one CBOR record
//! written through the [`EventStorage`] contract.
//!
//! # Wire Format
//!
//! ```text
//! map(7) {
//!   2  type             : 1 (heartbeat / session) | 2 (trace)
//!   3  schema version   : 1
//!   7  device serial    : text
//!   10 software type    : text
//!   9  software version : text
//!   6  hardware version : text
//!   4  event info       : heartbeat -> map(1) { session id: [values...] }
//!                         trace     -> map(n) { 6: reason, 2: pc?, 3: lr? }
//! }
//! ```
//!
//! Metric values are positional, in schema order. Unset integers and timers
//! that never accumulated are encoded as `null` so positions never shift.
//!
//! # Sizing
//!
//! Worst-case sizes are computed by running the same encoding in size-only
//! mode with extremal placeholder values (`u32::MAX`, `i32::MIN`, full-length
//! strings). Writes are all-or-nothing: any encoding failure rolls the storage
//! transaction back.

use tracing::error;

use crate::cbor::Encoder;
use crate::config::DeviceInfo;
use crate::error::{EncodeError, MetricsError};
use crate::metrics::{MetricValue, MetricsTable};
use crate::schema::{MAX_STRING_LENGTH, MetricType, ResolvedSchema, SessionKey};
use crate::storage::{EventStorage, RECORD_HEADER_SIZE};
use crate::trace::TraceEvent;

/// Version of the event layout.
pub const SCHEMA_VERSION: u64 = 1;

/// Top-level event keys.
mod event_key {
    pub const TYPE: u64 = 2;
    pub const SCHEMA_VERSION: u64 = 3;
    pub const EVENT_INFO: u64 = 4;
    pub const HARDWARE_VERSION: u64 = 6;
    pub const DEVICE_SERIAL: u64 = 7;
    pub const SOFTWARE_VERSION: u64 = 9;
    pub const SOFTWARE_TYPE: u64 = 10;
}

/// Trace event info keys.
mod trace_key {
    pub const PROGRAM_COUNTER: u64 = 2;
    pub const LINK_REGISTER: u64 = 3;
    pub const REASON: u64 = 6;
}

const TOP_LEVEL_PAIRS: usize = 7;

static PLACEHOLDER: [u8; MAX_STRING_LENGTH] = [b'x'; MAX_STRING_LENGTH];

/// Kind of event, encoded under the `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Periodic heartbeat or user session metrics.
    Heartbeat = 1,
    /// Trace event.
    Trace = 2,
}

fn encode_header(
    enc: &mut Encoder<'_>,
    device: &DeviceInfo,
    event_type: EventType,
) -> Result<(), EncodeError> {
    enc.encode_map_header(TOP_LEVEL_PAIRS)?;
    enc.encode_unsigned(event_key::TYPE)?;
    enc.encode_unsigned(event_type as u64)?;
    enc.encode_unsigned(event_key::SCHEMA_VERSION)?;
    enc.encode_unsigned(SCHEMA_VERSION)?;
    enc.encode_unsigned(event_key::DEVICE_SERIAL)?;
    enc.encode_str(&device.device_serial)?;
    enc.encode_unsigned(event_key::SOFTWARE_TYPE)?;
    enc.encode_str(&device.software_type)?;
    enc.encode_unsigned(event_key::SOFTWARE_VERSION)?;
    enc.encode_str(&device.software_version)?;
    enc.encode_unsigned(event_key::HARDWARE_VERSION)?;
    enc.encode_str(&device.hardware_version)?;
    enc.encode_unsigned(event_key::EVENT_INFO)
}

fn encode_value(enc: &mut Encoder<'_>, value: MetricValue<'_>) -> Result<(), EncodeError> {
    match value {
        MetricValue::Unsigned(Some(v)) | MetricValue::Timer(Some(v)) => {
            enc.encode_unsigned(u64::from(v))
        }
        MetricValue::Signed(Some(v)) => enc.encode_signed(i64::from(v)),
        MetricValue::String(s) => enc.encode_str(s),
        MetricValue::Unsigned(None) | MetricValue::Signed(None) | MetricValue::Timer(None) => {
            enc.encode_null()
        }
    }
}

/// Largest possible value for a metric of `metric_type`.
fn worst_case_value(metric_type: MetricType, max_length: usize) -> MetricValue<'static> {
    match metric_type {
        MetricType::Unsigned => MetricValue::Unsigned(Some(u32::MAX)),
        MetricType::Signed => MetricValue::Signed(Some(i32::MIN)),
        MetricType::Timer => MetricValue::Timer(Some(u32::MAX)),
        MetricType::String => {
            let len = max_length.min(MAX_STRING_LENGTH);
            MetricValue::String(std::str::from_utf8(&PLACEHOLDER[..len]).unwrap_or_default())
        }
    }
}

/// Encodes a session event. With `table == None` placeholder values are used.
fn encode_session(
    enc: &mut Encoder<'_>,
    schema: &ResolvedSchema,
    table: Option<&MetricsTable>,
    device: &DeviceInfo,
    session: SessionKey,
) -> Result<(), EncodeError> {
    let keys = schema.session_metrics(session);

    encode_header(enc, device, EventType::Heartbeat)?;
    enc.encode_map_header(1)?;
    enc.encode_unsigned(u64::from(session.raw()))?;
    enc.encode_array_header(keys.len())?;

    for &key in keys {
        let value = match table {
            Some(table) => table.value(key).ok(),
            None => schema
                .metric(key)
                .map(|m| worst_case_value(m.metric_type, m.max_length)),
        };
        match value {
            Some(value) => encode_value(enc, value)?,
            None => enc.encode_null()?,
        }
    }
    Ok(())
}

fn encode_trace(
    enc: &mut Encoder<'_>,
    device: &DeviceInfo,
    event: &TraceEvent,
) -> Result<(), EncodeError> {
    let pairs = 1 + usize::from(event.pc.is_some()) + usize::from(event.lr.is_some());

    encode_header(enc, device, EventType::Trace)?;
    enc.encode_map_header(pairs)?;
    enc.encode_unsigned(trace_key::REASON)?;
    enc.encode_unsigned(u64::from(event.reason))?;
    if let Some(pc) = event.pc {
        enc.encode_unsigned(trace_key::PROGRAM_COUNTER)?;
        enc.encode_unsigned(u64::from(pc))?;
    }
    if let Some(lr) = event.lr {
        enc.encode_unsigned(trace_key::LINK_REGISTER)?;
        enc.encode_unsigned(u64::from(lr))?;
    }
    Ok(())
}

/// Runs `encode` inside one storage transaction, committing on success and
/// rolling back on any failure. Returns the payload size written.
fn write_event<F>(storage: &mut dyn EventStorage, encode: F) -> Result<usize, EncodeError>
where
    F: FnOnce(&mut Encoder<'_>) -> Result<(), EncodeError>,
{
    let budget = storage.begin_write();
    if budget == 0 {
        return Err(EncodeError::OutOfSpace {
            needed: 1,
            remaining: 0,
        });
    }

    let result = {
        let mut enc = Encoder::with_storage(&mut *storage, budget);
        encode(&mut enc).map(|()| enc.encoded_size())
    };
    storage.finish_write(result.is_err());
    result
}

/// Worst-case encoded payload size of a `session` event.
///
/// Does not include the storage record header.
pub fn compute_worst_case_size(
    schema: &ResolvedSchema,
    device: &DeviceInfo,
    session: SessionKey,
) -> usize {
    let mut enc = Encoder::size_only();
    // Size-only encoding has no capacity limit and cannot fail.
    let _ = encode_session(&mut enc, schema, None, device, session);
    enc.encoded_size()
}

/// Worst-case encoded payload size of a trace event.
pub fn compute_trace_worst_case_size(device: &DeviceInfo) -> usize {
    let mut enc = Encoder::size_only();
    let worst = TraceEvent {
        reason: u32::MAX,
        pc: Some(u32::MAX),
        lr: Some(u32::MAX),
    };
    let _ = encode_trace(&mut enc, device, &worst);
    enc.encoded_size()
}

/// Serializes the current values of `session` as one event.
///
/// Returns the payload size written.
///
/// # Errors
///
/// Returns [`EncodeError::OutOfSpace`] if the event did not fit; the storage
/// is left exactly as it was before the call.
pub fn serialize_session(
    storage: &mut dyn EventStorage,
    table: &MetricsTable,
    device: &DeviceInfo,
    session: SessionKey,
) -> Result<usize, EncodeError> {
    write_event(storage, |enc| {
        encode_session(enc, table.schema(), Some(table), device, session)
    })
    .inspect_err(|e| error!(session = session.raw(), error = %e, "metrics storage out of space"))
}

/// Serializes a trace event.
///
/// # Errors
///
/// Returns [`EncodeError::OutOfSpace`] if the event did not fit; the storage
/// is left exactly as it was before the call.
pub fn serialize_trace(
    storage: &mut dyn EventStorage,
    device: &DeviceInfo,
    event: &TraceEvent,
) -> Result<usize, EncodeError> {
    write_event(storage, |enc| encode_trace(enc, device, event))
        .inspect_err(|e| error!(error = %e, "trace storage out of space"))
}

/// Checks that a storage of `storage_size` bytes can hold an event whose
/// payload is at most `worst_case_payload` bytes, header included.
///
/// # Errors
///
/// Returns [`MetricsError::StorageTooSmall`] with the required total size.
pub fn check_storage_size(
    storage_size: usize,
    worst_case_payload: usize,
) -> Result<(), MetricsError> {
    let needed = worst_case_payload + RECORD_HEADER_SIZE;
    if needed > storage_size {
        return Err(MetricsError::StorageTooSmall {
            needed,
            available: storage_size,
        });
    }
    Ok(())
}
