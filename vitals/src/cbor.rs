//! Minimal CBOR (RFC 8949) encoder.
//!
//! Only the items events are built from are supported: unsigned and negative
//! integers, text strings, `null`, and definite-length map and array headers.
//!
//! The encoder is capacity-aware. Every item is checked against the remaining
//! budget before any byte is emitted, so a failed item never leaves a partial
//! encoding behind. In size-only mode nothing is written and the encoder just
//! counts; running the same encoding logic in both modes is how worst-case
//! event sizes are computed.

use crate::error::EncodeError;
use crate::storage::EventStorage;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

/// Encoding of the simple value `null`.
pub const NULL: u8 = 0xF6;

/// Longest possible item head: initial byte plus a 64-bit argument.
pub const MAX_HEAD_SIZE: usize = 9;

/// Encodes an item head into a fixed buffer, returning it and its length.
#[allow(clippy::cast_possible_truncation)] // each arm checks the range first
fn head_bytes(major: u8, value: u64) -> ([u8; MAX_HEAD_SIZE], usize) {
    let major = major << 5;
    let mut head = [0u8; MAX_HEAD_SIZE];
    let len = match value {
        0..=23 => {
            head[0] = major | value as u8;
            1
        }
        24..=0xFF => {
            head[..2].copy_from_slice(&[major | 24, value as u8]);
            2
        }
        0x100..=0xFFFF => {
            head[0] = major | 25;
            head[1..3].copy_from_slice(&(value as u16).to_be_bytes());
            3
        }
        0x1_0000..=0xFFFF_FFFF => {
            head[0] = major | 26;
            head[1..5].copy_from_slice(&(value as u32).to_be_bytes());
            5
        }
        _ => {
            head[0] = major | 27;
            head[1..].copy_from_slice(&value.to_be_bytes());
            9
        }
    };
    (head, len)
}

/// Encodes a definite-length array head for `len` items without allocating.
///
/// ```rust
/// use vitals::cbor::array_head;
///
/// let (head, len) = array_head(3);
/// assert_eq!(&head[..len], &[0x83]);
/// let (head, len) = array_head(300);
/// assert_eq!(&head[..len], &[0x99, 0x01, 0x2C]);
/// ```
pub fn array_head(len: usize) -> ([u8; MAX_HEAD_SIZE], usize) {
    head_bytes(MAJOR_ARRAY, len as u64)
}

/// Where encoded bytes go.
enum Sink<'a> {
    SizeOnly,
    Buffer(&'a mut Vec<u8>),
    Storage(&'a mut dyn EventStorage),
}

/// Capacity-aware CBOR encoder.
///
/// # Examples
///
/// ```rust
/// use vitals::cbor::Encoder;
///
/// let mut out = Vec::new();
/// let mut enc = Encoder::with_buffer(&mut out, 16);
/// enc.encode_map_header(1).unwrap();
/// enc.encode_unsigned(2).unwrap();
/// enc.encode_str("hi").unwrap();
/// assert_eq!(out, vec![0xA1, 0x02, 0x62, b'h', b'i']);
/// ```
pub struct Encoder<'a> {
    sink: Sink<'a>,
    capacity: usize,
    encoded: usize,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder that only counts bytes, with no capacity limit.
    pub fn size_only() -> Self {
        Self {
            sink: Sink::SizeOnly,
            capacity: usize::MAX,
            encoded: 0,
        }
    }

    /// Creates an encoder appending to `out`, refusing items past `capacity`
    /// bytes.
    pub fn with_buffer(out: &'a mut Vec<u8>, capacity: usize) -> Self {
        Self {
            sink: Sink::Buffer(out),
            capacity,
            encoded: 0,
        }
    }

    /// Creates an encoder appending to an open storage transaction.
    ///
    /// `capacity` is the budget returned by
    /// [`EventStorage::begin_write`].
    pub fn with_storage(storage: &'a mut dyn EventStorage, capacity: usize) -> Self {
        Self {
            sink: Sink::Storage(storage),
            capacity,
            encoded: 0,
        }
    }

    /// Number of bytes encoded so far.
    pub fn encoded_size(&self) -> usize {
        self.encoded
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let remaining = self.capacity - self.encoded;
        if bytes.len() > remaining {
            return Err(EncodeError::OutOfSpace {
                needed: bytes.len(),
                remaining,
            });
        }

        let written = match &mut self.sink {
            Sink::SizeOnly => true,
            Sink::Buffer(out) => {
                out.extend_from_slice(bytes);
                true
            }
            Sink::Storage(storage) => storage.append_data(bytes),
        };
        if !written {
            return Err(EncodeError::OutOfSpace {
                needed: bytes.len(),
                remaining,
            });
        }

        self.encoded += bytes.len();
        Ok(())
    }

    fn encode_head(&mut self, major: u8, value: u64) -> Result<(), EncodeError> {
        let (head, len) = head_bytes(major, value);
        self.emit(&head[..len])
    }

    /// Encodes an unsigned integer (major type 0).
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the item does not fit.
    pub fn encode_unsigned(&mut self, value: u64) -> Result<(), EncodeError> {
        self.encode_head(MAJOR_UNSIGNED, value)
    }

    /// Encodes a signed integer, using major type 1 (`-1 - n`) for negatives.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the item does not fit.
    #[allow(clippy::cast_sign_loss)] // both branches are non-negative
    pub fn encode_signed(&mut self, value: i64) -> Result<(), EncodeError> {
        if value < 0 {
            self.encode_head(MAJOR_NEGATIVE, !value as u64)
        } else {
            self.encode_head(MAJOR_UNSIGNED, value as u64)
        }
    }

    /// Encodes a UTF-8 text string (major type 3).
    ///
    /// The head and body are checked against capacity together.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the string does not fit.
    pub fn encode_str(&mut self, value: &str) -> Result<(), EncodeError> {
        let needed = head_size(value.len() as u64) + value.len();
        let remaining = self.capacity - self.encoded;
        if needed > remaining {
            return Err(EncodeError::OutOfSpace { needed, remaining });
        }

        self.encode_head(MAJOR_TEXT, value.len() as u64)?;
        self.emit(value.as_bytes())
    }

    /// Encodes `null`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the item does not fit.
    pub fn encode_null(&mut self) -> Result<(), EncodeError> {
        self.emit(&[NULL])
    }

    /// Encodes the header of a map with `pairs` key/value pairs.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the item does not fit.
    pub fn encode_map_header(&mut self, pairs: usize) -> Result<(), EncodeError> {
        self.encode_head(MAJOR_MAP, pairs as u64)
    }

    /// Encodes the header of an array with `len` items.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfSpace`] if the item does not fit.
    pub fn encode_array_header(&mut self, len: usize) -> Result<(), EncodeError> {
        self.encode_head(MAJOR_ARRAY, len as u64)
    }
}

/// Size in bytes of the head encoding `value`.
fn head_size(value: u64) -> usize {
    match value {
        0..=23 => 1,
        24..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}
