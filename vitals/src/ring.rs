//! Fixed-capacity byte ring buffer over caller-supplied storage.
//!
//! This is the lowest layer of event storage. It knows nothing about records
//! or transactions; it only moves bytes in and out of a circular region.
//!
//! # Design
//!
//! The ring is an arena plus two cursors:
//! - `read_offset` is the index of the oldest unread byte
//! - `read_size` is the number of unread bytes
//!
//! The write cursor is derived (`read_offset + read_size`), and every index
//! into storage goes through a single `wrap` helper. Every mutating operation is
//! all-or-nothing: on error the buffer is untouched.
//!
//! The ring has no synchronization of its own. Callers that share it with
//! interrupt context wrap each call in their critical section.

use crate::error::{Result, RingError};

/// A byte ring buffer over storage owned by the caller.
///
/// `S` is anything that can be viewed as a mutable byte slice: a boxed slice,
/// a `Vec<u8>`, a fixed array, or a `&'static mut [u8]` carved out of a
/// linker section.
///
/// # Invariants
///
/// `read_size <= capacity` and `read_offset < capacity` at all times.
#[derive(Debug)]
pub struct RingBuffer<S = Box<[u8]>> {
    storage: S,
    read_offset: usize,
    read_size: usize,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> RingBuffer<S> {
    /// Creates a ring buffer over `storage`, zeroing it.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::EmptyStorage`] if `storage` has zero length.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vitals::ring::RingBuffer;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut ring = RingBuffer::new(vec![0u8; 8])?;
    /// ring.write(&[1, 2, 3])?;
    /// assert_eq!(ring.read_size(), 3);
    /// assert_eq!(ring.write_size(), 5);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(mut storage: S) -> Result<Self> {
        if storage.as_ref().is_empty() {
            return Err(RingError::EmptyStorage.into());
        }

        storage.as_mut().fill(0);

        Ok(Self {
            storage,
            read_offset: 0,
            read_size: 0,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().len()
    }

    /// Number of unread bytes.
    #[inline]
    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// Number of free bytes (`capacity - read_size`).
    #[inline]
    pub fn write_size(&self) -> usize {
        self.capacity() - self.read_size
    }

    /// Maps a logical position (relative to the start of storage, possibly
    /// past the end) onto a storage index.
    #[inline]
    fn wrap(&self, position: usize) -> usize {
        position % self.capacity()
    }

    /// Copies `bytes` into storage starting at `start`, wrapping at the end.
    ///
    /// Caller guarantees `bytes.len() <= capacity`.
    fn copy_in(&mut self, start: usize, bytes: &[u8]) {
        let capacity = self.capacity();
        let first = bytes.len().min(capacity - start);
        let storage = self.storage.as_mut();
        storage[start..start + first].copy_from_slice(&bytes[..first]);
        storage[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }

    /// Appends `bytes` after the newest unread byte.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InsufficientSpace`] if `bytes` does not fit in the
    /// free space. Nothing is written in that case.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let available = self.write_size();
        if bytes.len() > available {
            return Err(RingError::InsufficientSpace {
                requested: bytes.len(),
                available,
            }
            .into());
        }

        let start = self.wrap(self.read_offset + self.read_size);
        self.copy_in(start, bytes);
        self.read_size += bytes.len();
        Ok(())
    }

    /// Overwrites bytes starting `offset_from_end` bytes before the write
    /// cursor.
    ///
    /// If 10 bytes are unread and `offset_from_end` is 1, the write begins at
    /// unread offset 9. Any part of `bytes` that extends past the current write
    /// cursor is appended as new data. Used to patch a record header once the
    /// payload length is known.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::OutOfBounds`] if `offset_from_end > read_size`, or
    /// [`RingError::InsufficientSpace`] if the part extending past the write
    /// cursor does not fit.
    pub fn write_at_offset_from_end(&mut self, offset_from_end: usize, bytes: &[u8]) -> Result<()> {
        if offset_from_end > self.read_size {
            return Err(RingError::OutOfBounds {
                offset: offset_from_end,
                len: bytes.len(),
                read_size: self.read_size,
            }
            .into());
        }

        let new_tail = bytes.len().saturating_sub(offset_from_end);
        let available = self.write_size();
        if new_tail > available {
            return Err(RingError::InsufficientSpace {
                requested: new_tail,
                available,
            }
            .into());
        }

        let start = self.wrap(self.read_offset + self.read_size - offset_from_end);
        self.copy_in(start, bytes);
        self.read_size += new_tail;
        Ok(())
    }

    /// Copies `out.len()` bytes starting at unread `offset` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::OutOfBounds`] if the range extends past the unread
    /// region.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        if offset.checked_add(len).is_none_or(|end| end > self.read_size) {
            return Err(RingError::OutOfBounds {
                offset,
                len,
                read_size: self.read_size,
            }
            .into());
        }

        let start = self.wrap(self.read_offset + offset);
        let first = len.min(self.capacity() - start);
        let storage = self.storage.as_ref();
        out[..first].copy_from_slice(&storage[start..start + first]);
        out[first..].copy_from_slice(&storage[..len - first]);
        Ok(())
    }

    /// Returns the longest contiguous run of unread bytes starting at
    /// `offset`, without copying.
    ///
    /// Returns `None` if `offset > read_size`. The slice is empty when
    /// `offset == read_size`.
    pub fn get_read_pointer(&self, offset: usize) -> Option<&[u8]> {
        if offset > self.read_size {
            return None;
        }

        let start = self.wrap(self.read_offset + offset);
        let len = (self.read_size - offset).min(self.capacity() - start);
        Some(&self.storage.as_ref()[start..start + len])
    }

    /// Discards the `len` oldest unread bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::OutOfBounds`] if `len > read_size`.
    pub fn consume(&mut self, len: usize) -> Result<()> {
        self.check_consume(len)?;
        self.read_offset = self.wrap(self.read_offset + len);
        self.read_size -= len;
        Ok(())
    }

    /// Discards the `len` most recently written bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::OutOfBounds`] if `len > read_size`.
    pub fn consume_from_end(&mut self, len: usize) -> Result<()> {
        self.check_consume(len)?;
        self.read_size -= len;
        Ok(())
    }

    fn check_consume(&self, len: usize) -> Result<()> {
        if len > self.read_size {
            return Err(RingError::OutOfBounds {
                offset: 0,
                len,
                read_size: self.read_size,
            }
            .into());
        }
        Ok(())
    }

    /// Consumes the ring buffer and returns the underlying storage.
    pub fn into_storage(self) -> S {
        self.storage
    }
}
