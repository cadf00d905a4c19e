//! Transactional event storage on top of [`RingBuffer`].
//!
//! Producers write an event as one transaction:
//!
//! ```text
//! begin_write() -> append_data(..)* -> finish_write(commit | rollback)
//! ```
//!
//! Only one transaction may be open at a time. Consumers drain committed
//! records oldest first through the [`DataSource`] contract.
//!
//! # Record Format
//!
//! ```text
//! +-----------------------+---------------------------+
//! | total_size: u16 (LE)  | payload (total_size - 2)  |
//! +-----------------------+---------------------------+
//! ```
//!
//! `total_size` counts the header itself. While a transaction is open the
//! header holds [`IN_PROGRESS_SENTINEL`], so a record interrupted by a reset is
//! never exposed to readers. Commit patches the header in place.
//!
//! # Non-volatile spillover
//!
//! When an [`NvEventStorage`] is attached and reports itself enabled,
//! [`EventStore::persist`] moves committed RAM records into it and every
//! [`DataSource`] call is served from the non-volatile store instead.
//!
//! # Batched reads
//!
//! With [`EventStore::set_read_batching`] the [`DataSource`] side hands out
//! several RAM records as one read: a CBOR array head for the record count
//! followed by the payloads back to back. A batch grows while its payload
//! bytes stay within the configured limit and always holds at least one
//! record; a batch of one is sent without the array head.

use std::fmt;

use tracing::{debug, warn};

use crate::cbor::{self, MAX_HEAD_SIZE};
use crate::error::Result;
use crate::ring::RingBuffer;

/// Size of the per-record length header in bytes.
pub const RECORD_HEADER_SIZE: usize = 2;

/// Header value marking a record whose transaction has not been committed.
pub const IN_PROGRESS_SENTINEL: u16 = 0xFFFF;

/// Largest total record size (header included) that can be committed.
pub const MAX_RECORD_SIZE: usize = IN_PROGRESS_SENTINEL as usize - 1;

/// Producer-side storage contract.
///
/// Every producer of a storable event (metrics, traces) programs against only
/// these four calls. A zero budget from `begin_write` means no transaction is
/// open. After a non-zero budget the caller must call `finish_write`, passing
/// `rollback = true` after any failed append.
pub trait EventStorage {
    /// Opens a write transaction.
    ///
    /// Returns the number of bytes that can still be appended, or 0 if a
    /// transaction is already open or no payload byte fits after the record
    /// header. A zero return leaves storage untouched.
    fn begin_write(&mut self) -> usize;

    /// Appends bytes to the open transaction. Returns `false` if they do not
    /// fit; bytes appended earlier stay in place until `finish_write`.
    fn append_data(&mut self, bytes: &[u8]) -> bool;

    /// Closes the open transaction, either committing it as one record or
    /// discarding every byte it wrote.
    fn finish_write(&mut self, rollback: bool);

    /// Total capacity of the underlying storage in bytes.
    fn storage_size(&self) -> usize;
}

/// Transport-side contract for draining stored records.
pub trait DataSource {
    /// Returns the payload size of the oldest record, or `None` when empty.
    fn has_more(&mut self) -> Option<usize>;

    /// Copies `buf.len()` payload bytes starting at `offset` of the record
    /// last reported by [`has_more`](Self::has_more).
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool;

    /// Discards the record last reported by [`has_more`](Self::has_more).
    fn mark_read(&mut self);
}

/// Platform-provided non-volatile event store (flash, file system, ...).
pub trait NvEventStorage {
    /// Whether the store is currently usable.
    fn enabled(&self) -> bool;

    /// Returns the size of the oldest stored event, or `None` when empty.
    fn has_event(&mut self) -> Option<usize>;

    /// Reads part of the oldest stored event.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool;

    /// Discards the oldest stored event.
    fn consume(&mut self);

    /// Stores an event of `size` bytes, pulling its content through `read`
    /// as `(offset, buf)` chunks. Returns `false` if the event was not stored.
    fn write(&mut self, size: usize, read: &mut dyn FnMut(usize, &mut [u8]) -> bool) -> bool;
}

/// Storage levels reported to the persist observer after every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistStats {
    /// Bytes held by committed and in-flight records.
    pub bytes_used: usize,
    /// Bytes still free.
    pub bytes_free: usize,
}

/// Callback invoked after every successful commit.
pub type PersistObserver = Box<dyn FnMut(PersistStats) + Send>;

#[derive(Debug, Default, Clone, Copy)]
struct WriteState {
    in_progress: bool,
    bytes_written: usize,
}

/// The records handed out by the active read. All zero when idle.
#[derive(Debug, Default, Clone, Copy)]
struct ReadState {
    records: usize,
    /// Ring bytes covered, record headers included.
    span: usize,
    /// Payload bytes of the covered records.
    payload: usize,
    /// Array head sent ahead of a batch of two or more records.
    prefix: [u8; MAX_HEAD_SIZE],
    prefix_len: usize,
}

impl ReadState {
    fn is_active(&self) -> bool {
        self.records != 0
    }

    /// Bytes a reader sees.
    fn read_size(&self) -> usize {
        self.prefix_len + self.payload
    }

    fn push(&mut self, total: usize) {
        self.records += 1;
        self.span += total;
        self.payload += total - RECORD_HEADER_SIZE;
    }
}

/// Transactional, FIFO record store over a [`RingBuffer`].
///
/// # Examples
///
/// ```rust
/// use vitals::storage::{DataSource, EventStorage, EventStore};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut store = EventStore::new(vec![0u8; 64])?;
///
/// assert!(store.begin_write() > 0);
/// assert!(store.append_data(b"hello"));
/// store.finish_write(false);
///
/// assert_eq!(store.has_more(), Some(5));
/// let mut buf = [0u8; 5];
/// assert!(store.read(0, &mut buf));
/// assert_eq!(&buf, b"hello");
/// store.mark_read();
/// assert_eq!(store.has_more(), None);
/// # Ok(())
/// # }
/// ```
pub struct EventStore<S = Box<[u8]>> {
    ring: RingBuffer<S>,
    write_state: WriteState,
    read_state: ReadState,
    batch_limit: Option<usize>,
    nv: Option<Box<dyn NvEventStorage + Send>>,
    nv_was_enabled: bool,
    persist_observer: Option<PersistObserver>,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> EventStore<S> {
    /// Boots an event store over `storage`, discarding its previous content.
    ///
    /// # Errors
    ///
    /// Returns an error if `storage` is empty.
    pub fn new(storage: S) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::new(storage)?,
            write_state: WriteState::default(),
            read_state: ReadState::default(),
            batch_limit: None,
            nv: None,
            nv_was_enabled: false,
            persist_observer: None,
        })
    }

    /// Attaches a non-volatile backing store.
    pub fn set_nv_storage(&mut self, nv: Box<dyn NvEventStorage + Send>) {
        self.nv = Some(nv);
        self.nv_was_enabled = false;
    }

    /// Enables batched [`DataSource`] reads of up to `max_payload_bytes`
    /// per batch, or disables batching with `None`.
    ///
    /// Takes effect at the next read that starts; a read already handed out
    /// keeps its shape until it is marked read.
    pub fn set_read_batching(&mut self, max_payload_bytes: Option<usize>) {
        self.batch_limit = max_payload_bytes;
    }

    /// Registers the callback told about storage levels after every commit.
    pub fn set_persist_observer(&mut self, observer: PersistObserver) {
        self.persist_observer = Some(observer);
    }

    /// Bytes currently occupied in RAM storage.
    pub fn bytes_used(&self) -> usize {
        self.ring.read_size()
    }

    /// Bytes currently free in RAM storage.
    pub fn bytes_free(&self) -> usize {
        self.ring.write_size()
    }

    /// Whether a write transaction is open.
    pub fn write_in_progress(&self) -> bool {
        self.write_state.in_progress
    }

    /// Peeks the oldest committed RAM record and returns its payload size.
    ///
    /// Returns `None` if storage is empty or the oldest record is still being
    /// written (or was interrupted mid-write). An active batched read is
    /// narrowed to its first record.
    pub fn has_record(&mut self) -> Option<usize> {
        if self.read_state.records != 1 {
            let total = self.record_at(0)?;
            self.read_state = ReadState::default();
            self.read_state.push(total);
        }
        Some(self.read_state.payload)
    }

    /// Reads bytes of the active read: the record peeked by
    /// [`has_record`](Self::has_record), or the batch handed out by
    /// [`DataSource::has_more`].
    ///
    /// Fails if nothing is active or the range extends past the end.
    pub fn read_record(&self, offset: usize, buf: &mut [u8]) -> bool {
        let state = &self.read_state;
        if !state.is_active()
            || offset
                .checked_add(buf.len())
                .is_none_or(|end| end > state.read_size())
        {
            return false;
        }

        let mut out = buf;
        let mut offset = offset;
        if offset < state.prefix_len {
            let n = (state.prefix_len - offset).min(out.len());
            let (head, rest) = std::mem::take(&mut out).split_at_mut(n);
            head.copy_from_slice(&state.prefix[offset..offset + n]);
            out = rest;
            offset = 0;
        } else {
            offset -= state.prefix_len;
        }

        // Walk the covered records, skipping their headers.
        let mut record_start = 0;
        while !out.is_empty() {
            let Some(total) = self.record_at(record_start) else {
                return false;
            };
            let payload = total - RECORD_HEADER_SIZE;
            if offset >= payload {
                offset -= payload;
                record_start += total;
                continue;
            }

            let n = (payload - offset).min(out.len());
            let (head, rest) = std::mem::take(&mut out).split_at_mut(n);
            if self
                .ring
                .read(record_start + RECORD_HEADER_SIZE + offset, head)
                .is_err()
            {
                return false;
            }
            out = rest;
            offset = 0;
            record_start += total;
        }
        true
    }

    /// Returns the payload of the peeked record as at most two contiguous
    /// slices, without copying. The second slice is empty unless the record
    /// wraps around the end of storage. `None` unless exactly one record is
    /// active.
    pub fn record_slices(&self) -> Option<(&[u8], &[u8])> {
        if self.read_state.records != 1 {
            return None;
        }
        let payload = self.read_state.payload;
        let first = self.ring.get_read_pointer(RECORD_HEADER_SIZE)?;
        if first.len() >= payload {
            return Some((&first[..payload], &[]));
        }

        let second = self
            .ring
            .get_read_pointer(RECORD_HEADER_SIZE + first.len())?;
        Some((first, &second[..payload - first.len()]))
    }

    /// Discards every record covered by the active read.
    /// Does nothing if no read is active.
    pub fn mark_record_read(&mut self) {
        let span = self.read_state.span;
        if span == 0 {
            return;
        }
        if self.ring.consume(span).is_err() {
            warn!(span, "active read no longer in storage");
        }
        self.read_state = ReadState::default();
    }

    /// Moves every committed RAM record into the non-volatile store.
    ///
    /// Returns the number of records saved. Does nothing unless a
    /// non-volatile store is attached and enabled. Stops at the first record
    /// the store refuses; that record stays in RAM.
    pub fn persist(&mut self) -> usize {
        if !self.nv_enabled() {
            return 0;
        }

        let mut saved = 0;
        while let Some(payload) = self.has_record() {
            let Some(nv) = self.nv.as_mut() else {
                break;
            };
            let ring = &self.ring;
            let stored = nv.write(payload, &mut |offset, buf| {
                offset
                    .checked_add(buf.len())
                    .is_some_and(|end| end <= payload)
                    && ring.read(RECORD_HEADER_SIZE + offset, buf).is_ok()
            });
            if !stored {
                break;
            }
            self.mark_record_read();
            saved += 1;
        }

        debug!(saved, "persisted events to non-volatile storage");
        saved
    }

    /// Consumes the store and returns the underlying storage.
    pub fn into_storage(self) -> S {
        self.ring.into_storage()
    }

    /// Total size of the committed record starting `offset` bytes into the
    /// stored data, or `None` if there is none.
    fn record_at(&self, offset: usize) -> Option<usize> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.ring.read(offset, &mut header).ok()?;
        let total = u16::from_le_bytes(header);
        if total == IN_PROGRESS_SENTINEL {
            return None;
        }

        let total = usize::from(total);
        (total >= RECORD_HEADER_SIZE && offset + total <= self.ring.read_size()).then_some(total)
    }

    /// Starts a batched read of the oldest records. Returns the batch size.
    fn peek_batch(&mut self, limit: usize) -> Option<usize> {
        if !self.read_state.is_active() {
            let mut state = ReadState::default();
            while let Some(total) = self.record_at(state.span) {
                if state.is_active() && state.payload + (total - RECORD_HEADER_SIZE) > limit {
                    break;
                }
                state.push(total);
            }
            if !state.is_active() {
                return None;
            }
            if state.records > 1 {
                (state.prefix, state.prefix_len) = cbor::array_head(state.records);
            }
            self.read_state = state;
        }
        Some(self.read_state.read_size())
    }

    /// Polls the non-volatile store, resetting the read state if it dropped
    /// out since the last poll.
    fn nv_enabled(&mut self) -> bool {
        let enabled = self.nv.as_ref().is_some_and(|nv| nv.enabled());
        if self.nv_was_enabled && !enabled {
            warn!("non-volatile event storage disabled, resetting read state");
            self.read_state = ReadState::default();
        }
        self.nv_was_enabled = enabled;
        enabled
    }

    fn notify_persist(&mut self) {
        let stats = PersistStats {
            bytes_used: self.ring.read_size(),
            bytes_free: self.ring.write_size(),
        };
        if let Some(observer) = self.persist_observer.as_mut() {
            observer(stats);
        }
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> EventStorage for EventStore<S> {
    fn begin_write(&mut self) -> usize {
        if self.write_state.in_progress {
            return 0;
        }

        if self
            .ring
            .write(&IN_PROGRESS_SENTINEL.to_le_bytes())
            .is_err()
        {
            return 0;
        }

        let budget = self.ring.write_size();
        if budget == 0 {
            // Only the header fit; nothing stays open.
            if let Err(e) = self.ring.consume_from_end(RECORD_HEADER_SIZE) {
                warn!(error = %e, "failed to drop record header");
            }
            return 0;
        }

        self.write_state = WriteState {
            in_progress: true,
            bytes_written: RECORD_HEADER_SIZE,
        };
        budget
    }

    fn append_data(&mut self, bytes: &[u8]) -> bool {
        if !self.write_state.in_progress {
            return false;
        }
        if self.write_state.bytes_written + bytes.len() > MAX_RECORD_SIZE {
            return false;
        }
        if self.ring.write(bytes).is_err() {
            return false;
        }
        self.write_state.bytes_written += bytes.len();
        true
    }

    fn finish_write(&mut self, rollback: bool) {
        if !self.write_state.in_progress {
            return;
        }

        let written = self.write_state.bytes_written;
        let outcome = if rollback {
            self.ring.consume_from_end(written)
        } else {
            #[allow(clippy::cast_possible_truncation)] // append_data caps at MAX_RECORD_SIZE
            let header = (written as u16).to_le_bytes();
            self.ring.write_at_offset_from_end(written, &header)
        };
        if let Err(e) = outcome {
            warn!(error = %e, rollback, "failed to finish event write");
        }

        self.write_state = WriteState::default();
        if rollback {
            debug!(bytes = written, "rolled back event write");
        } else {
            self.notify_persist();
        }
    }

    fn storage_size(&self) -> usize {
        self.ring.capacity()
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> DataSource for EventStore<S> {
    fn has_more(&mut self) -> Option<usize> {
        if self.nv_enabled() {
            return self.nv.as_mut().and_then(|nv| nv.has_event());
        }
        match self.batch_limit {
            Some(limit) => self.peek_batch(limit),
            None if self.read_state.is_active() => Some(self.read_state.read_size()),
            None => self.has_record(),
        }
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool {
        if self.nv_enabled() {
            return self.nv.as_mut().is_some_and(|nv| nv.read(offset, buf));
        }
        self.read_record(offset, buf)
    }

    fn mark_read(&mut self) {
        if !self.nv_enabled() {
            self.mark_record_read();
            return;
        }

        if let Some(nv) = self.nv.as_mut() {
            nv.consume();
        }
        if self.has_record().is_some() {
            self.notify_persist();
        }
    }
}

impl<S> fmt::Debug for EventStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("write_state", &self.write_state)
            .field("read_state", &self.read_state)
            .field("nv_attached", &self.nv.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn create_test_store(capacity: usize) -> EventStore<Vec<u8>> {
        EventStore::new(vec![0; capacity]).unwrap()
    }

    fn commit(store: &mut EventStore<Vec<u8>>, payload: &[u8]) -> bool {
        if store.begin_write() == 0 {
            return false;
        }
        let ok = store.append_data(payload);
        store.finish_write(!ok);
        ok
    }

    fn drain(store: &mut EventStore<Vec<u8>>) -> Option<Vec<u8>> {
        let size = store.has_more()?;
        let mut buf = vec![0; size];
        assert!(store.read(0, &mut buf));
        store.mark_read();
        Some(buf)
    }

    /// In-memory NV store for tests.
    #[derive(Default)]
    struct FakeNv {
        enabled: Arc<Mutex<bool>>,
        events: Arc<Mutex<Vec<Vec<u8>>>>,
        capacity: usize,
    }

    impl NvEventStorage for FakeNv {
        fn enabled(&self) -> bool {
            *self.enabled.lock().unwrap()
        }

        fn has_event(&mut self) -> Option<usize> {
            self.events.lock().unwrap().first().map(Vec::len)
        }

        fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool {
            let events = self.events.lock().unwrap();
            match events.first() {
                Some(event) if offset + buf.len() <= event.len() => {
                    buf.copy_from_slice(&event[offset..offset + buf.len()]);
                    true
                }
                _ => false,
            }
        }

        fn consume(&mut self) {
            let mut events = self.events.lock().unwrap();
            if !events.is_empty() {
                events.remove(0);
            }
        }

        fn write(&mut self, size: usize, read: &mut dyn FnMut(usize, &mut [u8]) -> bool) -> bool {
            let mut events = self.events.lock().unwrap();
            if events.len() >= self.capacity {
                return false;
            }
            let mut event = vec![0; size];
            // Pull in two chunks to exercise offsets.
            let half = size / 2;
            if !read(0, &mut event[..half]) || !read(half, &mut event[half..]) {
                return false;
            }
            events.push(event);
            true
        }
    }

    #[test]
    fn test_begin_write_returns_free_space_after_header() {
        let mut store = create_test_store(16);
        assert_eq!(store.begin_write(), 14);
        assert!(store.write_in_progress());
        assert_eq!(store.begin_write(), 0); // already open
        store.finish_write(true);
        assert!(!store.write_in_progress());
    }

    #[test]
    fn test_begin_write_fails_when_header_does_not_fit() {
        let mut store = create_test_store(1);
        assert_eq!(store.begin_write(), 0);
        assert!(!store.write_in_progress());
    }

    #[test]
    fn test_begin_write_with_only_header_room_leaves_nothing_open() {
        let mut store = create_test_store(7);
        assert!(commit(&mut store, &[1, 2, 3]));
        assert_eq!(store.bytes_free(), 2);

        assert_eq!(store.begin_write(), 0);
        assert!(!store.write_in_progress());
        assert_eq!(store.bytes_used(), 5);
        assert_eq!(store.bytes_free(), 2);

        assert_eq!(drain(&mut store), Some(vec![1, 2, 3]));
        assert_eq!(store.bytes_used(), 0);
        assert_eq!(store.begin_write(), 5);
        assert!(store.append_data(&[4, 5, 6, 7, 8]));
        store.finish_write(false);
        assert_eq!(drain(&mut store), Some(vec![4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_commit_and_read_back() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[1, 2, 3]));
        assert_eq!(store.bytes_used(), 5);
        assert_eq!(drain(&mut store), Some(vec![1, 2, 3]));
        assert_eq!(store.bytes_used(), 0);
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[9]));
        let used = store.bytes_used();

        assert!(store.begin_write() > 0);
        assert!(store.append_data(&[7, 7, 7]));
        store.finish_write(true);

        assert_eq!(store.bytes_used(), used);
        assert_eq!(drain(&mut store), Some(vec![9]));
        assert_eq!(drain(&mut store), None);
    }

    #[test]
    fn test_in_progress_record_is_invisible() {
        let mut store = create_test_store(32);
        assert!(store.begin_write() > 0);
        assert!(store.append_data(&[1, 2]));
        assert_eq!(store.has_more(), None);
        store.finish_write(false);
        assert_eq!(store.has_more(), Some(2));
    }

    #[test]
    fn test_append_overflow_then_rollback() {
        let mut store = create_test_store(8);
        assert_eq!(store.begin_write(), 6);
        assert!(store.append_data(&[1, 2, 3, 4]));
        assert!(!store.append_data(&[5, 6, 7]));
        store.finish_write(true);
        assert_eq!(store.bytes_used(), 0);
        assert_eq!(store.has_more(), None);
    }

    #[test]
    fn test_append_without_transaction_fails() {
        let mut store = create_test_store(8);
        assert!(!store.append_data(&[1]));
        assert_eq!(store.bytes_used(), 0);
    }

    #[test]
    fn test_read_is_bounded_by_payload() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[1, 2, 3]));
        assert!(commit(&mut store, &[4, 5]));

        assert_eq!(store.has_more(), Some(3));
        let mut buf = [0u8; 2];
        assert!(store.read(1, &mut buf));
        assert_eq!(buf, [2, 3]);
        assert!(!store.read(2, &mut buf));
    }

    #[test]
    fn test_read_without_peek_fails() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[1]));
        let mut buf = [0u8; 1];
        assert!(!store.read_record(0, &mut buf));
    }

    #[test]
    fn test_mark_read_without_active_record_is_noop() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[1]));
        store.mark_read();
        assert_eq!(store.has_more(), Some(1));
    }

    #[test]
    fn test_record_slices_across_wrap() {
        let mut store = create_test_store(10);
        assert!(commit(&mut store, &[0; 4])); // 6 bytes
        drain(&mut store);
        assert!(commit(&mut store, &[1, 2, 3, 4, 5, 6])); // header at 6..8, payload wraps

        assert_eq!(store.has_more(), Some(6));
        let (first, second) = store.record_slices().unwrap();
        assert_eq!(first, &[1, 2]);
        assert_eq!(second, &[3, 4, 5, 6]);
    }

    #[test]
    fn test_record_slices_contiguous() {
        let mut store = create_test_store(16);
        assert!(commit(&mut store, &[1, 2, 3]));
        assert!(store.record_slices().is_none());
        assert_eq!(store.has_more(), Some(3));
        let (first, second) = store.record_slices().unwrap();
        assert_eq!(first, &[1, 2, 3]);
        assert!(second.is_empty());
    }

    #[test]
    fn test_persist_observer_called_on_commit_only() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let mut store = create_test_store(16);
        store.set_persist_observer(Box::new(move |stats| sink.lock().unwrap().push(stats)));

        assert!(commit(&mut store, &[1, 2]));
        store.begin_write();
        store.finish_write(true);

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![PersistStats {
                bytes_used: 4,
                bytes_free: 12
            }]
        );
    }

    #[test]
    fn test_max_record_size_enforced() {
        let mut store = create_test_store(MAX_RECORD_SIZE + 16);
        assert!(store.begin_write() > 0);
        assert!(!store.append_data(&vec![0; MAX_RECORD_SIZE - 1]));
        assert!(store.append_data(&vec![0; MAX_RECORD_SIZE - RECORD_HEADER_SIZE]));
        store.finish_write(false);
        assert_eq!(store.has_more(), Some(MAX_RECORD_SIZE - RECORD_HEADER_SIZE));
    }

    #[test]
    fn test_persist_moves_records_to_nv() {
        let enabled = Arc::new(Mutex::new(true));
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut store = create_test_store(64);
        store.set_nv_storage(Box::new(FakeNv {
            enabled: Arc::clone(&enabled),
            events: Arc::clone(&events),
            capacity: 2,
        }));

        assert!(commit(&mut store, &[1, 2, 3]));
        assert!(commit(&mut store, &[4, 5]));
        assert!(commit(&mut store, &[6]));

        assert_eq!(store.persist(), 2);
        assert_eq!(events.lock().unwrap().len(), 2);
        assert_eq!(store.bytes_used(), 3); // third record still in RAM

        assert_eq!(drain(&mut store), Some(vec![1, 2, 3]));
        assert_eq!(drain(&mut store), Some(vec![4, 5]));
        assert_eq!(drain(&mut store), None); // NV is the active source while enabled

        *enabled.lock().unwrap() = false;
        assert_eq!(drain(&mut store), Some(vec![6]));
    }

    #[test]
    fn test_persist_without_nv_is_noop() {
        let mut store = create_test_store(32);
        assert!(commit(&mut store, &[1]));
        assert_eq!(store.persist(), 0);
        assert_eq!(store.has_more(), Some(1));
    }

    #[test]
    fn test_nv_mark_read_requests_persist_when_ram_has_data() {
        let calls = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&calls);
        let events = Arc::new(Mutex::new(vec![vec![7u8]]));
        let mut store = create_test_store(32);
        store.set_nv_storage(Box::new(FakeNv {
            enabled: Arc::new(Mutex::new(true)),
            events: Arc::clone(&events),
            capacity: 4,
        }));
        store.set_persist_observer(Box::new(move |_| *sink.lock().unwrap() += 1));

        assert!(commit(&mut store, &[1]));
        assert_eq!(*calls.lock().unwrap(), 1);

        assert_eq!(drain(&mut store), Some(vec![7]));
        assert_eq!(*calls.lock().unwrap(), 2);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nv_disable_resets_read_state() {
        let enabled = Arc::new(Mutex::new(false));
        let mut store = create_test_store(32);
        store.set_nv_storage(Box::new(FakeNv {
            enabled: Arc::clone(&enabled),
            events: Arc::default(),
            capacity: 4,
        }));

        assert!(commit(&mut store, &[1, 2]));
        assert_eq!(store.has_more(), Some(2));

        *enabled.lock().unwrap() = true;
        assert_eq!(store.has_more(), None);
        *enabled.lock().unwrap() = false;

        // Peeked RAM state was dropped; reading requires a fresh peek.
        let mut buf = [0u8; 2];
        assert!(!store.read(0, &mut buf));
        assert_eq!(store.has_more(), Some(2));
        assert!(store.read(0, &mut buf));
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn test_batched_read_covers_all_records() {
        let mut store = create_test_store(32);
        store.set_read_batching(Some(64));
        assert!(commit(&mut store, &[1, 2]));
        assert!(commit(&mut store, &[3, 4]));

        assert_eq!(store.has_more(), Some(5));
        let mut past_end = [0u8; 5];
        assert!(!store.read(1, &mut past_end));

        let mut buf = [0u8; 5];
        for (i, byte) in buf.iter_mut().enumerate() {
            assert!(store.read(i, std::slice::from_mut(byte)));
        }
        assert_eq!(buf, [0x82, 1, 2, 3, 4]);

        store.mark_read();
        assert_eq!(store.has_more(), None);
        assert_eq!(store.bytes_used(), 0);
    }

    #[test]
    fn test_batched_read_respects_limit() {
        let mut store = create_test_store(32);
        store.set_read_batching(Some(4));
        assert!(commit(&mut store, &[1, 2]));
        assert!(commit(&mut store, &[3]));
        assert!(commit(&mut store, &[4, 5]));

        assert_eq!(store.has_more(), Some(4));
        let mut buf = [0u8; 4];
        assert!(store.read(0, &mut buf[..1]));
        assert!(store.read(1, &mut buf[1..3]));
        assert!(store.read(3, &mut buf[3..]));
        assert_eq!(buf, [0x82, 1, 2, 3]);
        store.mark_read();

        // A lone record goes out without the array head.
        assert_eq!(drain(&mut store), Some(vec![4, 5]));
        assert_eq!(store.has_more(), None);
    }

    #[test]
    fn test_batch_always_holds_one_record() {
        let mut store = create_test_store(32);
        store.set_read_batching(Some(1));
        assert!(commit(&mut store, &[1, 2, 3]));
        assert!(commit(&mut store, &[4]));

        assert_eq!(drain(&mut store), Some(vec![1, 2, 3]));
        assert_eq!(drain(&mut store), Some(vec![4]));
    }

    #[test]
    fn test_batch_stops_at_open_transaction() {
        let mut store = create_test_store(32);
        store.set_read_batching(Some(64));
        assert!(commit(&mut store, &[1]));
        assert!(store.begin_write() > 0);
        assert!(store.append_data(&[9, 9]));

        assert_eq!(store.has_more(), Some(1));
        store.finish_write(false);
        // The handed-out read keeps its shape until marked read.
        assert_eq!(store.has_more(), Some(1));
        assert_eq!(drain(&mut store), Some(vec![1]));
        assert_eq!(drain(&mut store), Some(vec![9, 9]));
    }

    #[test]
    fn test_has_record_narrows_active_batch() {
        let mut store = create_test_store(32);
        store.set_read_batching(Some(64));
        assert!(commit(&mut store, &[1]));
        assert!(commit(&mut store, &[2]));
        assert_eq!(store.has_more(), Some(3));

        assert_eq!(store.has_record(), Some(1));
        assert_eq!(store.record_slices(), Some((&[1u8][..], &[][..])));
        store.mark_record_read();
        assert_eq!(store.has_more(), Some(1));
    }
}
