//! Integration tests for transactional event storage.
//!
//! Covers commit/rollback atomicity, FIFO draining, the persist
//! notification, and spillover into a non-volatile backing store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use vitals::storage::{
    DataSource, EventStorage, EventStore, NvEventStorage, PersistStats, RECORD_HEADER_SIZE,
};

fn commit(store: &mut EventStore<Vec<u8>>, payload: &[u8]) -> bool {
    if store.begin_write() == 0 {
        return false;
    }
    let ok = store.append_data(payload);
    store.finish_write(!ok);
    ok
}

fn drain<D: DataSource>(source: &mut D) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    while let Some(size) = source.has_more() {
        let mut buf = vec![0u8; size];
        assert!(source.read(0, &mut buf));
        source.mark_read();
        records.push(buf);
    }
    records
}

/// In-memory stand-in for a flash-backed store.
#[derive(Clone, Default)]
struct MemoryNv {
    events: Arc<Mutex<VecDeque<Vec<u8>>>>,
    enabled: Arc<Mutex<bool>>,
    limit: usize,
}

impl MemoryNv {
    fn with_limit(limit: usize) -> Self {
        let nv = Self {
            limit,
            ..Self::default()
        };
        *nv.enabled.lock().unwrap() = true;
        nv
    }

    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl NvEventStorage for MemoryNv {
    fn enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    fn has_event(&mut self) -> Option<usize> {
        self.events.lock().unwrap().front().map(Vec::len)
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> bool {
        let events = self.events.lock().unwrap();
        match events.front() {
            Some(event) if offset + buf.len() <= event.len() => {
                buf.copy_from_slice(&event[offset..offset + buf.len()]);
                true
            }
            _ => false,
        }
    }

    fn consume(&mut self) {
        self.events.lock().unwrap().pop_front();
    }

    fn write(&mut self, size: usize, read: &mut dyn FnMut(usize, &mut [u8]) -> bool) -> bool {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.limit {
            return false;
        }
        let mut event = vec![0u8; size];
        // Pull in small chunks like a flash page writer would.
        for (i, chunk) in event.chunks_mut(3).enumerate() {
            if !read(i * 3, chunk) {
                return false;
            }
        }
        events.push_back(event);
        true
    }
}

#[test]
fn test_rollback_is_invisible() {
    let mut store = EventStore::new(vec![0u8; 64]).unwrap();
    assert!(commit(&mut store, b"first"));
    let used = store.bytes_used();

    let budget = store.begin_write();
    assert_eq!(budget, 64 - used - RECORD_HEADER_SIZE);
    assert!(store.append_data(b"doomed"));
    assert!(store.append_data(b" payload"));
    // Readers never see an open transaction.
    assert_eq!(store.has_more(), Some(5));
    store.finish_write(true);

    assert_eq!(store.bytes_used(), used);
    assert_eq!(drain(&mut store), vec![b"first".to_vec()]);
}

#[test]
fn test_fifo_order_with_wraparound() {
    let mut store = EventStore::new(vec![0u8; 40]).unwrap();
    let mut expected = VecDeque::new();
    let mut drained = Vec::new();

    for i in 0u8..60 {
        let payload: Vec<u8> = (0..(i % 9) + 1).map(|j| i.wrapping_mul(7) ^ j).collect();
        while !commit(&mut store, &payload) {
            let size = store.has_more().unwrap();
            let mut buf = vec![0u8; size];
            assert!(store.read(0, &mut buf));
            store.mark_read();
            drained.push(buf);
        }
        expected.push_back(payload);
    }
    drained.extend(drain(&mut store));

    assert_eq!(drained, expected.into_iter().collect::<Vec<_>>());
    assert_eq!(store.bytes_used(), 0);
}

#[test]
fn test_header_only_room_does_not_block_later_writes() {
    let mut store = EventStore::new(vec![0u8; 12]).unwrap();
    assert!(commit(&mut store, b"abcd"));
    drain(&mut store);
    // The first record wraps: 6 bytes at the tail, 1 at the head.
    assert!(commit(&mut store, b"01234"));
    assert!(commit(&mut store, b"y"));
    assert_eq!(store.bytes_free(), RECORD_HEADER_SIZE);

    assert!(!commit(&mut store, b"z"));
    assert!(!store.write_in_progress());
    assert_eq!(store.bytes_free(), RECORD_HEADER_SIZE);

    assert_eq!(drain(&mut store), vec![b"01234".to_vec(), b"y".to_vec()]);
    assert!(commit(&mut store, b"after"));
    assert_eq!(drain(&mut store), vec![b"after".to_vec()]);
}

#[test]
fn test_batched_drain_with_wraparound() {
    let mut store = EventStore::new(vec![0u8; 48]).unwrap();
    store.set_read_batching(Some(12));
    let mut expected = Vec::new();
    let mut batches = Vec::new();

    for i in 0u8..40 {
        let payload: Vec<u8> = (0..(i % 5) + 1).map(|j| i ^ (j << 4)).collect();
        while !commit(&mut store, &payload) {
            batches.extend(drain(&mut store));
        }
        expected.push(payload);
    }
    batches.extend(drain(&mut store));

    // Payload bytes stay below 0x80, so a leading byte at or above it is the
    // array head of a batch. Payload i is (i % 5) + 1 bytes long.
    let mut lengths = (0u8..40).map(|i| usize::from(i % 5) + 1);
    let mut records = Vec::new();
    for batch in &batches {
        assert!(batch.len() <= 12 + 1);
        let (count, mut rest) = match batch[0] {
            head @ 0x82..=0x97 => (usize::from(head - 0x80), &batch[1..]),
            _ => (1, &batch[..]),
        };
        for _ in 0..count {
            let (record, tail) = rest.split_at(lengths.next().unwrap());
            records.push(record.to_vec());
            rest = tail;
        }
        assert!(rest.is_empty());
    }

    assert_eq!(records, expected);
    assert_eq!(store.bytes_used(), 0);
}

#[test]
fn test_overflowing_append_rolls_back_cleanly() {
    let mut store = EventStore::new(vec![0u8; 16]).unwrap();
    assert!(commit(&mut store, b"abc"));

    let budget = store.begin_write();
    assert_eq!(budget, 9);
    assert!(store.append_data(b"1234"));
    assert!(!store.append_data(b"123456"));
    store.finish_write(true);

    assert_eq!(store.bytes_free(), 11);
    assert_eq!(drain(&mut store), vec![b"abc".to_vec()]);
}

#[test]
fn test_second_begin_write_refused() {
    let mut store = EventStore::new(vec![0u8; 32]).unwrap();
    assert!(store.begin_write() > 0);
    assert_eq!(store.begin_write(), 0);
    assert!(store.write_in_progress());
    store.finish_write(false);
    assert!(!store.write_in_progress());
    // An empty committed record is still a record.
    assert_eq!(store.has_more(), Some(0));
}

#[test]
fn test_zero_copy_record_slices() {
    let mut store = EventStore::new(vec![0u8; 20]).unwrap();
    assert!(commit(&mut store, &[0; 10]));
    drain(&mut store);
    assert!(commit(&mut store, b"0123456789ab"));

    assert_eq!(store.has_record(), Some(12));
    let (first, second) = store.record_slices().unwrap();
    assert!(!second.is_empty());
    assert_eq!([first, second].concat(), b"0123456789ab");
}

#[test]
fn test_persist_observer_sees_commits_only() {
    let seen: Arc<Mutex<Vec<PersistStats>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let mut store = EventStore::new(vec![0u8; 32]).unwrap();
    store.set_persist_observer(Box::new(move |stats| sink.lock().unwrap().push(stats)));

    assert!(commit(&mut store, b"abcd"));
    store.begin_write();
    store.finish_write(true);
    assert!(commit(&mut store, b"ef"));

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            PersistStats {
                bytes_used: 6,
                bytes_free: 26
            },
            PersistStats {
                bytes_used: 10,
                bytes_free: 22
            },
        ]
    );
}

#[test]
fn test_nv_spillover_serves_reads() {
    let nv = MemoryNv::with_limit(2);
    let mut store = EventStore::new(vec![0u8; 64]).unwrap();
    store.set_nv_storage(Box::new(nv.clone()));

    for payload in [&b"one"[..], b"two", b"three"] {
        assert!(commit(&mut store, payload));
    }

    // The backing store only takes two; the third stays in RAM.
    assert_eq!(store.persist(), 2);
    assert_eq!(nv.len(), 2);
    assert_eq!(store.bytes_used(), RECORD_HEADER_SIZE + 5);

    assert_eq!(store.has_more(), Some(3));
    let mut buf = [0u8; 3];
    assert!(store.read(0, &mut buf));
    assert_eq!(&buf, b"one");
    store.mark_read();

    assert_eq!(store.persist(), 1);
    assert_eq!(drain(&mut store), vec![b"two".to_vec(), b"three".to_vec()]);
    assert_eq!(store.bytes_used(), 0);
}

#[test]
fn test_nv_disabled_falls_back_to_ram() {
    let nv = MemoryNv::with_limit(8);
    let mut store = EventStore::new(vec![0u8; 64]).unwrap();
    store.set_nv_storage(Box::new(nv.clone()));
    assert!(commit(&mut store, b"saved"));
    assert_eq!(store.persist(), 1);
    assert!(commit(&mut store, b"ram"));

    assert_eq!(store.has_more(), Some(5));
    *nv.enabled.lock().unwrap() = false;

    assert_eq!(store.persist(), 0);
    assert_eq!(drain(&mut store), vec![b"ram".to_vec()]);
    assert_eq!(nv.len(), 1);
}
