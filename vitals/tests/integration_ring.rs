//! Integration tests for the byte ring buffer.
//!
//! These tests drive long mixed sequences of writes and discards through
//! the public API and check the buffer against a simple model.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::collections::VecDeque;

use vitals::error::{RingError, VitalsError};
use vitals::ring::RingBuffer;

/// Deterministic xorshift so the sequences are reproducible.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            0
        } else {
            (self.next() % bound as u64) as usize
        }
    }
}

fn contents(ring: &RingBuffer<Vec<u8>>) -> Vec<u8> {
    let mut out = vec![0u8; ring.read_size()];
    ring.read(0, &mut out).unwrap();
    out
}

#[test]
fn test_matches_model_across_wraparound() {
    for capacity in [1usize, 7, 32, 100] {
        let mut ring = RingBuffer::new(vec![0u8; capacity]).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15 ^ capacity as u64);
        let mut next_byte = 0u8;

        for _ in 0..2_000 {
            match rng.below(3) {
                0 => {
                    let len = rng.below(capacity + 2);
                    let bytes: Vec<u8> = (0..len)
                        .map(|_| {
                            next_byte = next_byte.wrapping_add(1);
                            next_byte
                        })
                        .collect();
                    let fits = len <= capacity - model.len();
                    assert_eq!(ring.write(&bytes).is_ok(), fits);
                    if fits {
                        model.extend(&bytes);
                    }
                }
                1 => {
                    let len = rng.below(model.len() + 2);
                    let ok = len <= model.len();
                    assert_eq!(ring.consume(len).is_ok(), ok);
                    if ok {
                        model.drain(..len);
                    }
                }
                _ => {
                    let len = rng.below(model.len() + 2);
                    let ok = len <= model.len();
                    assert_eq!(ring.consume_from_end(len).is_ok(), ok);
                    if ok {
                        model.truncate(model.len() - len);
                    }
                }
            }

            assert_eq!(ring.read_size() + ring.write_size(), capacity);
            assert_eq!(contents(&ring), model.iter().copied().collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_read_pointer_runs_cover_contents() {
    let mut ring = RingBuffer::new(vec![0u8; 10]).unwrap();
    ring.write(&[0; 7]).unwrap();
    ring.consume(7).unwrap();
    ring.write(b"abcdefgh").unwrap();

    // Walk the contiguous runs the way a zero-copy drain would.
    let mut collected = Vec::new();
    let mut offset = 0;
    let mut runs = 0;
    while offset < ring.read_size() {
        let run = ring.get_read_pointer(offset).unwrap();
        assert!(!run.is_empty());
        collected.extend_from_slice(run);
        offset += run.len();
        runs += 1;
    }
    assert_eq!(collected, b"abcdefgh");
    assert_eq!(runs, 2);
    assert_eq!(ring.get_read_pointer(offset), Some(&[][..]));
    assert_eq!(ring.get_read_pointer(offset + 1), None);
}

#[test]
fn test_failed_operations_leave_buffer_unchanged() {
    let mut ring = RingBuffer::new(vec![0u8; 8]).unwrap();
    ring.write(b"12345").unwrap();
    let before = contents(&ring);

    assert!(matches!(
        ring.write(b"6789"),
        Err(VitalsError::Ring(RingError::InsufficientSpace { .. }))
    ));
    assert!(ring.consume(6).is_err());
    assert!(ring.consume_from_end(6).is_err());
    assert!(ring.write_at_offset_from_end(6, b"x").is_err());
    assert!(ring.read(3, &mut [0u8; 3]).is_err());

    assert_eq!(contents(&ring), before);
    assert_eq!(ring.write_size(), 3);
}

#[test]
fn test_header_patch_after_payload() {
    let mut ring = RingBuffer::new(vec![0u8; 12]).unwrap();
    ring.write(&[0; 9]).unwrap();
    ring.consume(9).unwrap();

    // Reserve a two-byte header, write a payload that wraps, then patch.
    ring.write(&[0xFF, 0xFF]).unwrap();
    ring.write(b"payload").unwrap();
    ring.write_at_offset_from_end(9, &[9, 0]).unwrap();

    let mut header = [0u8; 2];
    ring.read(0, &mut header).unwrap();
    assert_eq!(header, [9, 0]);
    let mut payload = [0u8; 7];
    ring.read(2, &mut payload).unwrap();
    assert_eq!(&payload, b"payload");
}

#[test]
fn test_empty_storage_rejected() {
    assert!(matches!(
        RingBuffer::new(Vec::<u8>::new()),
        Err(VitalsError::Ring(RingError::EmptyStorage))
    ));
}
