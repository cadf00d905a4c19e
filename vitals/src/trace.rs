//! Trace events and the interrupt-context staging mailbox.
//!
//! Code running in interrupt or fault context cannot take the telemetry lock
//! or run the encoder. It stages a [`TraceEvent`] in a [`TraceMailbox`]
//! instead, and the telemetry context commits it to storage before its next
//! ordinary write.
//!
//! The mailbox is a single slot guarded by an atomic state word:
//!
//! ```text
//!          stage()                 stage() commits
//!  EMPTY ----------> WRITING ---------------------> FULL
//!    ^                  ^                            |
//!    |                  +---------- stage() ---------+
//!    |                                               | take()
//!    +----------------- TAKING <---------------------+
//! ```
//!
//! A second `stage` while the slot is `FULL` replaces the pending event (last
//! writer wins). A `stage` that races with another `stage` or a `take` is
//! dropped and counted rather than waiting; the telemetry context reports
//! the count the next time it flushes the mailbox.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::error::TraceError;

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;
const TAKING: u8 = 3;

/// A trace event: a reason code plus optional captured registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceEvent {
    /// Application-defined reason code.
    pub reason: u32,
    /// Program counter at capture time.
    pub pc: Option<u32>,
    /// Link register (return address) at capture time.
    pub lr: Option<u32>,
}

impl TraceEvent {
    /// Creates an event with only a reason code.
    pub const fn new(reason: u32) -> Self {
        Self {
            reason,
            pc: None,
            lr: None,
        }
    }

    /// Attaches captured registers.
    #[must_use]
    pub const fn with_registers(mut self, pc: u32, lr: u32) -> Self {
        self.pc = Some(pc);
        self.lr = Some(lr);
        self
    }
}

/// Single-slot, lock-free staging cell for trace events.
///
/// [`stage`](Self::stage) never blocks or allocates, so it is safe to call
/// from interrupt context through a shared reference.
#[derive(Debug)]
pub struct TraceMailbox {
    state: AtomicU8,
    dropped: AtomicU32,
    slot: UnsafeCell<TraceEvent>,
}

// SAFETY: `slot` is only accessed by the party that moved `state` into
// WRITING (stage) or TAKING (take) with a successful compare-exchange, so at
// most one thread touches it at a time. The Acquire on claim and Release on
// hand-off order the slot access with the state transitions.
unsafe impl Sync for TraceMailbox {}

impl TraceMailbox {
    /// Creates an empty mailbox.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            dropped: AtomicU32::new(0),
            slot: UnsafeCell::new(TraceEvent::new(0)),
        }
    }

    /// Stages `event`, replacing any event still pending.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::MailboxBusy`] if another stage or a take is in
    /// progress. The event is dropped and counted.
    pub fn stage(&self, event: TraceEvent) -> Result<(), TraceError> {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current != EMPTY && current != FULL {
                // No logging here: a subscriber may lock or allocate.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(TraceError::MailboxBusy);
            }
            match self.state.compare_exchange_weak(
                current,
                WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // SAFETY: the compare-exchange above moved the state to WRITING, which
        // grants this call exclusive access to the slot until the store below.
        unsafe {
            *self.slot.get() = event;
        }
        self.state.store(FULL, Ordering::Release);
        Ok(())
    }

    /// Removes and returns the pending event, if any.
    ///
    /// Returns `None` if the slot is empty or a stage is in progress.
    pub fn take(&self) -> Option<TraceEvent> {
        self.state
            .compare_exchange(FULL, TAKING, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        // SAFETY: the compare-exchange above moved the state to TAKING, which
        // grants exclusive access to the slot until the store below.
        let event = unsafe { *self.slot.get() };
        self.state.store(EMPTY, Ordering::Release);
        Some(event)
    }

    /// Whether an event is waiting to be taken.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Number of events dropped because the mailbox was busy.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TraceMailbox {
    fn default() -> Self {
        Self::new()
    }
}
