//! Platform hooks injected into the telemetry context.
//!
//! The core never spawns threads and never blocks. What it needs from the
//! platform is a way to serialize access to shared state (a recursive lock,
//! which on single-core bare metal is interrupt disable/enable) and a
//! millisecond clock for timer metrics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Recursive mutual-exclusion hook wrapped around every operation on shared
/// telemetry state.
///
/// Implementations must tolerate nested `lock` calls from the same context:
/// a collection hook may call back into the metrics API while the caller of
/// the heartbeat still holds the lock.
pub trait CriticalSection {
    /// Enters the critical section.
    fn lock(&self);

    /// Leaves the critical section entered by the matching [`lock`](Self::lock).
    fn unlock(&self);
}

impl<T: CriticalSection + ?Sized> CriticalSection for &T {
    fn lock(&self) {
        (**self).lock();
    }

    fn unlock(&self) {
        (**self).unlock();
    }
}

impl<T: CriticalSection + ?Sized> CriticalSection for Arc<T> {
    fn lock(&self) {
        (**self).lock();
    }

    fn unlock(&self) {
        (**self).unlock();
    }
}

/// Lock for single-threaded hosts and tests. Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

impl CriticalSection for NoopLock {
    fn lock(&self) {}
    fn unlock(&self) {}
}

/// Holds a [`CriticalSection`] for the lifetime of the guard.
#[must_use = "the critical section is left as soon as the guard is dropped"]
pub struct CriticalSectionGuard<'a, L: CriticalSection + ?Sized> {
    lock: &'a L,
}

impl<'a, L: CriticalSection + ?Sized> CriticalSectionGuard<'a, L> {
    /// Enters `lock` and returns a guard that leaves it on drop.
    pub fn new(lock: &'a L) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl<L: CriticalSection + ?Sized> Drop for CriticalSectionGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Millisecond time source for timer metrics.
///
/// Only differences between readings matter. Timer arithmetic masks readings
/// to 31 bits, so the clock may wrap.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed point, usually boot.
    fn time_since_boot_ms(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn time_since_boot_ms(&self) -> u64 {
        (**self).time_since_boot_ms()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn time_since_boot_ms(&self) -> u64 {
        (**self).time_since_boot_ms()
    }
}

/// Wall-clock backed [`Clock`] measuring from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    boot: Instant,
}

impl MonotonicClock {
    /// Creates a clock reading zero now.
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[allow(clippy::cast_possible_truncation)] // u64 millis covers ~584 million years
    fn time_since_boot_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

/// Manually driven [`Clock`] for tests and simulation.
///
/// Clones share the same time, so a test can keep one handle and give another
/// to the telemetry context.
///
/// # Examples
///
/// ```rust
/// use vitals::platform::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// let handle = clock.clone();
/// clock.advance(1_500);
/// assert_eq!(handle.time_since_boot_ms(), 1_500);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn time_since_boot_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}
