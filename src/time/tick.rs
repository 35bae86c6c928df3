//! Tick counting.

use super::{ms_from_tick, tick_from_ms, Tick};
use portable_atomic::{AtomicU32, Ordering};

/// Monotonic (wrapping) tick counter.
///
/// Written only by the tick handler while it holds the kernel lock, so the
/// counter always agrees with the timeout queue. Readers never need the lock.
pub struct TickCounter {
    /// Ticks since the kernel started
    ticks: AtomicU32,
    /// Tick frequency in Hz
    tick_per_second: u32,
}

impl TickCounter {
    /// Create a counter at zero running at `tick_per_second` Hz.
    pub const fn new(tick_per_second: u32) -> Self {
        Self {
            ticks: AtomicU32::new(0),
            tick_per_second,
        }
    }

    /// Advance by one tick and return the new value.
    pub fn increment(&self) -> Tick {
        self.ticks.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Current tick value.
    pub fn ticks(&self) -> Tick {
        self.ticks.load(Ordering::Acquire)
    }

    /// Overwrite the tick value.
    pub fn set(&self, ticks: Tick) {
        self.ticks.store(ticks, Ordering::Release);
    }

    /// Tick frequency in Hz.
    pub fn frequency(&self) -> u32 {
        self.tick_per_second
    }

    pub fn ms_to_ticks(&self, ms: u32) -> Tick {
        tick_from_ms(ms, self.tick_per_second)
    }

    pub fn ticks_to_ms(&self, ticks: Tick) -> u64 {
        ms_from_tick(ticks, self.tick_per_second)
    }
}
