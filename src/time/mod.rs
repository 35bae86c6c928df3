//! Kernel time: ticks, timeouts and wrap-safe deadline arithmetic.
//!
//! The tick counter is a free-running `u32` that wraps. Deadlines are compared
//! through the signed difference of two ticks, which stays correct as long as
//! no timeout spans more than half the counter range; [`Timeout::ticks`]
//! rejects longer ones.

pub mod tick;
pub mod tick_queue;
pub mod timer;

pub use tick::TickCounter;
pub use tick_queue::TickQueue;
pub use timer::TimerId;

use crate::errors::{KernelError, KernelResult};

/// The kernel's unit of time.
pub type Tick = u32;

/// Largest representable tick value.
pub const TICK_MAX: Tick = u32::MAX;

/// Default tick rate in Hz.
pub const DEFAULT_TICK_PER_SECOND: u32 = 100;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately instead of blocking
    NoWait,
    /// Give up after this many ticks (never zero)
    Ticks(Tick),
    /// Wait until woken
    Forever,
}

impl Timeout {
    /// Build a tick timeout; zero means [`Timeout::NoWait`].
    ///
    /// Timeouts of half the tick range or more cannot be ordered against the
    /// wrapping counter and are rejected.
    pub fn ticks(ticks: Tick) -> KernelResult<Self> {
        match ticks {
            0 => Ok(Timeout::NoWait),
            t if t >= TICK_MAX / 2 => Err(KernelError::InvalidArgument),
            t => Ok(Timeout::Ticks(t)),
        }
    }

    pub fn is_no_wait(self) -> bool {
        self == Timeout::NoWait
    }

    pub(crate) fn validate(self) -> KernelResult<Self> {
        match self {
            Timeout::Ticks(t) => Timeout::ticks(t),
            other => Ok(other),
        }
    }
}

/// Whether tick `a` lies strictly after tick `b` on the wrapping counter.
#[inline]
pub fn tick_after(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Whether `deadline` has been reached at `now`.
#[inline]
pub fn tick_reached(deadline: Tick, now: Tick) -> bool {
    !tick_after(deadline, now)
}

/// Convert milliseconds to ticks, rounding any partial tick up.
pub fn tick_from_ms(ms: u32, tick_per_second: u32) -> Tick {
    let whole = tick_per_second.wrapping_mul(ms / 1000);
    let part = (tick_per_second as u64 * (ms % 1000) as u64 + 999) / 1000;
    whole.wrapping_add(part as Tick)
}

/// Convert ticks to milliseconds, truncating.
pub fn ms_from_tick(ticks: Tick, tick_per_second: u32) -> u64 {
    if tick_per_second == 0 {
        return 0;
    }
    ticks as u64 * 1000 / tick_per_second as u64
}
