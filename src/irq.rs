//! Interrupt nesting and deferred context switches.
//!
//! A switch requested while any interrupt handler is active cannot happen
//! in place: it is recorded in the pending flag and carried out once, when
//! the outermost handler leaves.

use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Per-core interrupt state.
#[derive(Debug, Default)]
pub struct InterruptNest {
    depth: AtomicUsize,
    switch_pending: AtomicBool,
    deferred_switches: AtomicU32,
}

/// What the caller of [`InterruptNest::leave`] has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leave {
    /// Still inside an outer handler
    Nested,
    /// Outermost exit and no switch was requested
    Resume,
    /// Outermost exit with a pending switch, which is now consumed
    Reschedule,
    /// `leave` without a matching `enter`
    Underflow,
}

impl InterruptNest {
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            switch_pending: AtomicBool::new(false),
            deferred_switches: AtomicU32::new(0),
        }
    }

    /// Record handler entry and return the new depth.
    pub fn enter(&self) -> usize {
        self.depth.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record handler exit.
    pub fn leave(&self) -> Leave {
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        match previous {
            Err(_) => Leave::Underflow,
            Ok(1) => {
                if self.switch_pending.swap(false, Ordering::AcqRel) {
                    Leave::Reschedule
                } else {
                    Leave::Resume
                }
            }
            Ok(_) => Leave::Nested,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn in_interrupt(&self) -> bool {
        self.depth() > 0
    }

    /// Ask for a switch at the outermost exit.
    pub fn defer_switch(&self) {
        if !self.switch_pending.swap(true, Ordering::AcqRel) {
            self.deferred_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn switch_pending(&self) -> bool {
        self.switch_pending.load(Ordering::Acquire)
    }

    /// Number of switches that had to wait for interrupt exit.
    pub fn deferred_switches(&self) -> u32 {
        self.deferred_switches.load(Ordering::Relaxed)
    }
}
