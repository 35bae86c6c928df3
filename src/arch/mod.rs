//! Architecture port layer.
//!
//! The scheduler depends on the CPU only through the [`Port`] trait: build an
//! initial context for a task, switch between two saved contexts, and mask
//! interrupts. Everything register-level lives behind it.

use crate::errors::KernelResult;
use crate::mem::stack::{stack_is_overflow, stack_max_used};

#[cfg(any(test, feature = "std-shim"))]
pub mod sim;

#[cfg(any(test, feature = "std-shim"))]
pub use sim::SimPort;

/// Entry point the port installs in a fresh context. Receives the `arg`
/// given to [`Port::stack_init`] and never returns.
pub type TaskEntry = fn(usize) -> !;

/// Architecture port.
///
/// # Safety
///
/// Implementations perform raw register and stack manipulation. The unsafe
/// methods carry their own preconditions, which the kernel upholds.
pub trait Port: 'static {
    /// Saved machine context of a task.
    ///
    /// The kernel keeps each context at a fixed address for the lifetime of
    /// its task and only hands out pointers to it across a switch.
    type Context: Send;

    /// Whether the idle task must advance the tick itself because no timer
    /// interrupt exists (host simulation).
    const SIMULATED_TICK: bool = false;

    /// Build the initial context of a task that starts in `entry(arg)` on the
    /// stack `stack_base..stack_base + stack_size`.
    ///
    /// The port may write its initial frame at the top of the region; the
    /// rest of the region must stay untouched so the poison-byte scan keeps
    /// working.
    fn stack_init(
        entry: TaskEntry,
        arg: usize,
        stack_base: *mut u8,
        stack_size: usize,
    ) -> KernelResult<Self::Context>;

    /// Save the running context into `from` and resume `to`. Returns when
    /// `from` is switched back to.
    ///
    /// # Safety
    ///
    /// - `from` must be the context slot of the task currently executing
    /// - `to` must point to a context produced by `stack_init` or saved by an
    ///   earlier switch
    /// - Both slots must stay valid until the switch completes
    /// - No kernel lock may be held across the call
    unsafe fn context_switch(from: *mut Self::Context, to: *const Self::Context);

    /// Start the first task. Never returns to the caller.
    ///
    /// # Safety
    ///
    /// `to` must point to a context produced by `stack_init` that stays valid
    /// for as long as its task exists.
    unsafe fn context_switch_to(to: *const Self::Context) -> !;

    /// Mask interrupts and return the previous mask state. Nestable.
    fn irq_lock() -> usize;

    /// Restore the mask state returned by the matching `irq_lock`.
    fn irq_unlock(state: usize);

    /// Stack pointer recorded in a saved context.
    fn saved_sp(context: &Self::Context) -> usize;

    /// Idle until the next interrupt.
    fn wait_for_interrupt();

    /// Mask interrupts and stop forever.
    fn halt() -> !;

    /// High-water mark of a stack region in bytes.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be a readable stack region.
    unsafe fn stack_max_used(base: *const u8, size: usize) -> usize {
        let region = unsafe { core::slice::from_raw_parts(base, size) };
        stack_max_used(region)
    }

    /// Whether `sp` or the base poison byte show an overflow of
    /// `base..end`.
    ///
    /// # Safety
    ///
    /// `base` must be readable.
    unsafe fn stack_is_overflow(sp: usize, base: *const u8, end: usize) -> bool {
        let base_byte = unsafe { base.read_volatile() };
        stack_is_overflow(sp, base_byte, base as usize, end)
    }
}

/// A port with no real context switching.
///
/// Lets kernel objects be created and queried on any host. Starting the
/// kernel or blocking on it is not supported.
pub struct NoOpPort;

impl Port for NoOpPort {
    type Context = usize;

    fn stack_init(
        _entry: TaskEntry,
        _arg: usize,
        stack_base: *mut u8,
        stack_size: usize,
    ) -> KernelResult<Self::Context> {
        Ok(stack_base as usize + stack_size - crate::mem::stack::STACK_ALIGN)
    }

    unsafe fn context_switch(_from: *mut Self::Context, _to: *const Self::Context) {}

    unsafe fn context_switch_to(_to: *const Self::Context) -> ! {
        Self::halt()
    }

    fn irq_lock() -> usize {
        0
    }

    fn irq_unlock(_state: usize) {}

    fn saved_sp(context: &Self::Context) -> usize {
        *context
    }

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    fn halt() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}
