//! Host simulation port.
//!
//! Every task runs on its own host thread, but only the thread holding the
//! CPU token is allowed to execute: a context switch hands the token to the
//! target thread and parks the caller until the token comes back. This gives
//! the kernel real blocking semantics on a development machine.
//!
//! There is no timer interrupt, so the idle task advances the tick
//! ([`Port::SIMULATED_TICK`]). Time therefore only moves while every task is
//! blocked, which makes timeout behaviour deterministic in tests.

use super::{Port, TaskEntry};
use crate::errors::{KernelError, KernelResult};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Bytes the simulated initial frame occupies at the top of a task stack.
pub const SIM_FRAME_SIZE: usize = 64;

/// Host stack size of a simulated task thread.
const SIM_THREAD_STACK: usize = 256 * 1024;

/// CPU token of one simulated task.
struct Baton {
    running: Mutex<bool>,
    wake: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            running: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        *running = true;
        self.wake.notify_one();
    }

    fn release(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        *running = false;
    }

    fn wait(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        while !*running {
            running = self.wake.wait(running).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Saved context of a simulated task.
pub struct SimContext {
    baton: Arc<Baton>,
    sp: usize,
}

/// Port backed by host threads.
pub struct SimPort;

impl Port for SimPort {
    type Context = SimContext;

    const SIMULATED_TICK: bool = true;

    fn stack_init(
        entry: TaskEntry,
        arg: usize,
        stack_base: *mut u8,
        stack_size: usize,
    ) -> KernelResult<Self::Context> {
        if stack_size <= SIM_FRAME_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        // Mark the frame a real port would push, so stack usage reports are
        // non-zero like on hardware.
        let sp = stack_base as usize + stack_size - SIM_FRAME_SIZE;
        unsafe {
            core::ptr::write_bytes(sp as *mut u8, 0, SIM_FRAME_SIZE);
        }

        let baton = Arc::new(Baton::new());
        let thread_baton = baton.clone();
        std::thread::Builder::new()
            .name(std::format!("sim-task-{:#x}", stack_base as usize))
            .stack_size(SIM_THREAD_STACK)
            .spawn(move || {
                thread_baton.wait();
                entry(arg);
            })
            .map_err(|_| KernelError::ResourceExhausted)?;

        Ok(SimContext { baton, sp })
    }

    unsafe fn context_switch(from: *mut Self::Context, to: *const Self::Context) {
        // The `from` slot may be reclaimed while this thread is parked, so
        // keep our own handle on its baton.
        let (own, next) = unsafe { ((*from).baton.clone(), (*to).baton.clone()) };
        own.release();
        next.give();
        own.wait();
    }

    unsafe fn context_switch_to(to: *const Self::Context) -> ! {
        let next = unsafe { (*to).baton.clone() };
        next.give();
        loop {
            std::thread::park();
        }
    }

    fn irq_lock() -> usize {
        0
    }

    fn irq_unlock(_state: usize) {}

    fn saved_sp(context: &Self::Context) -> usize {
        context.sp
    }

    fn wait_for_interrupt() {
        std::thread::sleep(Duration::from_micros(50));
    }

    fn halt() -> ! {
        panic!("kernel halted");
    }
}
