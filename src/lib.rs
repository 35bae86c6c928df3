#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! Priority-preemptive real-time kernel core.
//!
//! This library provides the scheduling and synchronization core of a small
//! RTOS: a bitmap ready queue with up to 256 priority levels, tasks with a
//! full lifecycle, recursive mutexes with priority inheritance, counting
//! semaphores, 32-bit event flags, mailboxes, message queues, software
//! timers and workqueues with delayed and cancellable work.
//!
//! # Target Platform
//!
//! - **CPU**: any, through the [`Port`] trait
//! - **Environment**: bare-metal `no_std` with a global allocator
//! - **Host**: [`SimPort`] runs each task on a host thread for testing
//!
//! # Features
//!
//! - `std-shim`: Export the host simulation port outside of tests
//! - `lut-bitscan`: Use lookup tables instead of CPU bit-scan instructions
//!
//! # Quick Start
//!
//! ```ignore
//! use oneos_kernel::{Kernel, KernelConfig, Timeout};
//! use spin::Lazy;
//!
//! static KERNEL: Lazy<Kernel<BoardPort>> =
//!     Lazy::new(|| Kernel::new(KernelConfig::new()).expect("bad config"));
//!
//! fn kernel_main() -> ! {
//!     let k: &'static Kernel<BoardPort> = &KERNEL;
//!     let sem = k.sem_create(0, 1).expect("semaphore");
//!
//!     k.task_create("consumer", 4, 2048, move || loop {
//!         let _ = k.sem_wait(sem, Timeout::Forever);
//!     }).and_then(|id| k.task_startup(id)).expect("task");
//!
//!     k.start()
//! }
//! ```
//!
//! # Architecture
//!
//! - All kernel state sits in one [`Kernel`] value behind an
//!   interrupt-masking spinlock; nothing is global
//! - Tasks and kernel objects live in generational arenas and are named by
//!   copyable handles, so a stale handle fails instead of aliasing
//! - Ready buckets, wait lists and the timeout queue are intrusive lists
//!   threaded through the task table
//! - A context switch is decided under the lock and carried out after it is
//!   released; inside interrupts it is deferred to the outermost exit

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod irq;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;
pub mod workqueue;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim"), target_os = "none"))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim"), target_os = "none"))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!(target: "fatal", "panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{NoOpPort, Port, TaskEntry};

#[cfg(any(test, feature = "std-shim"))]
pub use arch::SimPort;

// Kernel
pub use config::KernelConfig;
pub use kernel::Kernel;

// Tasks
pub use task::{TaskBuilder, TaskId, TaskInfo, TaskState};

// Synchronization
pub use sync::{EventId, EventOption, MailboxId, MqId, MutexId, SemaphoreId, WakePolicy, SEM_UNBOUNDED};

// Time
pub use time::{Tick, TimerId, Timeout};

// Workqueues
pub use workqueue::{WorkId, WorkStage, WorkqueueId};

// Errors
pub use errors::{FatalError, KernelError, KernelResult};
