//! Synchronization primitives.
//!
//! Every blocking primitive keeps its state in the kernel arena and its
//! blocked tasks in a [`WaitQueue`](wait::WaitQueue). Blocking always goes
//! through the scheduler; no primitive spins or yields on its own.

pub mod event;
pub mod mailbox;
pub mod mq;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod wait;

pub use event::{event_match, EventId, EventOption};
pub use mailbox::MailboxId;
pub use mq::MqId;
pub use mutex::MutexId;
pub use semaphore::{SemaphoreId, SEM_UNBOUNDED};
pub use spinlock::{IrqSpinGuard, IrqSpinLock};
pub use wait::{WaitObject, WaitQueue, WakePolicy};
