//! Error handling for the kernel.
//!
//! Recoverable errors are reported through [`KernelError`] and returned to the
//! caller. Conditions the kernel cannot survive are described by
//! [`FatalError`] and routed to [`Kernel::fatal`](crate::Kernel::fatal).

#![allow(clippy::uninlined_format_args)]

use crate::task::TaskId;
use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Recoverable error returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Stale or unknown handle, out-of-range priority, malformed option set
    InvalidArgument,
    /// The deadline of a blocking call elapsed
    Timeout,
    /// Unlock by a task that does not own the mutex
    NotOwner,
    /// Operation not permitted in the current kernel or task state
    InvalidState,
    /// No memory or no free slot for a new kernel object
    ResourceExhausted,
    /// Stack poison consumed at the stack base
    StackOverflow,
    /// A no-wait acquisition failed, or the object is in use
    Busy,
    /// Counting object already at its maximum
    Full,
    /// Nothing available for a no-wait receive
    Empty,
    /// The object was destroyed or reset while the caller was waiting on it
    Destroyed,
}

impl KernelError {
    /// Integer code surfaced through driver and IPC call chains.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::NotOwner => -1,
            KernelError::Timeout => -2,
            KernelError::Full => -3,
            KernelError::Empty => -4,
            KernelError::ResourceExhausted => -5,
            KernelError::Busy => -7,
            KernelError::Destroyed => -9,
            KernelError::InvalidArgument => -10,
            KernelError::InvalidState => -11,
            KernelError::StackOverflow => -12,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::Timeout => write!(f, "Operation timed out"),
            KernelError::NotOwner => write!(f, "Caller does not own the object"),
            KernelError::InvalidState => write!(f, "Operation not allowed in current state"),
            KernelError::ResourceExhausted => write!(f, "Kernel resources exhausted"),
            KernelError::StackOverflow => write!(f, "Stack overflow detected"),
            KernelError::Busy => write!(f, "Object busy"),
            KernelError::Full => write!(f, "Object full"),
            KernelError::Empty => write!(f, "Object empty"),
            KernelError::Destroyed => write!(f, "Object destroyed or reset while waiting"),
        }
    }
}

/// Unrecoverable kernel condition.
///
/// There is no recovery path for these: the kernel reports them and halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// The poison byte at the base of a task stack was overwritten, or the
    /// saved stack pointer left the stack region
    StackOverflow {
        /// Task whose stack overflowed
        task: TaskId,
    },
    /// The ready bitmap marks a bucket that holds no task
    ReadyQueueCorrupted {
        /// Priority of the inconsistent bucket
        priority: u8,
    },
    /// Nothing is ready to run, not even the idle task
    NoReadyTask,
    /// `interrupt_leave` without a matching `interrupt_enter`
    InterruptUnderflow,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::StackOverflow { task } => write!(f, "Stack overflow in task {}", task),
            FatalError::ReadyQueueCorrupted { priority } => {
                write!(f, "Ready queue bitmap corrupted at priority {}", priority)
            }
            FatalError::NoReadyTask => write!(f, "No task ready to run"),
            FatalError::InterruptUnderflow => write!(f, "Interrupt nesting underflow"),
        }
    }
}

impl From<FatalError> for KernelError {
    fn from(error: FatalError) -> Self {
        match error {
            FatalError::StackOverflow { .. } => KernelError::StackOverflow,
            _ => KernelError::InvalidState,
        }
    }
}
