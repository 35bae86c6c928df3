//! Scheduler building blocks.
//!
//! Provides the bit-scan helpers, the intrusive task lists and the
//! priority-bitmap ready queue. The scheduling policy itself lives in
//! [`kernel`](crate::kernel), which owns the queue.

pub mod bitops;
pub mod list;
pub mod ready;

pub use bitops::{ffs, fls};
pub use list::{Link, LinkKind, LinkTable, TaskList};
pub use ready::{PriorityBitmap, ReadyQueue, MAX_PRIORITY_LEVELS};
