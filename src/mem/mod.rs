//! Memory management for tasks and kernel objects.
//!
//! Provides the generational arena that backs every kernel object table
//! and poison-filled task stacks with high-water-mark scanning.

pub mod slab;
pub mod stack;

pub use slab::{Handle, Key, Slab};
pub use stack::{Stack, MIN_STACK_SIZE, STACK_POISON};
