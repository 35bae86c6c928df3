//! Task stacks and poison-byte stack diagnostics.
//!
//! Every stack is filled with [`STACK_POISON`] when it is handed to a task.
//! The deepest byte that no longer holds the poison marks the high-water
//! mark, and a consumed byte at the very base means the task ran off the end
//! of its stack.

use alloc::alloc::{alloc, dealloc, Layout};
use core::ptr::NonNull;

/// Fill byte written over a fresh stack.
pub const STACK_POISON: u8 = b'$';

/// Alignment of stack regions handed to the port.
pub const STACK_ALIGN: usize = 8;

/// Smallest stack the kernel accepts.
pub const MIN_STACK_SIZE: usize = 128;

/// Bytes used so far, counted from the top of the stack down to the deepest
/// byte that no longer holds the poison pattern.
pub fn stack_max_used(stack: &[u8]) -> usize {
    let untouched = stack.iter().take_while(|&&b| b == STACK_POISON).count();
    stack.len() - untouched
}

/// Whether a stack pointer and the base poison byte describe an overflow.
///
/// `begin..end` is the stack region. The saved pointer must lie inside it and
/// the lowest byte must still be poison.
pub fn stack_is_overflow(sp: usize, base_byte: u8, begin: usize, end: usize) -> bool {
    base_byte != STACK_POISON || sp < begin || sp >= end
}

/// A task stack region.
///
/// Kernel-allocated stacks are freed on drop. Caller-supplied stacks are
/// borrowed for `'static` and never freed.
pub struct Stack {
    /// Lowest address of the region
    memory: NonNull<u8>,
    /// Usable size in bytes
    size: usize,
    /// Layout to release on drop, `None` for caller-supplied memory
    layout: Option<Layout>,
}

impl Stack {
    /// Allocate and poison a stack of at least `size` bytes.
    ///
    /// Returns `None` if the size is below [`MIN_STACK_SIZE`] or the
    /// allocator is out of memory.
    pub fn allocate(size: usize) -> Option<Self> {
        if size < MIN_STACK_SIZE {
            return None;
        }

        let size = size.checked_add(STACK_ALIGN - 1)? & !(STACK_ALIGN - 1);
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        let memory = NonNull::new(unsafe { alloc(layout) })?;

        let stack = Self {
            memory,
            size,
            layout: Some(layout),
        };
        stack.poison();
        Some(stack)
    }

    /// Adopt a caller-supplied buffer, trimming it to [`STACK_ALIGN`].
    pub fn from_static(buffer: &'static mut [u8]) -> Option<Self> {
        let start = buffer.as_mut_ptr() as usize;
        let aligned = (start + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        let skip = aligned - start;
        let size = buffer.len().checked_sub(skip)? & !(STACK_ALIGN - 1);
        if size < MIN_STACK_SIZE {
            return None;
        }

        let memory = NonNull::new(aligned as *mut u8)?;
        let stack = Self {
            memory,
            size,
            layout: None,
        };
        stack.poison();
        Some(stack)
    }

    /// Lowest address of the stack.
    pub fn base(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// One past the highest address of the stack.
    pub fn end(&self) -> usize {
        self.memory.as_ptr() as usize + self.size
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the stack memory is owned by the kernel allocator.
    pub fn is_owned(&self) -> bool {
        self.layout.is_some()
    }

    /// High-water mark in bytes.
    pub fn max_used(&self) -> usize {
        stack_max_used(self.as_bytes())
    }

    /// Check the base poison byte and the saved stack pointer.
    pub fn is_overflow(&self, sp: usize) -> bool {
        stack_is_overflow(sp, self.base_byte(), self.memory.as_ptr() as usize, self.end())
    }

    /// Whether the poison byte at the lowest address is still untouched.
    pub fn base_intact(&self) -> bool {
        self.base_byte() == STACK_POISON
    }

    fn base_byte(&self) -> u8 {
        unsafe { self.memory.as_ptr().read_volatile() }
    }

    fn poison(&self) {
        unsafe {
            core::ptr::write_bytes(self.memory.as_ptr(), STACK_POISON, self.size);
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.memory.as_ptr(), self.size) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe {
                dealloc(self.memory.as_ptr(), layout);
            }
        }
    }
}

// The region is only touched by the task that runs on it and by kernel
// diagnostics under the kernel lock.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}
