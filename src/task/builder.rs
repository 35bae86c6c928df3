//! Task builder for configuring task creation.

use super::{StackSource, TaskId, TaskParams};
use crate::arch::Port;
use crate::errors::KernelResult;
use crate::kernel::Kernel;
use crate::time::Tick;
use alloc::boxed::Box;
use alloc::string::String;

/// Stack size used when none is given.
pub const DEFAULT_STACK_SIZE: usize = 2048;

/// Priority used when none is given.
pub const DEFAULT_PRIORITY: u8 = 16;

/// Builder for configuring and creating tasks.
///
/// `task_create` covers the common case; the builder adds a per-task time
/// slice, a static stack and a cleanup callback.
///
/// ```ignore
/// let id = TaskBuilder::new("sensor")
///     .priority(3)
///     .stack_size(4096)
///     .time_slice(5)
///     .spawn(kernel, move || sample_forever())?;
/// ```
pub struct TaskBuilder {
    name: String,
    priority: u8,
    stack: StackSource,
    /// Round-robin slice override, in ticks
    time_slice: Option<Tick>,
    /// Runs when the task is reclaimed or destroyed
    cleanup: Option<super::TaskFn>,
}

impl TaskBuilder {
    /// Create a builder with default settings.
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            stack: StackSource::Allocate(DEFAULT_STACK_SIZE),
            time_slice: None,
            cleanup: None,
        }
    }

    /// Set the task priority (0 is the highest).
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Allocate a stack of `size` bytes from the kernel heap.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack = StackSource::Allocate(size);
        self
    }

    /// Run on a caller-supplied stack instead of an allocated one.
    pub fn static_stack(mut self, stack: &'static mut [u8]) -> Self {
        self.stack = StackSource::Static(stack);
        self
    }

    /// Override the configured time slice for this task.
    pub fn time_slice(mut self, ticks: Tick) -> Self {
        self.time_slice = Some(ticks);
        self
    }

    /// Run `cleanup` after the task has closed, before its stack is freed.
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Create the task in `Init` state.
    ///
    /// # Arguments
    ///
    /// * `kernel` - Kernel that will own the task
    /// * `entry` - Body of the task; returning from it closes the task
    ///
    /// # Returns
    ///
    /// The new task's id, `InvalidArgument` for a bad priority, time slice
    /// or stack, `ResourceExhausted` when out of task slots or memory.
    pub fn create<A, F>(self, kernel: &'static Kernel<A>, entry: F) -> KernelResult<TaskId>
    where
        A: Port,
        F: FnOnce() + Send + 'static,
    {
        let params = TaskParams {
            name: self.name,
            priority: self.priority,
            stack: self.stack,
            time_slice: self.time_slice,
            cleanup: self.cleanup,
        };
        kernel.create_task(params, Box::new(entry))
    }

    /// Create the task and make it ready at once.
    pub fn spawn<A, F>(self, kernel: &'static Kernel<A>, entry: F) -> KernelResult<TaskId>
    where
        A: Port,
        F: FnOnce() + Send + 'static,
    {
        let id = self.create(kernel, entry)?;
        kernel.task_startup(id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NoOpPort;
    use crate::config::KernelConfig;
    use crate::errors::KernelError;
    use crate::task::TaskState;

    fn kernel() -> &'static Kernel<NoOpPort> {
        Box::leak(Box::new(Kernel::new(KernelConfig::new()).unwrap()))
    }

    #[test]
    fn test_builder_defaults() {
        let k = kernel();
        let id = TaskBuilder::new("default").create(k, || {}).unwrap();
        let info = k.task_info(id).unwrap();
        assert_eq!(info.priority, DEFAULT_PRIORITY);
        assert_eq!(info.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(info.state, TaskState::Init);
    }

    #[test]
    fn test_builder_spawn_is_ready() {
        let k = kernel();
        let id = TaskBuilder::new("ready")
            .priority(2)
            .time_slice(4)
            .spawn(k, || {})
            .unwrap();
        assert_eq!(k.task_state(id), Ok(TaskState::Ready));
        assert_eq!(k.lock().tasks.get(id).unwrap().time_slice, 4);
    }

    #[test]
    fn test_builder_rejects_zero_slice() {
        let k = kernel();
        let result = TaskBuilder::new("bad").time_slice(0).create(k, || {});
        assert_eq!(result, Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_static_stack() {
        let k = kernel();
        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 600]));
        let id = TaskBuilder::new("static")
            .static_stack(buffer)
            .create(k, || {})
            .unwrap();
        let info = k.task_info(id).unwrap();
        assert!(info.stack_size <= 600 && info.stack_size >= 592);

        let tiny: &'static mut [u8] = Box::leak(Box::new([0u8; 16]));
        let result = TaskBuilder::new("tiny").static_stack(tiny).create(k, || {});
        assert_eq!(result, Err(KernelError::InvalidArgument));
    }
}
