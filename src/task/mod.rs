//! Tasks: control blocks, lifecycle and the task API.
//!
//! A task moves through `Init -> Ready <-> Running -> Blocked/Suspended ->
//! ... -> Close`. Its control block lives in the kernel's task arena and is
//! linked into at most one of the ready queue or a wait list through its
//! scheduling link, plus the timeout queue through its tick link.

pub mod builder;

pub use builder::TaskBuilder;

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mem::slab::{kernel_handle, Slab};
use crate::mem::stack::{Stack, MIN_STACK_SIZE};
use crate::sched::list::{Link, LinkKind, LinkTable};
use crate::sync::event::EventOption;
use crate::sync::mq::Parcel;
use crate::sync::mutex::MutexId;
use crate::sync::wait::WaitObject;
use crate::time::tick_queue::DeadlineTable;
use crate::time::{tick_from_ms, Tick, Timeout};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use log::debug;

kernel_handle!(
    /// Handle of a task.
    TaskId
);

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet started
    Init,
    /// In the ready queue
    Ready,
    /// On the CPU
    Running,
    /// Waiting on a primitive or for time
    Blocked,
    /// Parked until resumed
    Suspended,
    /// Finished, waiting to be reclaimed
    Close,
}

/// What a task blocked in `event_recv` is waiting for.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EventWait {
    pub(crate) interested: u32,
    pub(crate) option: EventOption,
    pub(crate) received: u32,
}

pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Task control block.
pub(crate) struct Tcb<A: Port> {
    pub(crate) name: String,
    /// Priority set by the application
    pub(crate) base_priority: u8,
    /// Priority used for scheduling, raised by inheritance
    pub(crate) priority: u8,
    pub(crate) state: TaskState,
    pub(crate) time_slice: Tick,
    pub(crate) remaining_slice: Tick,
    pub(crate) stack: Stack,
    /// Boxed so its address stays fixed while the arena grows.
    pub(crate) context: Box<UnsafeCell<A::Context>>,
    pub(crate) sched_link: Link,
    pub(crate) tick_link: Link,
    pub(crate) deadline: Tick,
    pub(crate) in_tick_queue: bool,
    pub(crate) blocked_on: Option<WaitObject>,
    /// Outcome handed to the task by whoever wakes it
    pub(crate) wake_result: KernelResult<()>,
    pub(crate) event_wait: EventWait,
    /// Mailbox word handed over directly on wake
    pub(crate) message: usize,
    /// Queue message waiting to be queued or delivered
    pub(crate) parcel: Option<Parcel>,
    pub(crate) held_mutexes: Vec<MutexId>,
    pub(crate) entry: Option<TaskFn>,
    pub(crate) cleanup: Option<TaskFn>,
}

pub(crate) type TaskTable<A> = Slab<TaskId, Tcb<A>>;

impl<A: Port> LinkTable for TaskTable<A> {
    fn link(&self, id: TaskId, kind: LinkKind) -> Link {
        match (self.get(id), kind) {
            (Some(t), LinkKind::Sched) => t.sched_link,
            (Some(t), LinkKind::Tick) => t.tick_link,
            (None, _) => Link::default(),
        }
    }

    fn set_link(&mut self, id: TaskId, kind: LinkKind, link: Link) {
        if let Some(t) = self.get_mut(id) {
            match kind {
                LinkKind::Sched => t.sched_link = link,
                LinkKind::Tick => t.tick_link = link,
            }
        }
    }

    fn priority(&self, id: TaskId) -> u8 {
        self.get(id).map_or(u8::MAX, |t| t.priority)
    }
}

impl<A: Port> DeadlineTable for TaskTable<A> {
    fn deadline(&self, id: TaskId) -> Tick {
        self.get(id).map_or(0, |t| t.deadline)
    }

    fn set_deadline(&mut self, id: TaskId, deadline: Tick) {
        if let Some(t) = self.get_mut(id) {
            t.deadline = deadline;
        }
    }
}

/// Snapshot of a task for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub priority: u8,
    pub base_priority: u8,
    pub state: TaskState,
    pub stack_size: usize,
    pub stack_max_used: usize,
}

/// Where a new task's stack comes from.
pub(crate) enum StackSource {
    Allocate(usize),
    Static(&'static mut [u8]),
}

/// Everything needed to create a task.
pub(crate) struct TaskParams {
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) stack: StackSource,
    pub(crate) time_slice: Option<Tick>,
    pub(crate) cleanup: Option<TaskFn>,
}

fn bounded_name(name: &str, max: usize) -> String {
    let mut end = name.len().min(max);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

/// First code every task runs: its entry closure, then the exit path.
fn task_trampoline<A: Port>(arg: usize) -> ! {
    // SAFETY: `arg` is the address of the `&'static Kernel` that created the
    // task, see `Kernel::create_task`.
    let kernel = unsafe { &*(arg as *const Kernel<A>) };
    let entry = {
        let mut st = kernel.lock();
        match st.current {
            Some(id) => st.tasks.get_mut(id).and_then(|t| t.entry.take()),
            None => None,
        }
    };
    if let Some(entry) = entry {
        entry();
    }
    kernel.exit_current()
}

impl<A: Port> Kernel<A> {
    pub(crate) fn create_task(&'static self, params: TaskParams, entry: TaskFn) -> KernelResult<TaskId> {
        if params.priority as u16 >= self.config().priority_levels {
            return Err(KernelError::InvalidArgument);
        }
        if params.time_slice == Some(0) {
            return Err(KernelError::InvalidArgument);
        }
        {
            let st = self.lock();
            if st.tasks.len() >= self.config().max_tasks {
                return Err(KernelError::ResourceExhausted);
            }
        }

        let stack = match params.stack {
            StackSource::Allocate(size) if size < MIN_STACK_SIZE => return Err(KernelError::InvalidArgument),
            StackSource::Allocate(size) => Stack::allocate(size).ok_or(KernelError::ResourceExhausted)?,
            StackSource::Static(buffer) => Stack::from_static(buffer).ok_or(KernelError::InvalidArgument)?,
        };
        let arg = self as *const Self as usize;
        let context = A::stack_init(task_trampoline::<A>, arg, stack.base(), stack.size())?;

        let time_slice = params.time_slice.unwrap_or(self.config().time_slice);
        let tcb = Tcb {
            name: bounded_name(&params.name, self.config().name_max),
            base_priority: params.priority,
            priority: params.priority,
            state: TaskState::Init,
            time_slice,
            remaining_slice: time_slice,
            stack,
            context: Box::new(UnsafeCell::new(context)),
            sched_link: Link::default(),
            tick_link: Link::default(),
            deadline: 0,
            in_tick_queue: false,
            blocked_on: None,
            wake_result: Ok(()),
            event_wait: EventWait::default(),
            message: 0,
            parcel: None,
            held_mutexes: Vec::new(),
            entry: Some(entry),
            cleanup: params.cleanup,
        };

        let mut st = self.lock();
        let id = st.tasks.insert(tcb).map_err(|_| KernelError::ResourceExhausted)?;
        debug!(target: "task", "created {} ({}) priority {}", params.name, id, params.priority);
        Ok(id)
    }

    /// Create a task with a kernel-allocated stack. It stays in `Init`
    /// until [`task_startup`](Self::task_startup).
    pub fn task_create<F>(&'static self, name: &str, priority: u8, stack_size: usize, entry: F) -> KernelResult<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder::new(name)
            .priority(priority)
            .stack_size(stack_size)
            .create(self, entry)
    }

    /// Create a task on a caller-supplied stack.
    pub fn task_create_static<F>(
        &'static self,
        name: &str,
        priority: u8,
        stack: &'static mut [u8],
        entry: F,
    ) -> KernelResult<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder::new(name)
            .priority(priority)
            .static_stack(stack)
            .create(self, entry)
    }

    /// Make an `Init` task ready to run.
    pub fn task_startup(&self, id: TaskId) -> KernelResult<()> {
        let mut st = self.lock();
        let task = st.tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        if task.state != TaskState::Init {
            return Err(KernelError::InvalidState);
        }
        st.enqueue_ready(id);
        debug!(target: "task", "started {}", id);
        self.reschedule(st);
        Ok(())
    }

    /// Destroy a task.
    ///
    /// Another task is unlinked and freed at once. Destroying the calling
    /// task closes it; the idle task reclaims it later. A task holding a
    /// mutex cannot be destroyed, and an interrupt handler cannot destroy
    /// the task it interrupted.
    pub fn task_destroy(&self, id: TaskId) -> KernelResult<()> {
        let mut st = self.lock();
        let task = st.tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        if task.state == TaskState::Close || Some(id) == st.idle {
            return Err(KernelError::InvalidState);
        }
        if !task.held_mutexes.is_empty() {
            return Err(KernelError::Busy);
        }
        if Some(id) == st.current {
            if self.in_interrupt() {
                return Err(KernelError::InvalidState);
            }
            drop(st);
            self.exit_current()
        }

        st.detach(id);
        let removed = st.tasks.remove(id);
        drop(st);

        if let Some(mut task) = removed {
            if let Some(cleanup) = task.cleanup.take() {
                cleanup();
            }
            debug!(target: "task", "destroyed {}", task.name);
        }
        Ok(())
    }

    /// Close the calling task and switch away for good.
    pub(crate) fn exit_current(&self) -> ! {
        let mut st = self.lock();
        if let Some(id) = st.current {
            st.mutex_release_all(id);
            st.detach(id);
            if let Some(task) = st.tasks.get_mut(id) {
                task.state = TaskState::Close;
                debug!(target: "task", "closed {}", task.name);
            }
            st.closed.push(id);
            st.sched_lock = 0;
        }
        self.reschedule(st);
        A::halt()
    }

    /// Take a task off the CPU until [`task_resume`](Self::task_resume).
    /// Blocked tasks and the idle task cannot be suspended.
    pub fn task_suspend(&self, id: TaskId) -> KernelResult<()> {
        let mut st = self.lock();
        let state = st.tasks.get(id).ok_or(KernelError::InvalidArgument)?.state;
        if Some(id) == st.idle {
            return Err(KernelError::InvalidState);
        }
        match state {
            TaskState::Ready => {
                st.dequeue_ready(id);
                if let Some(task) = st.tasks.get_mut(id) {
                    task.state = TaskState::Suspended;
                }
                Ok(())
            }
            TaskState::Running => {
                self.blocking_context(&st)?;
                if let Some(task) = st.tasks.get_mut(id) {
                    task.state = TaskState::Suspended;
                }
                self.reschedule(st);
                Ok(())
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Make a suspended task ready again. Usable from interrupt handlers.
    pub fn task_resume(&self, id: TaskId) -> KernelResult<()> {
        let mut st = self.lock();
        let task = st.tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        if task.state != TaskState::Suspended {
            return Err(KernelError::InvalidState);
        }
        st.enqueue_ready(id);
        self.reschedule(st);
        Ok(())
    }

    pub fn task_yield(&self) {
        self.yield_now();
    }

    /// Block the calling task for `ticks` ticks. Zero yields.
    pub fn task_sleep(&self, ticks: Tick) -> KernelResult<()> {
        let timeout = Timeout::ticks(ticks)?;
        if timeout.is_no_wait() {
            self.yield_now();
            return Ok(());
        }

        let st = self.lock();
        self.blocking_context(&st)?;
        match self.block_and_wait(st, None, timeout) {
            Err(KernelError::Timeout) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block the calling task for at least `ms` milliseconds.
    pub fn task_msleep(&self, ms: u32) -> KernelResult<()> {
        self.task_sleep(tick_from_ms(ms, self.config().tick_per_second))
    }

    /// Change a task's base priority.
    ///
    /// While the task holds a mutex its effective priority only moves up;
    /// the new base takes full effect once the last mutex is released. The
    /// idle task stays at the idle priority.
    pub fn task_set_priority(&self, id: TaskId, priority: u8) -> KernelResult<()> {
        if priority as u16 >= self.config().priority_levels {
            return Err(KernelError::InvalidArgument);
        }
        let mut st = self.lock();
        if Some(id) == st.idle && priority != self.config().idle_priority() {
            return Err(KernelError::InvalidState);
        }
        let task = st.tasks.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if task.state == TaskState::Close {
            return Err(KernelError::InvalidState);
        }
        task.base_priority = priority;
        let apply = task.held_mutexes.is_empty() || priority < task.priority;
        let waiting_on = task.blocked_on;

        if apply {
            st.set_effective_priority(id, priority);
            if let Some(WaitObject::Mutex(mutex)) = waiting_on {
                st.mutex_restore_owner_priority(mutex);
            }
        }
        self.reschedule(st);
        Ok(())
    }

    /// Effective priority.
    pub fn task_priority(&self, id: TaskId) -> KernelResult<u8> {
        self.lock().tasks.get(id).map(|t| t.priority).ok_or(KernelError::InvalidArgument)
    }

    pub fn task_base_priority(&self, id: TaskId) -> KernelResult<u8> {
        self.lock()
            .tasks
            .get(id)
            .map(|t| t.base_priority)
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn task_state(&self, id: TaskId) -> KernelResult<TaskState> {
        self.lock().tasks.get(id).map(|t| t.state).ok_or(KernelError::InvalidArgument)
    }

    pub fn task_name(&self, id: TaskId) -> KernelResult<String> {
        self.lock()
            .tasks
            .get(id)
            .map(|t| t.name.clone())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Find a live task by name.
    pub fn task_find(&self, name: &str) -> Option<TaskId> {
        let st = self.lock();
        let name = bounded_name(name, self.config().name_max);
        let found = st
            .tasks
            .iter()
            .find(|(_, t)| t.name == name && t.state != TaskState::Close)
            .map(|(id, _)| id);
        found
    }

    /// The calling task, or `None` before the kernel starts.
    pub fn task_self(&self) -> Option<TaskId> {
        self.lock().current
    }

    /// Number of tasks, closed ones awaiting reclaim included.
    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Set the round-robin slice of a task, in ticks.
    pub fn task_set_time_slice(&self, id: TaskId, ticks: Tick) -> KernelResult<()> {
        if ticks == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut st = self.lock();
        let task = st.tasks.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        task.time_slice = ticks;
        task.remaining_slice = task.remaining_slice.min(ticks);
        Ok(())
    }

    /// Deepest stack use observed so far, in bytes.
    pub fn task_stack_max_used(&self, id: TaskId) -> KernelResult<usize> {
        self.lock()
            .tasks
            .get(id)
            .map(|t| t.stack.max_used())
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn task_info(&self, id: TaskId) -> KernelResult<TaskInfo> {
        let st = self.lock();
        let task = st.tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        Ok(TaskInfo {
            id,
            name: task.name.clone(),
            priority: task.priority,
            base_priority: task.base_priority,
            state: task.state,
            stack_size: task.stack.size(),
            stack_max_used: task.stack.max_used(),
        })
    }

    /// Snapshot of every task.
    pub fn task_list(&self) -> Vec<TaskInfo> {
        let st = self.lock();
        st.tasks
            .iter()
            .map(|(id, task)| TaskInfo {
                id,
                name: task.name.clone(),
                priority: task.priority,
                base_priority: task.base_priority,
                state: task.state,
                stack_size: task.stack.size(),
                stack_max_used: task.stack.max_used(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NoOpPort;
    use crate::config::KernelConfig;

    fn kernel() -> &'static Kernel<NoOpPort> {
        let config = KernelConfig::new().with_max_tasks(4);
        Box::leak(Box::new(Kernel::new(config).unwrap()))
    }

    #[test]
    fn test_bounded_name() {
        assert_eq!(bounded_name("worker", 15), "worker");
        assert_eq!(bounded_name("a-very-long-task-name", 6), "a-very");
        // Never split a multi-byte character
        assert_eq!(bounded_name("aé", 2), "a");
    }

    #[test]
    fn test_create_starts_in_init() {
        let k = kernel();
        let id = k.task_create("t1", 5, 1024, || {}).unwrap();
        assert_eq!(k.task_state(id), Ok(TaskState::Init));
        assert_eq!(k.task_priority(id), Ok(5));
        assert_eq!(k.task_name(id).unwrap(), "t1");
        assert_eq!(k.task_find("t1"), Some(id));
        assert_eq!(k.task_count(), 1);
    }

    #[test]
    fn test_create_validates_arguments() {
        let k = kernel();
        assert_eq!(k.task_create("bad", 32, 1024, || {}), Err(KernelError::InvalidArgument));
        assert_eq!(k.task_create("tiny", 1, 16, || {}), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_task_limit() {
        let k = kernel();
        for i in 0..4 {
            k.task_create("t", i, 512, || {}).unwrap();
        }
        assert_eq!(k.task_create("t", 1, 512, || {}), Err(KernelError::ResourceExhausted));
    }

    #[test]
    fn test_startup_before_kernel_start() {
        let k = kernel();
        let id = k.task_create("t", 3, 1024, || {}).unwrap();
        assert_eq!(k.task_startup(id), Ok(()));
        assert_eq!(k.task_state(id), Ok(TaskState::Ready));
        assert_eq!(k.task_startup(id), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_suspend_resume_ready_task() {
        let k = kernel();
        let id = k.task_create("t", 3, 1024, || {}).unwrap();
        assert_eq!(k.task_suspend(id), Err(KernelError::InvalidState));
        k.task_startup(id).unwrap();
        assert_eq!(k.task_suspend(id), Ok(()));
        assert_eq!(k.task_state(id), Ok(TaskState::Suspended));
        assert!(k.lock().ready.is_empty());
        assert_eq!(k.task_resume(id), Ok(()));
        assert_eq!(k.task_state(id), Ok(TaskState::Ready));
        assert_eq!(k.task_resume(id), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_idle_task_is_protected() {
        let k = kernel();
        let idle_priority = k.config().idle_priority();
        let idle = k.task_create("idle", idle_priority, 512, || {}).unwrap();
        k.lock().idle = Some(idle);
        k.task_startup(idle).unwrap();

        assert_eq!(k.task_suspend(idle), Err(KernelError::InvalidState));
        assert_eq!(k.task_set_priority(idle, 3), Err(KernelError::InvalidState));
        assert_eq!(k.task_set_priority(idle, idle_priority), Ok(()));
        assert_eq!(k.task_destroy(idle), Err(KernelError::InvalidState));
        assert_eq!(k.task_state(idle), Ok(TaskState::Ready));
    }

    #[test]
    fn test_set_priority_moves_ready_task() {
        let k = kernel();
        let id = k.task_create("t", 9, 1024, || {}).unwrap();
        k.task_startup(id).unwrap();
        k.task_set_priority(id, 2).unwrap();
        let st = k.lock();
        assert_eq!(st.ready.highest_priority(), Some(2));
        assert_eq!(st.ready.bucket_len(9), 0);
    }

    #[test]
    fn test_destroy_unlinks_and_runs_cleanup() {
        use portable_atomic::{AtomicBool, Ordering};
        static CLEANED: AtomicBool = AtomicBool::new(false);

        let k = kernel();
        let id = TaskBuilder::new("t")
            .priority(4)
            .cleanup(|| CLEANED.store(true, Ordering::SeqCst))
            .spawn(k, || {})
            .unwrap();
        assert_eq!(k.task_destroy(id), Ok(()));
        assert!(CLEANED.load(Ordering::SeqCst));
        assert!(k.lock().ready.is_empty());
        // Stale handle
        assert_eq!(k.task_state(id), Err(KernelError::InvalidArgument));
        assert_eq!(k.task_destroy(id), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_info_reports_stack() {
        let k = kernel();
        let id = k.task_create("info", 1, 1024, || {}).unwrap();
        let info = k.task_info(id).unwrap();
        assert_eq!(info.stack_size, 1024);
        assert_eq!(info.state, TaskState::Init);
        assert_eq!(k.task_list().len(), 1);
        assert_eq!(k.task_set_time_slice(id, 0), Err(KernelError::InvalidArgument));
        assert_eq!(k.task_set_time_slice(id, 3), Ok(()));
    }
}
