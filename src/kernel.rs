//! The kernel context and the scheduler core.
//!
//! All mutable kernel state lives in one [`KernelState`] behind an
//! interrupt-masking spinlock owned by [`Kernel`]. There is no global: every
//! operation goes through a `&Kernel`, and task code reaches the kernel the
//! same way (tasks are created from a `&'static Kernel`).
//!
//! The only place a task leaves its own stack is `reschedule`, which picks the
//! next task under the lock, drops the lock, and then asks the port to switch.

use crate::arch::Port;
use crate::config::KernelConfig;
use crate::errors::{FatalError, KernelError, KernelResult};
use crate::irq::{InterruptNest, Leave};
use crate::mem::slab::Slab;
use crate::sched::ready::ReadyQueue;
use crate::sync::event::{EventId, EventState};
use crate::sync::mailbox::{MailboxId, MailboxState};
use crate::sync::mq::{MqId, MqState};
use crate::sync::mutex::{MutexId, MutexState};
use crate::sync::semaphore::{SemaphoreId, SemaphoreState};
use crate::sync::spinlock::{IrqSpinGuard, IrqSpinLock};
use crate::sync::wait::{WaitObject, WaitQueue};
use crate::task::{TaskId, TaskState, TaskTable, Tcb};
use crate::time::timer::{TimerCallback, TimerTable};
use crate::time::{Tick, TickCounter, TickQueue, Timeout};
use crate::workqueue::{WorkId, WorkState, WorkqueueId, WorkqueueState};
use alloc::vec::Vec;
use log::{debug, error, warn};

/// Guard over the kernel state.
pub(crate) type KernelGuard<'a, A> = IrqSpinGuard<'a, A, KernelState<A>>;

/// A context switch decided under the lock, carried out after releasing it.
pub(crate) struct Switch<A: Port> {
    /// `None` when the outgoing task no longer exists
    from: Option<*mut A::Context>,
    to: *const A::Context,
    from_id: TaskId,
    to_id: TaskId,
}

/// Everything the kernel lock protects.
pub(crate) struct KernelState<A: Port> {
    pub(crate) tasks: TaskTable<A>,
    pub(crate) ready: ReadyQueue,
    /// The Running task. Never a member of the ready queue.
    pub(crate) current: Option<TaskId>,
    /// Move the running task behind its equal-priority peers at the next
    /// scheduling point.
    pub(crate) yield_requested: bool,
    pub(crate) sched_lock: u32,
    pub(crate) started: bool,
    pub(crate) sleepers: TickQueue,
    pub(crate) timers: TimerTable<A>,
    pub(crate) semaphores: Slab<SemaphoreId, SemaphoreState>,
    pub(crate) mutexes: Slab<MutexId, MutexState>,
    pub(crate) events: Slab<EventId, EventState>,
    pub(crate) mailboxes: Slab<MailboxId, MailboxState>,
    pub(crate) queues: Slab<MqId, MqState>,
    pub(crate) workqueues: Slab<WorkqueueId, WorkqueueState>,
    pub(crate) works: Slab<WorkId, WorkState<A>>,
    /// Closed tasks waiting for the idle task to reclaim them
    pub(crate) closed: Vec<TaskId>,
    pub(crate) idle: Option<TaskId>,
    pub(crate) system_workqueue: Option<WorkqueueId>,
    pub(crate) switches: u64,
}

impl<A: Port> KernelState<A> {
    fn new(config: &KernelConfig) -> Self {
        Self {
            tasks: Slab::with_limit(config.max_tasks),
            ready: ReadyQueue::new(config.priority_levels as usize),
            current: None,
            yield_requested: false,
            sched_lock: 0,
            started: false,
            sleepers: TickQueue::new(),
            timers: TimerTable::new(config.max_objects),
            semaphores: Slab::with_limit(config.max_objects),
            mutexes: Slab::with_limit(config.max_objects),
            events: Slab::with_limit(config.max_objects),
            mailboxes: Slab::with_limit(config.max_objects),
            queues: Slab::with_limit(config.max_objects),
            workqueues: Slab::with_limit(config.max_objects),
            works: Slab::with_limit(config.max_objects),
            closed: Vec::new(),
            idle: None,
            system_workqueue: None,
            switches: 0,
        }
    }

    /// Put a task on the tail of its ready bucket.
    pub(crate) fn enqueue_ready(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.state = TaskState::Ready;
            self.ready.push_back(&mut self.tasks, id);
        }
    }

    /// Take a Ready task off the ready queue.
    pub(crate) fn dequeue_ready(&mut self, id: TaskId) {
        if self.tasks.get(id).map(|t| t.state) == Some(TaskState::Ready) {
            self.ready.remove(&mut self.tasks, id);
        }
    }

    /// The wait queue behind `obj` together with the task table.
    pub(crate) fn wait_queue(&mut self, obj: WaitObject) -> Option<(&mut WaitQueue, &mut TaskTable<A>)> {
        let tasks = &mut self.tasks;
        let queue = match obj {
            WaitObject::Semaphore(id) => self.semaphores.get_mut(id).map(|s| &mut s.waiters),
            WaitObject::Mutex(id) => self.mutexes.get_mut(id).map(|m| &mut m.waiters),
            WaitObject::Event(id) => self.events.get_mut(id).map(|e| &mut e.waiters),
            WaitObject::MailboxSend(id) => self.mailboxes.get_mut(id).map(|m| &mut m.senders),
            WaitObject::MailboxRecv(id) => self.mailboxes.get_mut(id).map(|m| &mut m.receivers),
            WaitObject::MqSend(id) => self.queues.get_mut(id).map(|q| &mut q.senders),
            WaitObject::MqRecv(id) => self.queues.get_mut(id).map(|q| &mut q.receivers),
        };
        queue.map(|q| (q, tasks))
    }

    /// Block the running task on `obj` (or on time alone) until woken or
    /// until `timeout` expires. Returns the blocked task.
    pub(crate) fn block_current(
        &mut self,
        obj: Option<WaitObject>,
        timeout: Timeout,
        now: Tick,
    ) -> Option<TaskId> {
        let id = self.current?;
        {
            let task = self.tasks.get_mut(id)?;
            task.state = TaskState::Blocked;
            task.blocked_on = obj;
            task.wake_result = Ok(());
            task.in_tick_queue = matches!(timeout, Timeout::Ticks(_));
        }

        if let Timeout::Ticks(ticks) = timeout {
            self.sleepers.insert(&mut self.tasks, id, now.wrapping_add(ticks));
        }
        if let Some(obj) = obj {
            if let Some((queue, tasks)) = self.wait_queue(obj) {
                queue.enqueue(tasks, id);
            }
        }
        Some(id)
    }

    /// Wake a blocked task with `result`.
    ///
    /// The task leaves its wait list and the timeout queue together, so a
    /// timeout and a signal racing for the same task cannot both succeed:
    /// whichever comes second finds the task no longer Blocked.
    pub(crate) fn unblock(&mut self, id: TaskId, result: KernelResult<()>) -> bool {
        let (obj, timed) = match self.tasks.get_mut(id) {
            Some(task) if task.state == TaskState::Blocked => {
                task.wake_result = result;
                (task.blocked_on.take(), core::mem::take(&mut task.in_tick_queue))
            }
            _ => return false,
        };

        if timed {
            self.sleepers.remove(&mut self.tasks, id);
        }
        if let Some(obj) = obj {
            self.leave_wait_queue(obj, id);
        }
        self.enqueue_ready(id);
        true
    }

    fn leave_wait_queue(&mut self, obj: WaitObject, id: TaskId) {
        if let Some((queue, tasks)) = self.wait_queue(obj) {
            queue.remove(tasks, id);
        }
        // A departing mutex waiter may have been the source of the owner's
        // inherited priority.
        if let WaitObject::Mutex(mutex) = obj {
            self.mutex_restore_owner_priority(mutex);
        }
    }

    /// Remove a task from whatever queue holds it, leaving its state alone.
    pub(crate) fn detach(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        match task.state {
            TaskState::Ready => self.ready.remove(&mut self.tasks, id),
            TaskState::Blocked => {
                let obj = task.blocked_on.take();
                if core::mem::take(&mut task.in_tick_queue) {
                    self.sleepers.remove(&mut self.tasks, id);
                }
                if let Some(obj) = obj {
                    self.leave_wait_queue(obj, id);
                }
            }
            _ => {}
        }
    }

    /// Wake every task waiting on `obj` with `result`.
    pub(crate) fn wake_all(&mut self, obj: WaitObject, result: KernelResult<()>) -> usize {
        let mut woken = 0;
        while let Some(id) = self.wait_queue(obj).and_then(|(q, _)| q.front()) {
            if !self.unblock(id, result) {
                break;
            }
            woken += 1;
        }
        woken
    }

    /// Change the effective priority of a task, keeping whichever queue it
    /// is on consistent. Does not touch mutex owners.
    pub(crate) fn set_effective_priority(&mut self, id: TaskId, priority: u8) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        if task.priority == priority {
            return;
        }

        match (task.state, task.blocked_on) {
            (TaskState::Ready, _) => {
                self.ready.remove(&mut self.tasks, id);
                if let Some(task) = self.tasks.get_mut(id) {
                    task.priority = priority;
                }
                self.ready.push_back(&mut self.tasks, id);
            }
            (TaskState::Blocked, Some(obj)) => {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.priority = priority;
                }
                if let Some((queue, tasks)) = self.wait_queue(obj) {
                    queue.reposition(tasks, id);
                }
            }
            _ => {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.priority = priority;
                }
            }
        }
    }

    /// Pick the task that should run next.
    ///
    /// The running task keeps the CPU unless a strictly higher priority task
    /// is ready, or it asked to yield and an equal-priority task is ready. A
    /// preempted task goes back to the head of its bucket, a yielding one to
    /// the tail. A task that stopped running (blocked, suspended, closed) is
    /// simply replaced.
    pub(crate) fn select_next(&mut self, stack_check: bool) -> Result<Option<Switch<A>>, FatalError> {
        let Some(current) = self.current else {
            return Ok(None);
        };
        let yield_requested = core::mem::take(&mut self.yield_requested);

        let running = self
            .tasks
            .get(current)
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.priority);

        if let Some(priority) = running {
            match self.ready.highest_priority() {
                Some(best) if best < priority => {
                    if yield_requested {
                        self.ready.push_back(&mut self.tasks, current);
                    } else {
                        self.ready.push_front(&mut self.tasks, current);
                    }
                }
                Some(best) if best == priority && yield_requested => {
                    self.ready.push_back(&mut self.tasks, current);
                }
                _ => return Ok(None),
            }
            if let Some(task) = self.tasks.get_mut(current) {
                task.state = TaskState::Ready;
            }
        }

        let next = self.ready.pop_highest(&mut self.tasks)?.ok_or(FatalError::NoReadyTask)?;
        if let Some(task) = self.tasks.get_mut(next) {
            task.state = TaskState::Running;
        }
        if next == current {
            return Ok(None);
        }

        // The outgoing context is only saved by the switch itself, so its
        // stack pointer is stale here; only its base poison can be checked.
        let from = match self.tasks.get(current) {
            Some(task) => {
                if stack_check && task.state != TaskState::Close && !task.stack.base_intact() {
                    return Err(FatalError::StackOverflow { task: current });
                }
                Some(task.context.get())
            }
            None => None,
        };
        let to = match self.tasks.get(next) {
            Some(task) => {
                if stack_check {
                    let sp = A::saved_sp(unsafe { &*task.context.get() });
                    if task.stack.is_overflow(sp) {
                        return Err(FatalError::StackOverflow { task: next });
                    }
                }
                task.context.get() as *const A::Context
            }
            None => return Err(FatalError::NoReadyTask),
        };

        self.current = Some(next);
        self.switches += 1;
        Ok(Some(Switch {
            from,
            to,
            from_id: current,
            to_id: next,
        }))
    }

    /// Per-tick bookkeeping: expire timeouts, account the time slice and
    /// fire software timers. Returns the timer callbacks to run once the
    /// lock is released.
    fn process_tick(&mut self, now: Tick) -> Vec<TimerCallback<A>> {
        while let Some(id) = self.sleepers.pop_expired(&mut self.tasks, now) {
            if let Some(task) = self.tasks.get_mut(id) {
                task.in_tick_queue = false;
            }
            self.unblock(id, Err(KernelError::Timeout));
        }

        if let Some(current) = self.current {
            if let Some(task) = self.tasks.get_mut(current) {
                if task.state == TaskState::Running {
                    task.remaining_slice = task.remaining_slice.saturating_sub(1);
                    if task.remaining_slice == 0 {
                        task.remaining_slice = task.time_slice;
                        if self.ready.bucket_len(task.priority) > 0 {
                            self.yield_requested = true;
                        }
                    }
                }
            }
        }

        self.expire_timers(now)
    }
}

#[cfg(test)]
impl<A: Port> KernelState<A> {
    /// Check that every task sits in exactly the queues its state calls for:
    /// the ready queue iff Ready, the wait list it names iff Blocked on it,
    /// and the timeout queue iff `in_tick_queue`.
    pub(crate) fn check_queues(&self) -> Result<(), alloc::string::String> {
        use alloc::format;

        let mut lists: Vec<(WaitObject, &WaitQueue)> = Vec::new();
        lists.extend(self.semaphores.iter().map(|(id, s)| (WaitObject::Semaphore(id), &s.waiters)));
        lists.extend(self.mutexes.iter().map(|(id, m)| (WaitObject::Mutex(id), &m.waiters)));
        lists.extend(self.events.iter().map(|(id, e)| (WaitObject::Event(id), &e.waiters)));
        for (id, m) in self.mailboxes.iter() {
            lists.push((WaitObject::MailboxSend(id), &m.senders));
            lists.push((WaitObject::MailboxRecv(id), &m.receivers));
        }
        for (id, q) in self.queues.iter() {
            lists.push((WaitObject::MqSend(id), &q.senders));
            lists.push((WaitObject::MqRecv(id), &q.receivers));
        }

        let mut ready = 0;
        for (id, task) in self.tasks.iter() {
            let queued = self.ready.contains(&self.tasks, id);
            if queued != (task.state == TaskState::Ready) {
                return Err(format!("task {} is {:?} but ready-queued={}", id, task.state, queued));
            }
            if task.state == TaskState::Ready {
                ready += 1;
            }

            let holders: Vec<WaitObject> = lists
                .iter()
                .filter(|(_, queue)| queue.contains(&self.tasks, id))
                .map(|&(obj, _)| obj)
                .collect();
            let consistent = match (task.state, task.blocked_on) {
                (TaskState::Blocked, Some(obj)) => holders == [obj],
                (_, None) => holders.is_empty(),
                (_, Some(_)) => false,
            };
            if !consistent {
                return Err(format!(
                    "task {} is {:?} on {:?} but listed in {:?}",
                    id, task.state, task.blocked_on, holders
                ));
            }

            let timed = self.sleepers.contains(&self.tasks, id);
            if timed != task.in_tick_queue || (timed && task.state != TaskState::Blocked) {
                return Err(format!("task {} is {:?} but tick-queued={}", id, task.state, timed));
            }
        }

        if ready != self.ready.len() {
            return Err(format!("{} ready tasks but {} queued", ready, self.ready.len()));
        }
        Ok(())
    }
}

/// The kernel: scheduler context, interrupt tracker and tick source.
///
/// # Type Parameters
///
/// * `A` - Architecture port
pub struct Kernel<A: Port> {
    state: IrqSpinLock<A, KernelState<A>>,
    irq: InterruptNest,
    ticks: TickCounter,
    config: KernelConfig,
}

impl<A: Port> Kernel<A> {
    /// Create a kernel. Nothing runs until [`start`](Self::start).
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        Ok(Self {
            state: IrqSpinLock::new(KernelState::new(&config)),
            irq: InterruptNest::new(),
            ticks: TickCounter::new(config.tick_per_second),
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> KernelGuard<'_, A> {
        self.state.lock()
    }

    /// Whether [`start`](Self::start) has handed the CPU to the first task.
    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Start scheduling: create the idle task (and the system workqueue if
    /// configured), then switch to the highest-priority ready task.
    ///
    /// Never returns. A failure while preparing the first switch halts.
    pub fn start(&'static self) -> ! {
        match self.prepare_start() {
            Ok(first) => {
                debug!(target: "sched", "kernel started");
                unsafe { A::context_switch_to(first) }
            }
            Err(e) => {
                error!(target: "sched", "kernel start failed: {}", e);
                A::halt()
            }
        }
    }

    fn prepare_start(&'static self) -> KernelResult<*const A::Context> {
        if self.lock().started {
            return Err(KernelError::InvalidState);
        }

        let idle = crate::task::TaskBuilder::new("idle")
            .priority(self.config.idle_priority())
            .stack_size(self.config.idle_stack_size)
            .spawn(self, move || self.idle_loop())?;
        self.lock().idle = Some(idle);

        if let Some(wq) = self.config.system_workqueue {
            let id = self.workqueue_create("sys_work", wq.priority, wq.stack_size)?;
            self.lock().system_workqueue = Some(id);
        }

        let mut st = self.lock();
        let state = &mut *st;
        let first = match state.ready.pop_highest(&mut state.tasks) {
            Ok(Some(id)) => id,
            Ok(None) => return Err(KernelError::InvalidState),
            Err(fatal) => {
                drop(st);
                self.fatal(fatal)
            }
        };
        let task = st.tasks.get_mut(first).ok_or(KernelError::InvalidState)?;
        task.state = TaskState::Running;
        let context = task.context.get() as *const A::Context;
        st.current = Some(first);
        st.started = true;
        Ok(context)
    }

    fn idle_loop(&'static self) {
        loop {
            self.reclaim_closed();
            A::wait_for_interrupt();
            if A::SIMULATED_TICK {
                self.interrupt_enter();
                self.tick_increase();
                self.interrupt_leave();
            }
        }
    }

    /// Check whether a different task should run and switch to it.
    ///
    /// Inside an interrupt handler the switch is only recorded and happens
    /// at the outermost [`interrupt_leave`](Self::interrupt_leave).
    pub fn schedule(&self) {
        let st = self.lock();
        self.reschedule(st);
    }

    /// Release `st` and perform whatever switch the current state calls for.
    pub(crate) fn reschedule(&self, mut st: KernelGuard<'_, A>) {
        if !st.started || st.current.is_none() || st.sched_lock > 0 {
            return;
        }
        if self.irq.in_interrupt() {
            self.irq.defer_switch();
            return;
        }

        match st.select_next(self.config.stack_check) {
            Ok(None) => {}
            Ok(Some(switch)) => {
                drop(st);
                if let Some(hook) = self.config.switch_hook {
                    hook(switch.from_id, switch.to_id);
                }
                match switch.from {
                    Some(from) => unsafe { A::context_switch(from, switch.to) },
                    None => unsafe { A::context_switch_to(switch.to) },
                }
            }
            Err(fatal) => {
                drop(st);
                self.fatal(fatal)
            }
        }
    }

    /// Give the CPU to the next ready task of the same priority, if any.
    pub fn yield_now(&self) {
        let mut st = self.lock();
        if self.irq.in_interrupt() || st.current.is_none() {
            return;
        }
        st.yield_requested = true;
        self.reschedule(st);
    }

    /// Disable task switching. Nests.
    pub fn sched_lock(&self) {
        let mut st = self.lock();
        st.sched_lock = st.sched_lock.saturating_add(1);
    }

    /// Re-enable task switching; the last unlock reschedules.
    pub fn sched_unlock(&self) -> KernelResult<()> {
        let mut st = self.lock();
        match st.sched_lock {
            0 => Err(KernelError::InvalidState),
            1 => {
                st.sched_lock = 0;
                self.reschedule(st);
                Ok(())
            }
            _ => {
                st.sched_lock -= 1;
                Ok(())
            }
        }
    }

    /// Current scheduler-lock nesting depth.
    pub fn sched_lock_depth(&self) -> u32 {
        self.lock().sched_lock
    }

    /// Call on entry to every interrupt handler that may use the kernel.
    pub fn interrupt_enter(&self) {
        self.irq.enter();
    }

    /// Call on exit from every such handler. The outermost exit performs any
    /// switch requested while handlers were running.
    pub fn interrupt_leave(&self) {
        match self.irq.leave() {
            Leave::Reschedule => self.schedule(),
            Leave::Underflow => self.fatal(FatalError::InterruptUnderflow),
            Leave::Nested | Leave::Resume => {}
        }
    }

    pub fn in_interrupt(&self) -> bool {
        self.irq.in_interrupt()
    }

    pub fn interrupt_nest(&self) -> usize {
        self.irq.depth()
    }

    /// Advance the tick. Call from the periodic timer interrupt, between
    /// [`interrupt_enter`](Self::interrupt_enter) and
    /// [`interrupt_leave`](Self::interrupt_leave).
    pub fn tick_increase(&self) {
        let mut st = self.lock();
        let now = self.ticks.increment();
        let callbacks = st.process_tick(now);
        drop(st);

        for callback in callbacks {
            callback(self);
        }
        self.schedule();
    }

    pub fn tick_get(&self) -> Tick {
        self.ticks.ticks()
    }

    pub fn tick_from_ms(&self, ms: u32) -> Tick {
        self.ticks.ms_to_ticks(ms)
    }

    /// Ticks until the earliest task timeout or timer, for tickless idle.
    pub fn next_timeout(&self) -> Option<Tick> {
        let st = self.lock();
        let now = self.ticks.ticks();
        let tasks = st.sleepers.next_expiry(&st.tasks, now);
        let timers = st.timers.next_expiry(now);
        match (tasks, timers) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Number of context switches performed so far.
    pub fn context_switches(&self) -> u64 {
        self.lock().switches
    }

    #[cfg(test)]
    pub(crate) fn check_queues(&self) -> Result<(), alloc::string::String> {
        self.lock().check_queues()
    }

    /// Ensure the caller may block: task context, scheduler running and
    /// unlocked. Returns the calling task.
    pub(crate) fn blocking_context(&self, st: &KernelState<A>) -> KernelResult<TaskId> {
        if self.irq.in_interrupt() {
            warn!(target: "sched", "blocking call from interrupt context");
            return Err(KernelError::InvalidState);
        }
        if !st.started || st.sched_lock > 0 {
            return Err(KernelError::InvalidState);
        }
        st.current.ok_or(KernelError::InvalidState)
    }

    /// Block the running task and return its wake result once it runs again.
    pub(crate) fn block_and_wait(
        &self,
        mut st: KernelGuard<'_, A>,
        obj: Option<WaitObject>,
        timeout: Timeout,
    ) -> KernelResult<()> {
        let id = st
            .block_current(obj, timeout, self.ticks.ticks())
            .ok_or(KernelError::InvalidState)?;
        self.reschedule(st);

        let mut st = self.lock();
        let task = st.tasks.get_mut(id).ok_or(KernelError::InvalidState)?;
        core::mem::replace(&mut task.wake_result, Ok(()))
    }

    /// Report an unrecoverable condition and halt.
    pub fn fatal(&self, error: FatalError) -> ! {
        error!(target: "fatal", "{}", error);
        if let Some(hook) = self.config.safety_hook {
            hook(&error);
        }
        A::halt()
    }

    /// Free the stacks and slots of closed tasks and run their cleanup
    /// callbacks. Runs in the idle task.
    pub(crate) fn reclaim_closed(&self) {
        let reclaimed: Vec<Tcb<A>> = {
            let mut st = self.lock();
            if st.closed.is_empty() {
                return;
            }
            let current = st.current;
            let mut ids = core::mem::take(&mut st.closed);
            // The running task cannot give up the stack it runs on.
            ids.retain(|&id| {
                if Some(id) == current {
                    st.closed.push(id);
                    false
                } else {
                    true
                }
            });
            ids.into_iter().filter_map(|id| st.tasks.remove(id)).collect()
        };

        for mut task in reclaimed {
            if let Some(cleanup) = task.cleanup.take() {
                cleanup();
            }
            debug!(target: "task", "reclaimed {}", task.name);
        }
    }
}
