//! Workqueues: deferred callbacks run by a dedicated worker task.
//!
//! A work item is bound to the first queue it is submitted to. It is either
//! idle, pending in its queue's list, or delayed on an internal timer whose
//! expiry moves it to the pending list. The worker pops one item at a time
//! and runs its callback with no kernel lock held, so callbacks may block
//! or submit more work.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState};
use crate::mem::slab::kernel_handle;
use crate::sync::semaphore::SemaphoreId;
use crate::task::{TaskBuilder, TaskId};
use crate::time::timer::{TimerAction, TimerId};
use crate::time::{Tick, Timeout};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use log::{debug, warn};

kernel_handle!(
    /// Handle of a workqueue.
    WorkqueueId
);

kernel_handle!(
    /// Handle of a work item.
    WorkId
);

/// Work callback. Runs on the worker task.
pub type WorkFn<A> = Arc<dyn Fn(&Kernel<A>) + Send + Sync + 'static>;

/// Where a work item currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStage {
    /// Not queued; may be running
    Idle,
    /// In its queue's pending list
    Pending,
    /// Waiting for its delay timer
    Delayed,
}

pub(crate) struct WorkState<A: Port> {
    func: WorkFn<A>,
    stage: WorkStage,
    queue: Option<WorkqueueId>,
    timer: Option<TimerId>,
}

pub(crate) struct WorkqueueState {
    name: String,
    pending: VecDeque<WorkId>,
    /// Item whose callback is running
    current: Option<WorkId>,
    worker: Option<TaskId>,
    /// Binary semaphore the worker sleeps on
    signal: SemaphoreId,
}

impl<A: Port> KernelState<A> {
    /// Append `work` to its queue and wake the worker.
    fn work_enqueue(&mut self, work: WorkId) {
        let Some(queue) = self.works.get(work).and_then(|w| w.queue) else {
            return;
        };
        let Some(wq) = self.workqueues.get_mut(queue) else {
            return;
        };
        wq.pending.push_back(work);
        let signal = wq.signal;
        if let Some(w) = self.works.get_mut(work) {
            w.stage = WorkStage::Pending;
        }
        // The signal is binary: a worker that is already awake drains the
        // whole list anyway.
        let _ = self.sem_give(signal);
    }

    /// Timer expiry of a delayed submission.
    pub(crate) fn work_delay_expired(&mut self, work: WorkId) {
        if self.works.get(work).map(|w| w.stage) == Some(WorkStage::Delayed) {
            self.work_enqueue(work);
        }
    }

    /// Take `work` off its queue or timer. Returns whether it was queued.
    fn work_unqueue(&mut self, work: WorkId) -> bool {
        let Some(w) = self.works.get_mut(work) else {
            return false;
        };
        match w.stage {
            WorkStage::Idle => false,
            WorkStage::Delayed => {
                w.stage = WorkStage::Idle;
                if let Some(timer) = w.timer {
                    self.timers.stop(timer);
                }
                true
            }
            WorkStage::Pending => {
                w.stage = WorkStage::Idle;
                if let Some(wq) = w.queue.and_then(|q| self.workqueues.get_mut(q)) {
                    wq.pending.retain(|&p| p != work);
                }
                true
            }
        }
    }

    fn work_is_running(&self, work: WorkId) -> bool {
        self.works
            .get(work)
            .and_then(|w| w.queue)
            .and_then(|q| self.workqueues.get(q))
            .map_or(false, |wq| wq.current == Some(work))
    }
}

impl<A: Port> Kernel<A> {
    /// Create a workqueue and start its worker task.
    pub fn workqueue_create(&'static self, name: &str, priority: u8, stack_size: usize) -> KernelResult<WorkqueueId> {
        let signal = self.sem_create(0, 1)?;
        let state = WorkqueueState {
            name: String::from(name),
            pending: VecDeque::new(),
            current: None,
            worker: None,
            signal,
        };
        let inserted = self.lock().workqueues.insert(state);
        let id = match inserted {
            Ok(id) => id,
            Err(_) => {
                let _ = self.sem_destroy(signal);
                return Err(KernelError::ResourceExhausted);
            }
        };

        let spawned = TaskBuilder::new(name)
            .priority(priority)
            .stack_size(stack_size)
            .spawn(self, move || self.worker_loop(id, signal));
        match spawned {
            Ok(worker) => {
                if let Some(wq) = self.lock().workqueues.get_mut(id) {
                    wq.worker = Some(worker);
                }
                debug!(target: "workqueue", "created {} ({}) worker {}", name, id, worker);
                Ok(id)
            }
            Err(e) => {
                self.lock().workqueues.remove(id);
                let _ = self.sem_destroy(signal);
                Err(e)
            }
        }
    }

    fn worker_loop(&self, id: WorkqueueId, signal: SemaphoreId) {
        while self.sem_wait(signal, Timeout::Forever).is_ok() {
            self.workqueue_drain(id);
        }
        warn!(target: "workqueue", "worker of {} stopped", id);
    }

    /// Run pending items until the list is empty.
    fn workqueue_drain(&self, id: WorkqueueId) {
        loop {
            let func = {
                let mut st = self.lock();
                let state = &mut *st;
                let Some(wq) = state.workqueues.get_mut(id) else {
                    return;
                };
                let Some(work) = wq.pending.pop_front() else {
                    wq.current = None;
                    return;
                };
                wq.current = Some(work);
                match state.works.get_mut(work) {
                    Some(w) => {
                        w.stage = WorkStage::Idle;
                        w.func.clone()
                    }
                    None => continue,
                }
            };
            func(self);
        }
    }

    /// Name given at creation.
    pub fn workqueue_name(&self, id: WorkqueueId) -> KernelResult<String> {
        self.lock()
            .workqueues
            .get(id)
            .map(|wq| wq.name.clone())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Worker task of a workqueue.
    pub fn workqueue_worker(&self, id: WorkqueueId) -> KernelResult<Option<TaskId>> {
        self.lock()
            .workqueues
            .get(id)
            .map(|wq| wq.worker)
            .ok_or(KernelError::InvalidArgument)
    }

    /// The kernel-owned workqueue, when configured.
    pub fn system_workqueue(&self) -> Option<WorkqueueId> {
        self.lock().system_workqueue
    }

    /// Create an idle work item.
    pub fn work_create<F>(&self, func: F) -> KernelResult<WorkId>
    where
        F: Fn(&Kernel<A>) + Send + Sync + 'static,
    {
        let state = WorkState {
            func: Arc::new(func),
            stage: WorkStage::Idle,
            queue: None,
            timer: None,
        };
        self.lock()
            .works
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy a work item that is neither queued nor running.
    pub fn work_destroy(&self, work: WorkId) -> KernelResult<()> {
        let mut st = self.lock();
        let w = st.works.get(work).ok_or(KernelError::InvalidArgument)?;
        if w.stage != WorkStage::Idle || st.work_is_running(work) {
            return Err(KernelError::Busy);
        }
        if let Some(removed) = st.works.remove(work) {
            if let Some(timer) = removed.timer {
                st.timers.remove(timer);
            }
        }
        Ok(())
    }

    pub fn work_stage(&self, work: WorkId) -> KernelResult<WorkStage> {
        self.lock()
            .works
            .get(work)
            .map(|w| w.stage)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Queue `work` on `queue`, after `delay` ticks if non-zero.
    ///
    /// # Returns
    ///
    /// `InvalidArgument` if the item is bound to another queue, `Busy` if it
    /// is already pending or delayed.
    pub fn work_submit(&self, queue: WorkqueueId, work: WorkId, delay: Tick) -> KernelResult<()> {
        let delay = match Timeout::ticks(delay)? {
            Timeout::Ticks(ticks) => Some(ticks),
            _ => None,
        };

        let mut st = self.lock();
        if !st.workqueues.contains(queue) {
            return Err(KernelError::InvalidArgument);
        }
        let w = st.works.get_mut(work).ok_or(KernelError::InvalidArgument)?;
        if w.queue.is_some_and(|q| q != queue) {
            return Err(KernelError::InvalidArgument);
        }
        if w.stage != WorkStage::Idle {
            return Err(KernelError::Busy);
        }
        w.queue = Some(queue);

        match delay {
            None => st.work_enqueue(work),
            Some(ticks) => {
                let timer = match w.timer {
                    Some(timer) => timer,
                    None => {
                        let timer = st.timers.create(
                            String::from("work"),
                            ticks,
                            false,
                            TimerAction::SubmitWork(work),
                        )?;
                        if let Some(w) = st.works.get_mut(work) {
                            w.timer = Some(timer);
                        }
                        timer
                    }
                };
                if let Some(t) = st.timers.get_mut(timer) {
                    t.period = ticks;
                }
                st.timers.start(timer, self.tick_get())?;
                if let Some(w) = st.works.get_mut(work) {
                    w.stage = WorkStage::Delayed;
                }
            }
        }
        self.reschedule(st);
        Ok(())
    }

    /// Queue `work` on the system workqueue.
    pub fn system_work_submit(&self, work: WorkId, delay: Tick) -> KernelResult<()> {
        let queue = self.system_workqueue().ok_or(KernelError::InvalidState)?;
        self.work_submit(queue, work, delay)
    }

    /// Take `work` off its queue or delay timer without waiting.
    ///
    /// # Returns
    ///
    /// `InvalidState` if it was never submitted, `Busy` if its callback is
    /// running right now.
    pub fn work_cancel(&self, work: WorkId) -> KernelResult<()> {
        let mut st = self.lock();
        let w = st.works.get(work).ok_or(KernelError::InvalidArgument)?;
        if w.queue.is_none() {
            return Err(KernelError::InvalidState);
        }
        if st.work_unqueue(work) {
            return Ok(());
        }
        if st.work_is_running(work) {
            return Err(KernelError::Busy);
        }
        Ok(())
    }

    /// Cancel `work` and, if its callback is running, wait for it to
    /// finish.
    ///
    /// # Returns
    ///
    /// `InvalidState` if it was never submitted, or if it is running and the
    /// caller cannot wait for it: an interrupt handler, or the worker of its
    /// own queue.
    pub fn work_cancel_sync(&self, work: WorkId) -> KernelResult<()> {
        {
            let mut st = self.lock();
            if !self.work_cancel_or_check_wait(&mut st, work)? {
                return Ok(());
            }
        }

        // Queue a barrier right behind the running item and wait for the
        // worker to reach it.
        let done = self.sem_create(0, 1)?;
        let barrier = match self.work_create(move |k: &Kernel<A>| {
            let _ = k.sem_post(done);
        }) {
            Ok(barrier) => barrier,
            Err(e) => {
                let _ = self.sem_destroy(done);
                return Err(e);
            }
        };

        // The running check and the barrier insert share one lock hold, so
        // the barrier cannot end up behind an unrelated item.
        let queued = {
            let mut st = self.lock();
            match self.work_cancel_or_check_wait(&mut st, work) {
                Ok(true) => {
                    let state = &mut *st;
                    let queue = state.works.get(work).and_then(|w| w.queue);
                    if let Some(b) = state.works.get_mut(barrier) {
                        b.queue = queue;
                        b.stage = WorkStage::Pending;
                    }
                    if let Some(wq) = queue.and_then(|q| state.workqueues.get_mut(q)) {
                        wq.pending.push_front(barrier);
                    }
                    Ok(true)
                }
                other => other,
            }
        };

        let result = match queued {
            Ok(true) => self.sem_wait(done, Timeout::Forever),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        // The worker has already taken its own copy of the barrier callback.
        let mut st = self.lock();
        st.works.remove(barrier);
        st.semaphores.remove(done);
        drop(st);
        result
    }

    /// Take `work` off its queue or timer. Returns `true` when its callback
    /// is running and the caller may wait for it.
    fn work_cancel_or_check_wait(&self, st: &mut KernelState<A>, work: WorkId) -> KernelResult<bool> {
        let w = st.works.get(work).ok_or(KernelError::InvalidArgument)?;
        let queue = w.queue.ok_or(KernelError::InvalidState)?;
        st.work_unqueue(work);
        if !st.work_is_running(work) {
            return Ok(false);
        }

        let worker = st.workqueues.get(queue).and_then(|wq| wq.worker);
        if worker.is_some() && st.current == worker {
            return Err(KernelError::InvalidState);
        }
        self.blocking_context(st)?;
        Ok(true)
    }
}
