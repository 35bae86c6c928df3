//! Recursive mutex with priority inheritance.
//!
//! With the [`WakePolicy::Priority`] policy, a task that blocks on an owned
//! mutex lends its priority to the owner. Inheritance is one level deep: an
//! owner that is itself blocked on another mutex is repositioned in that
//! wait list, but the boost does not travel further.
//!
//! An owner's effective priority is always the higher of its base priority
//! and the head waiter of every priority-ordered mutex it holds.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState};
use crate::mem::slab::kernel_handle;
use crate::sync::wait::{WaitObject, WaitQueue, WakePolicy};
use crate::task::TaskId;
use crate::time::Timeout;
use log::{debug, warn};

kernel_handle!(
    /// Handle of a mutex.
    MutexId
);

pub(crate) struct MutexState {
    pub(crate) owner: Option<TaskId>,
    /// Recursive lock depth of the owner
    pub(crate) nest: u32,
    pub(crate) waiters: WaitQueue,
}

impl MutexState {
    fn inherits(&self) -> bool {
        self.waiters.policy() == WakePolicy::Priority
    }
}

impl<A: Port> KernelState<A> {
    /// Priority `task` should run at given the mutexes it holds.
    pub(crate) fn inherited_priority(&self, task: TaskId) -> Option<u8> {
        let tcb = self.tasks.get(task)?;
        let mut priority = tcb.base_priority;
        for &held in &tcb.held_mutexes {
            let head = self
                .mutexes
                .get(held)
                .filter(|m| m.inherits())
                .and_then(|m| m.waiters.front())
                .and_then(|w| self.tasks.get(w));
            if let Some(waiter) = head {
                priority = priority.min(waiter.priority);
            }
        }
        Some(priority)
    }

    /// Recompute the priority of the owner of `mutex`.
    pub(crate) fn mutex_restore_owner_priority(&mut self, mutex: MutexId) {
        let Some(owner) = self.mutexes.get(mutex).and_then(|m| m.owner) else {
            return;
        };
        if let Some(priority) = self.inherited_priority(owner) {
            self.set_effective_priority(owner, priority);
        }
    }

    /// Give up `mutex` entirely: hand it to the head waiter or leave it
    /// free, then drop whatever priority `owner` inherited through it.
    fn mutex_release(&mut self, mutex: MutexId, owner: TaskId) {
        if let Some(task) = self.tasks.get_mut(owner) {
            task.held_mutexes.retain(|&m| m != mutex);
        }

        let next = match self.mutexes.get_mut(mutex) {
            Some(m) => {
                let next = m.waiters.front();
                m.owner = next;
                m.nest = u32::from(next.is_some());
                next
            }
            None => None,
        };
        if let Some(next) = next {
            if let Some(task) = self.tasks.get_mut(next) {
                task.held_mutexes.push(mutex);
            }
            // Leaving the wait list also sets the new owner's priority from
            // the waiters left behind.
            self.unblock(next, Ok(()));
        }

        if let Some(priority) = self.inherited_priority(owner) {
            self.set_effective_priority(owner, priority);
        }
    }

    /// Release every mutex `task` holds. Used when a task exits.
    pub(crate) fn mutex_release_all(&mut self, task: TaskId) {
        let held = match self.tasks.get(task) {
            Some(t) if !t.held_mutexes.is_empty() => t.held_mutexes.clone(),
            _ => return,
        };
        warn!(target: "mutex", "task {} exited holding {} mutexes", task, held.len());
        for mutex in held {
            self.mutex_release(mutex, task);
        }
    }
}

impl<A: Port> Kernel<A> {
    /// Create a mutex. [`WakePolicy::Priority`] enables priority
    /// inheritance.
    pub fn mutex_create(&self, policy: WakePolicy) -> KernelResult<MutexId> {
        let state = MutexState {
            owner: None,
            nest: 0,
            waiters: WaitQueue::new(policy),
        };
        self.lock()
            .mutexes
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy an unowned mutex.
    pub fn mutex_destroy(&self, id: MutexId) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = st.mutexes.get(id).ok_or(KernelError::InvalidArgument)?;
        if mutex.owner.is_some() {
            return Err(KernelError::Busy);
        }
        st.mutexes.remove(id);
        Ok(())
    }

    /// Acquire the mutex, blocking up to `timeout` while another task owns
    /// it. The owner may lock again; each lock needs its own unlock.
    ///
    /// # Returns
    ///
    /// `Busy` on [`Timeout::NoWait`] while owned by another task, `Timeout`
    /// when the wait expires, `InvalidState` from interrupt context.
    pub fn mutex_lock(&self, id: MutexId, timeout: Timeout) -> KernelResult<()> {
        let timeout = timeout.validate()?;
        if self.in_interrupt() {
            warn!(target: "mutex", "mutex {} locked from interrupt context", id);
            return Err(KernelError::InvalidState);
        }

        let mut st = self.lock();
        let current = st.current.ok_or(KernelError::InvalidState)?;
        let state = &mut *st;
        let mutex = state.mutexes.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        let owner = match mutex.owner {
            None => {
                mutex.owner = Some(current);
                mutex.nest = 1;
                if let Some(task) = state.tasks.get_mut(current) {
                    task.held_mutexes.push(id);
                }
                return Ok(());
            }
            Some(owner) if owner == current => {
                mutex.nest = mutex.nest.checked_add(1).ok_or(KernelError::InvalidState)?;
                return Ok(());
            }
            Some(owner) => owner,
        };
        let inherits = mutex.inherits();

        if timeout.is_no_wait() {
            return Err(KernelError::Busy);
        }
        self.blocking_context(&st)?;

        if inherits {
            let waiter_priority = st.tasks.get(current).map(|t| t.priority);
            let owner_priority = st.tasks.get(owner).map(|t| t.priority);
            if let (Some(waiter), Some(held)) = (waiter_priority, owner_priority) {
                if waiter < held {
                    debug!(target: "mutex", "task {} inherits priority {} from {}", owner, waiter, current);
                    st.set_effective_priority(owner, waiter);
                }
            }
        }

        // Ownership is handed over by the unlocking task before it wakes us.
        self.block_and_wait(st, Some(WaitObject::Mutex(id)), timeout)
    }

    pub fn mutex_try_lock(&self, id: MutexId) -> KernelResult<()> {
        self.mutex_lock(id, Timeout::NoWait)
    }

    /// Release one level of the mutex. The last release hands it to the
    /// next waiter and drops any inherited priority.
    pub fn mutex_unlock(&self, id: MutexId) -> KernelResult<()> {
        if self.in_interrupt() {
            return Err(KernelError::InvalidState);
        }
        let mut st = self.lock();
        let current = st.current.ok_or(KernelError::InvalidState)?;
        let mutex = st.mutexes.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if mutex.owner != Some(current) {
            warn!(target: "mutex", "task {} unlocked mutex {} it does not own", current, id);
            return Err(KernelError::NotOwner);
        }

        mutex.nest -= 1;
        if mutex.nest > 0 {
            return Ok(());
        }
        st.mutex_release(id, current);
        self.reschedule(st);
        Ok(())
    }

    pub fn mutex_owner(&self, id: MutexId) -> KernelResult<Option<TaskId>> {
        self.lock()
            .mutexes
            .get(id)
            .map(|m| m.owner)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Recursive lock depth of the current owner, 0 when free.
    pub fn mutex_nest(&self, id: MutexId) -> KernelResult<u32> {
        self.lock()
            .mutexes
            .get(id)
            .map(|m| m.nest)
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn mutex_waiters(&self, id: MutexId) -> KernelResult<usize> {
        self.lock()
            .mutexes
            .get(id)
            .map(|m| m.waiters.len())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Change the wake policy, and with it inheritance. Only while unowned.
    pub fn mutex_set_wake_policy(&self, id: MutexId, policy: WakePolicy) -> KernelResult<()> {
        let mut st = self.lock();
        let mutex = st.mutexes.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if mutex.owner.is_some() {
            return Err(KernelError::Busy);
        }
        mutex.waiters.set_policy(policy);
        Ok(())
    }
}
