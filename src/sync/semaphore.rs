//! Counting semaphore.
//!
//! A post with tasks waiting hands the permit straight to the first waiter
//! instead of touching the count, so a woken task never has to race for it.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState};
use crate::mem::slab::kernel_handle;
use crate::sync::wait::{WaitObject, WaitQueue, WakePolicy};
use crate::time::Timeout;
use log::warn;

kernel_handle!(
    /// Handle of a semaphore.
    SemaphoreId
);

/// Maximum count meaning "no limit".
pub const SEM_UNBOUNDED: u32 = u32::MAX;

pub(crate) struct SemaphoreState {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) waiters: WaitQueue,
}

impl<A: Port> KernelState<A> {
    /// Take a permit if one is available.
    pub(crate) fn sem_take(&mut self, id: SemaphoreId) -> KernelResult<bool> {
        let sem = self.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if sem.count > 0 {
            sem.count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release a permit: wake the first waiter, or count it.
    pub(crate) fn sem_give(&mut self, id: SemaphoreId) -> KernelResult<()> {
        let sem = self.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if let Some(waiter) = sem.waiters.front() {
            self.unblock(waiter, Ok(()));
            return Ok(());
        }
        if sem.count >= sem.max {
            return Err(KernelError::Full);
        }
        sem.count += 1;
        Ok(())
    }
}

impl<A: Port> Kernel<A> {
    /// Create a semaphore holding `value` permits out of `max`.
    ///
    /// Pass [`SEM_UNBOUNDED`] as `max` for a semaphore without a limit.
    pub fn sem_create(&self, value: u32, max: u32) -> KernelResult<SemaphoreId> {
        if max == 0 || value > max {
            return Err(KernelError::InvalidArgument);
        }
        let state = SemaphoreState {
            count: value,
            max,
            waiters: WaitQueue::new(WakePolicy::Fifo),
        };
        self.lock()
            .semaphores
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy a semaphore. Blocked tasks wake with `Destroyed`.
    pub fn sem_destroy(&self, id: SemaphoreId) -> KernelResult<()> {
        let mut st = self.lock();
        if !st.semaphores.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let woken = st.wake_all(WaitObject::Semaphore(id), Err(KernelError::Destroyed));
        if woken > 0 {
            warn!(target: "sem", "semaphore {} destroyed with {} waiters", id, woken);
        }
        st.semaphores.remove(id);
        self.reschedule(st);
        Ok(())
    }

    /// Take a permit, blocking up to `timeout` while none is available.
    ///
    /// # Returns
    ///
    /// `Busy` on [`Timeout::NoWait`] with no permit, `Timeout` when the wait
    /// expires, `InvalidState` when blocking is not allowed here.
    pub fn sem_wait(&self, id: SemaphoreId, timeout: Timeout) -> KernelResult<()> {
        let timeout = timeout.validate()?;
        let mut st = self.lock();
        if st.sem_take(id)? {
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Busy);
        }
        self.blocking_context(&st)?;
        self.block_and_wait(st, Some(WaitObject::Semaphore(id)), timeout)
    }

    pub fn sem_try_wait(&self, id: SemaphoreId) -> KernelResult<()> {
        self.sem_wait(id, Timeout::NoWait)
    }

    /// Release a permit. Safe to call from interrupt handlers.
    pub fn sem_post(&self, id: SemaphoreId) -> KernelResult<()> {
        let mut st = self.lock();
        st.sem_give(id)?;
        self.reschedule(st);
        Ok(())
    }

    pub fn sem_count(&self, id: SemaphoreId) -> KernelResult<u32> {
        self.lock()
            .semaphores
            .get(id)
            .map(|s| s.count)
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn sem_max(&self, id: SemaphoreId) -> KernelResult<u32> {
        self.lock()
            .semaphores
            .get(id)
            .map(|s| s.max)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Number of tasks blocked on the semaphore.
    pub fn sem_waiters(&self, id: SemaphoreId) -> KernelResult<usize> {
        self.lock()
            .semaphores
            .get(id)
            .map(|s| s.waiters.len())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Change the wake order. Refused while tasks are waiting.
    pub fn sem_set_wake_policy(&self, id: SemaphoreId, policy: WakePolicy) -> KernelResult<()> {
        let mut st = self.lock();
        let sem = st.semaphores.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if !sem.waiters.is_empty() {
            return Err(KernelError::Busy);
        }
        sem.waiters.set_policy(policy);
        Ok(())
    }
}
