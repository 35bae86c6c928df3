//! 32-bit event flags with AND/OR matching and optional auto-clear.
//!
//! A send evaluates every waiter against the same updated flag set, so
//! several waiters may match one send. Bits a matching waiter asked to clear
//! are collected during the scan and cleared only after it.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mem::slab::kernel_handle;
use crate::sync::wait::{WaitObject, WaitQueue, WakePolicy};
use crate::task::{EventWait, TaskId};
use crate::time::Timeout;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::warn;

kernel_handle!(
    /// Handle of an event.
    EventId
);

bitflags! {
    /// How `event_recv` matches its interested bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventOption: u8 {
        /// All interested bits must be set
        const AND = 0x01;
        /// Any interested bit suffices
        const OR = 0x02;
        /// Clear the matched bits on success
        const CLEAR = 0x04;
    }
}

impl EventOption {
    fn is_valid(self) -> bool {
        self.contains(EventOption::AND) != self.contains(EventOption::OR)
    }
}

pub(crate) struct EventState {
    pub(crate) set: u32,
    pub(crate) waiters: WaitQueue,
}

/// Bits of `set` that satisfy a waiter, if it is satisfied.
pub fn event_match(set: u32, interested: u32, option: EventOption) -> Option<u32> {
    if option.contains(EventOption::AND) {
        (set & interested == interested).then_some(interested)
    } else {
        let matched = set & interested;
        (matched != 0).then_some(matched)
    }
}

impl<A: Port> Kernel<A> {
    pub fn event_create(&self, policy: WakePolicy) -> KernelResult<EventId> {
        let state = EventState {
            set: 0,
            waiters: WaitQueue::new(policy),
        };
        self.lock()
            .events
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy an event. Blocked tasks wake with `Destroyed`.
    pub fn event_destroy(&self, id: EventId) -> KernelResult<()> {
        let mut st = self.lock();
        if !st.events.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let woken = st.wake_all(WaitObject::Event(id), Err(KernelError::Destroyed));
        if woken > 0 {
            warn!(target: "event", "event {} destroyed with {} waiters", id, woken);
        }
        st.events.remove(id);
        self.reschedule(st);
        Ok(())
    }

    /// Set `bits` and wake every waiter they satisfy. Safe to call from
    /// interrupt handlers.
    pub fn event_send(&self, id: EventId, bits: u32) -> KernelResult<()> {
        if bits == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut st = self.lock();
        let state = &mut *st;
        let event = state.events.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        event.set |= bits;
        let set = event.set;
        let waiters: Vec<TaskId> = event.waiters.iter(&state.tasks).collect();

        let mut clear = 0;
        for waiter in waiters {
            let Some(task) = st.tasks.get_mut(waiter) else {
                continue;
            };
            let wait = task.event_wait;
            if let Some(matched) = event_match(set, wait.interested, wait.option) {
                task.event_wait.received = matched;
                if wait.option.contains(EventOption::CLEAR) {
                    clear |= matched;
                }
                st.unblock(waiter, Ok(()));
            }
        }

        if let Some(event) = st.events.get_mut(id) {
            event.set &= !clear;
        }
        self.reschedule(st);
        Ok(())
    }

    /// Wait until the flags satisfy `interested` under `option` and return
    /// the matched bits.
    ///
    /// # Returns
    ///
    /// `Empty` on [`Timeout::NoWait`] without a match, `Timeout` if nothing
    /// matched by the deadline (checked once more after expiry).
    pub fn event_recv(
        &self,
        id: EventId,
        interested: u32,
        option: EventOption,
        timeout: Timeout,
    ) -> KernelResult<u32> {
        if interested == 0 || !option.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let timeout = timeout.validate()?;

        let mut st = self.lock();
        let event = st.events.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if let Some(matched) = event_match(event.set, interested, option) {
            if option.contains(EventOption::CLEAR) {
                event.set &= !matched;
            }
            return Ok(matched);
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Empty);
        }

        let current = self.blocking_context(&st)?;
        if let Some(task) = st.tasks.get_mut(current) {
            task.event_wait = EventWait {
                interested,
                option,
                received: 0,
            };
        }

        match self.block_and_wait(st, Some(WaitObject::Event(id)), timeout) {
            Ok(()) => {
                let st = self.lock();
                st.tasks
                    .get(current)
                    .map(|t| t.event_wait.received)
                    .ok_or(KernelError::InvalidState)
            }
            Err(KernelError::Timeout) => {
                let mut st = self.lock();
                let event = st.events.get_mut(id).ok_or(KernelError::Destroyed)?;
                match event_match(event.set, interested, option) {
                    Some(matched) => {
                        if option.contains(EventOption::CLEAR) {
                            event.set &= !matched;
                        }
                        Ok(matched)
                    }
                    None => Err(KernelError::Timeout),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Clear `bits` without waking anyone.
    pub fn event_clear(&self, id: EventId, bits: u32) -> KernelResult<()> {
        let mut st = self.lock();
        let event = st.events.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        event.set &= !bits;
        Ok(())
    }

    /// Current flag set.
    pub fn event_get(&self, id: EventId) -> KernelResult<u32> {
        self.lock()
            .events
            .get(id)
            .map(|e| e.set)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Number of tasks blocked in `event_recv`.
    pub fn event_waiters(&self, id: EventId) -> KernelResult<usize> {
        self.lock()
            .events
            .get(id)
            .map(|e| e.waiters.len())
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn event_set_wake_policy(&self, id: EventId, policy: WakePolicy) -> KernelResult<()> {
        let mut st = self.lock();
        let event = st.events.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if !event.waiters.is_empty() {
            return Err(KernelError::Busy);
        }
        event.waiters.set_policy(policy);
        Ok(())
    }
}
