//! Software timers driven by the kernel tick.
//!
//! Active timers sit in a list sorted by expiry, so each tick only looks at
//! the front. A timer either runs a callback (in tick interrupt context,
//! after the kernel lock is released) or, for delayed work, queues its work
//! item directly under the lock.

use super::{tick_after, tick_reached, Tick, Timeout};
use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelState};
use crate::mem::slab::{kernel_handle, Slab};
use crate::workqueue::WorkId;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;

kernel_handle!(
    /// Handle of a software timer.
    TimerId
);

/// Timer callback. Runs in interrupt context: it may post, send or submit
/// work but must not block.
pub type TimerCallback<A> = Arc<dyn Fn(&Kernel<A>) + Send + Sync + 'static>;

pub(crate) enum TimerAction<A: Port> {
    Callback(TimerCallback<A>),
    /// Expiry of a delayed work submission
    SubmitWork(WorkId),
}

impl<A: Port> Clone for TimerAction<A> {
    fn clone(&self) -> Self {
        match self {
            TimerAction::Callback(cb) => TimerAction::Callback(cb.clone()),
            TimerAction::SubmitWork(work) => TimerAction::SubmitWork(*work),
        }
    }
}

pub(crate) struct Timer<A: Port> {
    pub(crate) name: String,
    action: TimerAction<A>,
    /// Period, or delay for one-shot timers
    pub(crate) period: Tick,
    pub(crate) periodic: bool,
    active: bool,
    deadline: Tick,
}

/// All software timers plus the sorted list of armed ones.
pub(crate) struct TimerTable<A: Port> {
    timers: Slab<TimerId, Timer<A>>,
    active: Vec<TimerId>,
}

impl<A: Port> TimerTable<A> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            timers: Slab::with_limit(limit),
            active: Vec::new(),
        }
    }

    pub(crate) fn create(
        &mut self,
        name: String,
        period: Tick,
        periodic: bool,
        action: TimerAction<A>,
    ) -> KernelResult<TimerId> {
        let timer = Timer {
            name,
            action,
            period,
            periodic,
            active: false,
            deadline: 0,
        };
        self.timers.insert(timer).map_err(|_| KernelError::ResourceExhausted)
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<Timer<A>> {
        self.stop(id);
        self.timers.remove(id)
    }

    pub(crate) fn get(&self, id: TimerId) -> Option<&Timer<A>> {
        self.timers.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: TimerId) -> Option<&mut Timer<A>> {
        self.timers.get_mut(id)
    }

    /// Arm (or re-arm) a timer to expire one period from `now`.
    pub(crate) fn start(&mut self, id: TimerId, now: Tick) -> KernelResult<()> {
        self.stop(id);
        let timer = self.timers.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        timer.deadline = now.wrapping_add(timer.period);
        timer.active = true;
        let deadline = timer.deadline;
        self.insert_sorted(id, deadline);
        Ok(())
    }

    fn insert_sorted(&mut self, id: TimerId, deadline: Tick) {
        let timers = &self.timers;
        let position = self
            .active
            .iter()
            .position(|&other| timers.get(other).map_or(false, |t| tick_after(t.deadline, deadline)))
            .unwrap_or(self.active.len());
        self.active.insert(position, id);
    }

    /// Disarm a timer. Returns whether it was armed.
    pub(crate) fn stop(&mut self, id: TimerId) -> bool {
        match self.timers.get_mut(id) {
            Some(timer) if timer.active => {
                timer.active = false;
                self.active.retain(|&t| t != id);
                true
            }
            _ => false,
        }
    }

    /// Pop every timer due at `now`, re-arming periodic ones.
    pub(crate) fn expire(&mut self, now: Tick) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(&id) = self.active.first() {
            let due = self.timers.get(id).map_or(true, |t| tick_reached(t.deadline, now));
            if !due {
                break;
            }
            self.active.remove(0);
            if let Some(timer) = self.timers.get_mut(id) {
                if timer.periodic {
                    let mut next = timer.deadline.wrapping_add(timer.period);
                    if tick_reached(next, now) {
                        next = now.wrapping_add(timer.period);
                    }
                    timer.deadline = next;
                    self.insert_sorted(id, next);
                } else {
                    timer.active = false;
                }
                fired.push(id);
            }
        }
        fired
    }

    /// Ticks until the earliest armed timer.
    pub(crate) fn next_expiry(&self, now: Tick) -> Option<Tick> {
        let first = self.active.first().and_then(|&id| self.timers.get(id))?;
        Some(if tick_reached(first.deadline, now) {
            0
        } else {
            first.deadline.wrapping_sub(now)
        })
    }

    pub(crate) fn remaining(&self, id: TimerId, now: Tick) -> Option<Tick> {
        let timer = self.timers.get(id).filter(|t| t.active)?;
        Some(if tick_reached(timer.deadline, now) {
            0
        } else {
            timer.deadline.wrapping_sub(now)
        })
    }

    pub(crate) fn is_active(&self, id: TimerId) -> Option<bool> {
        self.timers.get(id).map(|t| t.active)
    }
}

impl<A: Port> KernelState<A> {
    /// Fire due timers: delayed work is queued here, callbacks are returned
    /// for the caller to run once the lock is gone.
    pub(crate) fn expire_timers(&mut self, now: Tick) -> Vec<TimerCallback<A>> {
        let mut callbacks = Vec::new();
        for id in self.timers.expire(now) {
            match self.timers.get(id).map(|t| t.action.clone()) {
                Some(TimerAction::Callback(callback)) => callbacks.push(callback),
                Some(TimerAction::SubmitWork(work)) => self.work_delay_expired(work),
                None => {}
            }
        }
        callbacks
    }
}

fn check_period(ticks: Tick) -> KernelResult<Tick> {
    match Timeout::ticks(ticks)? {
        Timeout::Ticks(t) => Ok(t),
        _ => Err(KernelError::InvalidArgument),
    }
}

impl<A: Port> Kernel<A> {
    /// Create a stopped timer that calls `callback` `timeout` ticks after
    /// each start, and then every `timeout` ticks if `periodic`.
    pub fn timer_create<F>(&self, name: &str, timeout: Tick, periodic: bool, callback: F) -> KernelResult<TimerId>
    where
        F: Fn(&Kernel<A>) + Send + Sync + 'static,
    {
        let period = check_period(timeout)?;
        let mut st = self.lock();
        let id = st.timers.create(
            String::from(name),
            period,
            periodic,
            TimerAction::Callback(Arc::new(callback)),
        )?;
        debug!(target: "timer", "created {} ({}) period {}", name, id, period);
        Ok(id)
    }

    pub fn timer_destroy(&self, id: TimerId) -> KernelResult<()> {
        let mut st = self.lock();
        match st.timers.get(id) {
            Some(timer) if matches!(timer.action, TimerAction::Callback(_)) => {}
            _ => return Err(KernelError::InvalidArgument),
        }
        st.timers.remove(id);
        Ok(())
    }

    /// Arm the timer relative to the current tick, restarting it if armed.
    pub fn timer_start(&self, id: TimerId) -> KernelResult<()> {
        let mut st = self.lock();
        st.timers.start(id, self.tick_get())
    }

    /// Disarm the timer. Stopping a stopped timer is `InvalidState`.
    pub fn timer_stop(&self, id: TimerId) -> KernelResult<()> {
        let mut st = self.lock();
        match st.timers.is_active(id) {
            None => Err(KernelError::InvalidArgument),
            Some(false) => Err(KernelError::InvalidState),
            Some(true) => {
                st.timers.stop(id);
                Ok(())
            }
        }
    }

    /// Change the period. An armed timer restarts with the new value.
    pub fn timer_set_timeout(&self, id: TimerId, timeout: Tick) -> KernelResult<()> {
        let period = check_period(timeout)?;
        let mut st = self.lock();
        let timer = st.timers.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        timer.period = period;
        if st.timers.is_active(id) == Some(true) {
            st.timers.start(id, self.tick_get())?;
        }
        Ok(())
    }

    /// Ticks left before an armed timer fires, `None` when stopped.
    pub fn timer_remaining(&self, id: TimerId) -> KernelResult<Option<Tick>> {
        let st = self.lock();
        if st.timers.get(id).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(st.timers.remaining(id, self.tick_get()))
    }

    pub fn timer_name(&self, id: TimerId) -> KernelResult<String> {
        self.lock()
            .timers
            .get(id)
            .map(|t| t.name.clone())
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn timer_is_active(&self, id: TimerId) -> KernelResult<bool> {
        self.lock().timers.is_active(id).ok_or(KernelError::InvalidArgument)
    }

    pub fn timer_set_oneshot(&self, id: TimerId) -> KernelResult<()> {
        self.set_timer_periodic(id, false)
    }

    pub fn timer_set_periodic(&self, id: TimerId) -> KernelResult<()> {
        self.set_timer_periodic(id, true)
    }

    fn set_timer_periodic(&self, id: TimerId, periodic: bool) -> KernelResult<()> {
        let mut st = self.lock();
        let timer = st.timers.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        timer.periodic = periodic;
        Ok(())
    }
}
