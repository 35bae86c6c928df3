//! Fixed-capacity mailbox of machine words.
//!
//! Words move by handoff where possible: a send with a receiver waiting
//! goes straight to that receiver, and a receive that frees a slot pulls in
//! the word of the first blocked sender.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mem::slab::kernel_handle;
use crate::sync::wait::{WaitObject, WaitQueue, WakePolicy};
use crate::time::Timeout;
use alloc::collections::VecDeque;
use log::warn;

kernel_handle!(
    /// Handle of a mailbox.
    MailboxId
);

pub(crate) struct MailboxState {
    pub(crate) capacity: usize,
    pub(crate) slots: VecDeque<usize>,
    pub(crate) senders: WaitQueue,
    pub(crate) receivers: WaitQueue,
}

impl<A: Port> Kernel<A> {
    /// Create a mailbox holding up to `capacity` words.
    pub fn mailbox_create(&self, capacity: usize, policy: WakePolicy) -> KernelResult<MailboxId> {
        if capacity == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let state = MailboxState {
            capacity,
            slots: VecDeque::with_capacity(capacity),
            senders: WaitQueue::new(policy),
            receivers: WaitQueue::new(policy),
        };
        self.lock()
            .mailboxes
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy a mailbox. Blocked senders and receivers wake with
    /// `Destroyed`; queued words are dropped.
    pub fn mailbox_destroy(&self, id: MailboxId) -> KernelResult<()> {
        let mut st = self.lock();
        if !st.mailboxes.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let woken = st.wake_all(WaitObject::MailboxSend(id), Err(KernelError::Destroyed))
            + st.wake_all(WaitObject::MailboxRecv(id), Err(KernelError::Destroyed));
        if woken > 0 {
            warn!(target: "mailbox", "mailbox {} destroyed with {} waiters", id, woken);
        }
        st.mailboxes.remove(id);
        self.reschedule(st);
        Ok(())
    }

    /// Send a word, blocking up to `timeout` while the mailbox is full.
    /// With [`Timeout::NoWait`] this is safe from interrupt handlers.
    pub fn mailbox_send(&self, id: MailboxId, value: usize, timeout: Timeout) -> KernelResult<()> {
        let timeout = timeout.validate()?;
        let mut st = self.lock();
        let mailbox = st.mailboxes.get_mut(id).ok_or(KernelError::InvalidArgument)?;

        if let Some(receiver) = mailbox.receivers.front() {
            if let Some(task) = st.tasks.get_mut(receiver) {
                task.message = value;
            }
            st.unblock(receiver, Ok(()));
            self.reschedule(st);
            return Ok(());
        }
        if mailbox.slots.len() < mailbox.capacity {
            mailbox.slots.push_back(value);
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Full);
        }

        let current = self.blocking_context(&st)?;
        if let Some(task) = st.tasks.get_mut(current) {
            task.message = value;
        }
        self.block_and_wait(st, Some(WaitObject::MailboxSend(id)), timeout)
    }

    /// Receive the oldest word, blocking up to `timeout` while empty.
    pub fn mailbox_recv(&self, id: MailboxId, timeout: Timeout) -> KernelResult<usize> {
        let timeout = timeout.validate()?;
        let mut st = self.lock();
        let state = &mut *st;
        let mailbox = state.mailboxes.get_mut(id).ok_or(KernelError::InvalidArgument)?;

        if let Some(value) = mailbox.slots.pop_front() {
            if let Some(sender) = mailbox.senders.front() {
                if let Some(word) = state.tasks.get(sender).map(|t| t.message) {
                    mailbox.slots.push_back(word);
                }
                st.unblock(sender, Ok(()));
                self.reschedule(st);
            }
            return Ok(value);
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Empty);
        }

        let current = self.blocking_context(&st)?;
        self.block_and_wait(st, Some(WaitObject::MailboxRecv(id)), timeout)?;
        self.lock()
            .tasks
            .get(current)
            .map(|t| t.message)
            .ok_or(KernelError::InvalidState)
    }

    /// Drop every queued word. Blocked senders and receivers wake with
    /// `Destroyed`, as if the mailbox had been recreated under them.
    pub fn mailbox_reset(&self, id: MailboxId) -> KernelResult<()> {
        let mut st = self.lock();
        let mailbox = st.mailboxes.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        mailbox.slots.clear();
        st.wake_all(WaitObject::MailboxSend(id), Err(KernelError::Destroyed));
        st.wake_all(WaitObject::MailboxRecv(id), Err(KernelError::Destroyed));
        self.reschedule(st);
        Ok(())
    }

    /// Number of words queued.
    pub fn mailbox_len(&self, id: MailboxId) -> KernelResult<usize> {
        self.mailbox_query(id, |m| m.slots.len())
    }

    /// Number of free slots.
    pub fn mailbox_unused(&self, id: MailboxId) -> KernelResult<usize> {
        self.mailbox_query(id, |m| m.capacity - m.slots.len())
    }

    pub fn mailbox_capacity(&self, id: MailboxId) -> KernelResult<usize> {
        self.mailbox_query(id, |m| m.capacity)
    }

    pub fn mailbox_is_empty(&self, id: MailboxId) -> KernelResult<bool> {
        self.mailbox_query(id, |m| m.slots.is_empty())
    }

    pub fn mailbox_is_full(&self, id: MailboxId) -> KernelResult<bool> {
        self.mailbox_query(id, |m| m.slots.len() == m.capacity)
    }

    /// Change the wake order of both directions. Refused while tasks wait.
    pub fn mailbox_set_wake_policy(&self, id: MailboxId, policy: WakePolicy) -> KernelResult<()> {
        let mut st = self.lock();
        let mailbox = st.mailboxes.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if !mailbox.senders.is_empty() || !mailbox.receivers.is_empty() {
            return Err(KernelError::Busy);
        }
        mailbox.senders.set_policy(policy);
        mailbox.receivers.set_policy(policy);
        Ok(())
    }

    fn mailbox_query<T>(&self, id: MailboxId, f: impl FnOnce(&MailboxState) -> T) -> KernelResult<T> {
        self.lock().mailboxes.get(id).map(f).ok_or(KernelError::InvalidArgument)
    }
}
