//! Message queues of variable-length byte messages.
//!
//! A queue holds up to `depth` messages of at most `max_msg_size` bytes each.
//! Urgent messages go to the head. As with mailboxes, a message is handed
//! straight to a waiting receiver, and a receive that frees a slot pulls in
//! the message of the first blocked sender.

use crate::arch::Port;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mem::slab::kernel_handle;
use crate::sync::wait::{WaitObject, WaitQueue, WakePolicy};
use crate::time::Timeout;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{error, warn};

kernel_handle!(
    /// Handle of a message queue.
    MqId
);

/// A message parked on a blocked task until it can be queued or delivered.
pub(crate) struct Parcel {
    pub(crate) data: Vec<u8>,
    pub(crate) urgent: bool,
}

pub(crate) struct MqState {
    max_msg_size: usize,
    depth: usize,
    messages: VecDeque<Vec<u8>>,
    pub(crate) senders: WaitQueue,
    pub(crate) receivers: WaitQueue,
}

impl MqState {
    fn put(&mut self, parcel: Parcel) {
        if parcel.urgent {
            self.messages.push_front(parcel.data);
        } else {
            self.messages.push_back(parcel.data);
        }
    }
}

/// Copy a message into the caller's buffer. A message that does not fit is
/// dropped.
fn deliver(message: Vec<u8>, buffer: &mut [u8]) -> KernelResult<usize> {
    match buffer.get_mut(..message.len()) {
        Some(dst) => {
            dst.copy_from_slice(&message);
            Ok(message.len())
        }
        None => {
            error!(
                target: "mq",
                "receive buffer of {} bytes too small for a {} byte message",
                buffer.len(),
                message.len()
            );
            Err(KernelError::ResourceExhausted)
        }
    }
}

impl<A: Port> Kernel<A> {
    /// Create a queue of `depth` messages of up to `max_msg_size` bytes.
    pub fn mq_create(&self, max_msg_size: usize, depth: usize, policy: WakePolicy) -> KernelResult<MqId> {
        if max_msg_size == 0 || depth == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let state = MqState {
            max_msg_size,
            depth,
            messages: VecDeque::with_capacity(depth),
            senders: WaitQueue::new(policy),
            receivers: WaitQueue::new(policy),
        };
        self.lock()
            .queues
            .insert(state)
            .map_err(|_| KernelError::ResourceExhausted)
    }

    /// Destroy a queue. Blocked senders and receivers wake with `Destroyed`.
    pub fn mq_destroy(&self, id: MqId) -> KernelResult<()> {
        let mut st = self.lock();
        if !st.queues.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let woken = st.wake_all(WaitObject::MqSend(id), Err(KernelError::Destroyed))
            + st.wake_all(WaitObject::MqRecv(id), Err(KernelError::Destroyed));
        if woken > 0 {
            warn!(target: "mq", "message queue {} destroyed with {} waiters", id, woken);
        }
        st.queues.remove(id);
        self.reschedule(st);
        Ok(())
    }

    /// Append a message, blocking up to `timeout` while the queue is full.
    /// With [`Timeout::NoWait`] this is safe from interrupt handlers.
    ///
    /// # Returns
    ///
    /// `InvalidArgument` for an empty or oversized message, `Full` on
    /// [`Timeout::NoWait`] with no free slot.
    pub fn mq_send(&self, id: MqId, message: &[u8], timeout: Timeout) -> KernelResult<()> {
        self.mq_put(id, message, timeout, false)
    }

    /// Like [`mq_send`](Self::mq_send), but the message goes to the head
    /// of the queue.
    pub fn mq_send_urgent(&self, id: MqId, message: &[u8], timeout: Timeout) -> KernelResult<()> {
        self.mq_put(id, message, timeout, true)
    }

    fn mq_put(&self, id: MqId, message: &[u8], timeout: Timeout, urgent: bool) -> KernelResult<()> {
        let timeout = timeout.validate()?;
        let mut st = self.lock();
        let state = &mut *st;
        let mq = state.queues.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if message.is_empty() || message.len() > mq.max_msg_size {
            return Err(KernelError::InvalidArgument);
        }
        let parcel = Parcel {
            data: message.to_vec(),
            urgent,
        };

        if let Some(receiver) = mq.receivers.front() {
            if let Some(task) = state.tasks.get_mut(receiver) {
                task.parcel = Some(parcel);
            }
            st.unblock(receiver, Ok(()));
            self.reschedule(st);
            return Ok(());
        }
        if mq.messages.len() < mq.depth {
            mq.put(parcel);
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Full);
        }

        let current = self.blocking_context(&st)?;
        if let Some(task) = st.tasks.get_mut(current) {
            task.parcel = Some(parcel);
        }
        let result = self.block_and_wait(st, Some(WaitObject::MqSend(id)), timeout);
        if result.is_err() {
            if let Some(task) = self.lock().tasks.get_mut(current) {
                task.parcel = None;
            }
        }
        result
    }

    /// Receive the head message into `buffer`, blocking up to `timeout`
    /// while the queue is empty. Returns the message length.
    ///
    /// # Returns
    ///
    /// `Empty` on [`Timeout::NoWait`] with nothing queued,
    /// `ResourceExhausted` when the message is longer than `buffer`; the
    /// message is dropped in that case.
    pub fn mq_recv(&self, id: MqId, buffer: &mut [u8], timeout: Timeout) -> KernelResult<usize> {
        let timeout = timeout.validate()?;
        let mut st = self.lock();
        let state = &mut *st;
        let mq = state.queues.get_mut(id).ok_or(KernelError::InvalidArgument)?;

        let message = match mq.messages.pop_front() {
            Some(message) => {
                if let Some(sender) = mq.senders.front() {
                    if let Some(parcel) = state.tasks.get_mut(sender).and_then(|t| t.parcel.take()) {
                        mq.put(parcel);
                    }
                    st.unblock(sender, Ok(()));
                    self.reschedule(st);
                }
                message
            }
            None => {
                if timeout.is_no_wait() {
                    return Err(KernelError::Empty);
                }
                let current = self.blocking_context(&st)?;
                self.block_and_wait(st, Some(WaitObject::MqRecv(id)), timeout)?;
                let parcel = self
                    .lock()
                    .tasks
                    .get_mut(current)
                    .and_then(|t| t.parcel.take());
                parcel.map(|p| p.data).ok_or(KernelError::InvalidState)?
            }
        };
        deliver(message, buffer)
    }

    /// Drop every queued message. Blocked senders and receivers wake with
    /// `Destroyed`.
    pub fn mq_reset(&self, id: MqId) -> KernelResult<()> {
        let mut st = self.lock();
        let mq = st.queues.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        mq.messages.clear();
        st.wake_all(WaitObject::MqSend(id), Err(KernelError::Destroyed));
        st.wake_all(WaitObject::MqRecv(id), Err(KernelError::Destroyed));
        self.reschedule(st);
        Ok(())
    }

    /// Number of queued messages.
    pub fn mq_len(&self, id: MqId) -> KernelResult<usize> {
        self.mq_query(id, |mq| mq.messages.len())
    }

    pub fn mq_unused(&self, id: MqId) -> KernelResult<usize> {
        self.mq_query(id, |mq| mq.depth - mq.messages.len())
    }

    pub fn mq_depth(&self, id: MqId) -> KernelResult<usize> {
        self.mq_query(id, |mq| mq.depth)
    }

    pub fn mq_max_msg_size(&self, id: MqId) -> KernelResult<usize> {
        self.mq_query(id, |mq| mq.max_msg_size)
    }

    pub fn mq_is_empty(&self, id: MqId) -> KernelResult<bool> {
        self.mq_query(id, |mq| mq.messages.is_empty())
    }

    pub fn mq_is_full(&self, id: MqId) -> KernelResult<bool> {
        self.mq_query(id, |mq| mq.messages.len() == mq.depth)
    }

    /// Change the wake order of both directions. Refused while tasks wait.
    pub fn mq_set_wake_policy(&self, id: MqId, policy: WakePolicy) -> KernelResult<()> {
        let mut st = self.lock();
        let mq = st.queues.get_mut(id).ok_or(KernelError::InvalidArgument)?;
        if !mq.senders.is_empty() || !mq.receivers.is_empty() {
            return Err(KernelError::Busy);
        }
        mq.senders.set_policy(policy);
        mq.receivers.set_policy(policy);
        Ok(())
    }

    fn mq_query<T>(&self, id: MqId, f: impl FnOnce(&MqState) -> T) -> KernelResult<T> {
        self.lock().queues.get(id).map(f).ok_or(KernelError::InvalidArgument)
    }
}
