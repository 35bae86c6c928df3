//! Wait lists of blocking primitives.

use crate::mem::slab::Handle;
use crate::sched::list::{Iter, LinkKind, LinkTable, TaskList};
use crate::sync::event::EventId;
use crate::sync::mailbox::MailboxId;
use crate::sync::mq::MqId;
use crate::sync::mutex::MutexId;
use crate::sync::semaphore::SemaphoreId;
use crate::task::TaskId;

/// Order in which blocked tasks are woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakePolicy {
    /// Arrival order
    #[default]
    Fifo,
    /// Highest priority first, arrival order within a priority
    Priority,
}

/// The primitive a blocked task waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Semaphore(SemaphoreId),
    Mutex(MutexId),
    Event(EventId),
    MailboxSend(MailboxId),
    MailboxRecv(MailboxId),
    MqSend(MqId),
    MqRecv(MqId),
}

impl WaitObject {
    /// Slot index of the underlying object, for log lines.
    pub fn index(self) -> u32 {
        match self {
            WaitObject::Semaphore(id) => id.key().index(),
            WaitObject::Mutex(id) => id.key().index(),
            WaitObject::Event(id) => id.key().index(),
            WaitObject::MailboxSend(id) | WaitObject::MailboxRecv(id) => id.key().index(),
            WaitObject::MqSend(id) | WaitObject::MqRecv(id) => id.key().index(),
        }
    }
}

/// Tasks blocked on one primitive, ordered by its wake policy.
#[derive(Debug)]
pub struct WaitQueue {
    list: TaskList,
    policy: WakePolicy,
}

impl WaitQueue {
    pub const fn new(policy: WakePolicy) -> Self {
        Self {
            list: TaskList::new(LinkKind::Sched),
            policy,
        }
    }

    pub fn policy(&self) -> WakePolicy {
        self.policy
    }

    /// Change the policy. Only valid while nobody waits, which the callers
    /// check.
    pub fn set_policy(&mut self, policy: WakePolicy) {
        debug_assert!(self.list.is_empty());
        self.policy = policy;
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Next task to wake.
    pub fn front(&self) -> Option<TaskId> {
        self.list.front()
    }

    pub fn enqueue<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        match self.policy {
            WakePolicy::Fifo => self.list.push_back(table, id),
            WakePolicy::Priority => self.list.insert_by_priority(table, id),
        }
    }

    pub fn remove<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        self.list.remove(table, id);
    }

    /// Re-sort `id` after its priority changed.
    pub fn reposition<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        if self.policy == WakePolicy::Priority && self.list.contains(table, id) {
            self.list.remove(table, id);
            self.list.insert_by_priority(table, id);
        }
    }

    pub fn iter<'a, T: LinkTable>(&self, table: &'a T) -> Iter<'a, T> {
        self.list.iter(table)
    }

    pub fn contains<T: LinkTable>(&self, table: &T, id: TaskId) -> bool {
        self.list.contains(table, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::list::tests::fake_tasks;
    use alloc::vec::Vec;

    #[test]
    fn test_fifo_ignores_priority() {
        let (mut table, ids) = fake_tasks(&[5, 1, 3]);
        let mut queue = WaitQueue::new(WakePolicy::Fifo);
        for &id in &ids {
            queue.enqueue(&mut table, id);
        }
        assert_eq!(queue.iter(&table).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn test_priority_order() {
        let (mut table, ids) = fake_tasks(&[5, 1, 3, 1]);
        let mut queue = WaitQueue::new(WakePolicy::Priority);
        for &id in &ids {
            queue.enqueue(&mut table, id);
        }
        let order: Vec<_> = queue.iter(&table).collect();
        assert_eq!(order, [ids[1], ids[3], ids[2], ids[0]]);
        assert_eq!(queue.front(), Some(ids[1]));
    }

    #[test]
    fn test_reposition_after_boost() {
        let (mut table, ids) = fake_tasks(&[5, 3]);
        let mut queue = WaitQueue::new(WakePolicy::Priority);
        queue.enqueue(&mut table, ids[0]);
        queue.enqueue(&mut table, ids[1]);
        table.get_mut(ids[0]).unwrap().priority = 1;
        queue.reposition(&mut table, ids[0]);
        assert_eq!(queue.front(), Some(ids[0]));

        queue.remove(&mut table, ids[0]);
        assert!(!queue.contains(&table, ids[0]));
        assert_eq!(queue.len(), 1);
    }
}
