//! Timeout queue for blocked and sleeping tasks.
//!
//! Tasks are kept sorted by absolute expiry tick through their tick links, so
//! the tick handler only ever looks at the head.

use super::{tick_after, tick_reached, Tick};
use crate::sched::list::{LinkKind, LinkTable, TaskList};
use crate::task::TaskId;

/// Task tables that record a wake-up deadline per task.
pub trait DeadlineTable: LinkTable {
    fn deadline(&self, id: TaskId) -> Tick;
    fn set_deadline(&mut self, id: TaskId, deadline: Tick);
}

/// Tasks waiting for a deadline, earliest first.
#[derive(Debug)]
pub struct TickQueue {
    list: TaskList,
}

impl TickQueue {
    pub const fn new() -> Self {
        Self {
            list: TaskList::new(LinkKind::Tick),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Queue `id` to expire at `deadline`. Equal deadlines expire in
    /// insertion order.
    pub fn insert<T: DeadlineTable>(&mut self, table: &mut T, id: TaskId, deadline: Tick) {
        table.set_deadline(id, deadline);
        self.list.insert_sorted(table, id, |t, new, node| {
            tick_after(t.deadline(node), t.deadline(new))
        });
    }

    pub fn remove<T: DeadlineTable>(&mut self, table: &mut T, id: TaskId) {
        self.list.remove(table, id);
    }

    /// Pop the head if its deadline has been reached at `now`.
    pub fn pop_expired<T: DeadlineTable>(&mut self, table: &mut T, now: Tick) -> Option<TaskId> {
        let head = self.list.front()?;
        if tick_reached(table.deadline(head), now) {
            self.list.remove(table, head);
            Some(head)
        } else {
            None
        }
    }

    /// Ticks until the earliest deadline, `None` when nothing is queued.
    pub fn next_expiry<T: DeadlineTable>(&self, table: &T, now: Tick) -> Option<Tick> {
        let head = self.list.front()?;
        let deadline = table.deadline(head);
        Some(if tick_after(deadline, now) {
            deadline.wrapping_sub(now)
        } else {
            0
        })
    }

    pub fn contains<T: LinkTable>(&self, table: &T, id: TaskId) -> bool {
        self.list.contains(table, id)
    }
}

impl Default for TickQueue {
    fn default() -> Self {
        Self::new()
    }
}
