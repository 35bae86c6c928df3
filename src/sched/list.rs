//! Doubly-linked task lists threaded through the task table.
//!
//! The links live inside each TCB (one pair per [`LinkKind`]) and the list
//! head only stores the two ends, so insert, remove and membership updates
//! are O(1) without the list owning its tasks. A task may be on at most one
//! list per link kind at a time.

use crate::task::TaskId;

/// Previous/next pointers of one list membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<TaskId>,
    pub next: Option<TaskId>,
}

/// Which link pair of a TCB a list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Ready buckets and primitive wait lists
    Sched,
    /// The timeout queue
    Tick,
}

/// Access to the link fields of a task table.
pub trait LinkTable {
    /// Links of `id` for `kind`; unknown tasks read as unlinked.
    fn link(&self, id: TaskId, kind: LinkKind) -> Link;

    /// Overwrite the links of `id`; unknown tasks are ignored.
    fn set_link(&mut self, id: TaskId, kind: LinkKind, link: Link);

    /// Effective priority of `id` (0 is highest).
    fn priority(&self, id: TaskId) -> u8;
}

/// Head of an intrusive task list.
#[derive(Debug)]
pub struct TaskList {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
    kind: LinkKind,
}

impl TaskList {
    pub const fn new(kind: LinkKind) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn front(&self) -> Option<TaskId> {
        self.head
    }

    pub fn back(&self) -> Option<TaskId> {
        self.tail
    }

    pub fn push_back<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        let link = Link {
            prev: self.tail,
            next: None,
        };
        table.set_link(id, self.kind, link);
        match self.tail {
            Some(tail) => {
                let mut tail_link = table.link(tail, self.kind);
                tail_link.next = Some(id);
                table.set_link(tail, self.kind, tail_link);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn push_front<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        match self.head {
            Some(head) => self.insert_before(table, head, id),
            None => self.push_back(table, id),
        }
    }

    /// Link `id` immediately before `at`, which must be on this list.
    pub fn insert_before<T: LinkTable>(&mut self, table: &mut T, at: TaskId, id: TaskId) {
        let mut at_link = table.link(at, self.kind);
        let prev = at_link.prev;

        table.set_link(id, self.kind, Link { prev, next: Some(at) });
        at_link.prev = Some(id);
        table.set_link(at, self.kind, at_link);

        match prev {
            Some(prev) => {
                let mut prev_link = table.link(prev, self.kind);
                prev_link.next = Some(id);
                table.set_link(prev, self.kind, prev_link);
            }
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    /// Insert keeping the list sorted: `id` goes before the first task for
    /// which `goes_before(id, task)` holds, after every task it ties with.
    pub fn insert_sorted<T, F>(&mut self, table: &mut T, id: TaskId, goes_before: F)
    where
        T: LinkTable,
        F: Fn(&T, TaskId, TaskId) -> bool,
    {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if goes_before(table, id, node) {
                self.insert_before(table, node, id);
                return;
            }
            cursor = table.link(node, self.kind).next;
        }
        self.push_back(table, id);
    }

    /// Insert in priority order, FIFO among equal priorities.
    pub fn insert_by_priority<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        self.insert_sorted(table, id, |t, new, node| t.priority(new) < t.priority(node));
    }

    /// Unlink `id`, which must be on this list.
    pub fn remove<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        let link = table.link(id, self.kind);

        match link.prev {
            Some(prev) => {
                let mut prev_link = table.link(prev, self.kind);
                prev_link.next = link.next;
                table.set_link(prev, self.kind, prev_link);
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                let mut next_link = table.link(next, self.kind);
                next_link.prev = link.prev;
                table.set_link(next, self.kind, next_link);
            }
            None => self.tail = link.prev,
        }

        table.set_link(id, self.kind, Link::default());
        self.len -= 1;
    }

    pub fn pop_front<T: LinkTable>(&mut self, table: &mut T) -> Option<TaskId> {
        let head = self.head?;
        self.remove(table, head);
        Some(head)
    }

    /// Task following `id` on this list.
    pub fn next_of<T: LinkTable>(&self, table: &T, id: TaskId) -> Option<TaskId> {
        table.link(id, self.kind).next
    }

    /// Walk the list front to back.
    pub fn iter<'a, T: LinkTable>(&self, table: &'a T) -> Iter<'a, T> {
        Iter {
            table,
            cursor: self.head,
            kind: self.kind,
        }
    }

    /// Whether `id` is on this list. O(n); used by checks and tests.
    pub fn contains<T: LinkTable>(&self, table: &T, id: TaskId) -> bool {
        self.iter(table).any(|t| t == id)
    }
}

/// Iterator over a [`TaskList`].
pub struct Iter<'a, T> {
    table: &'a T,
    cursor: Option<TaskId>,
    kind: LinkKind,
}

impl<'a, T: LinkTable> Iterator for Iter<'a, T> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.cursor?;
        self.cursor = self.table.link(id, self.kind).next;
        Some(id)
    }
}
