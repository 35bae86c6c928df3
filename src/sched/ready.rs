//! Priority-bitmap ready queue.
//!
//! One FIFO bucket per priority level plus a two-level bitmap of non-empty
//! buckets. Bit `p` is set exactly when bucket `p` holds a task, so picking
//! the next task is two bit scans and a list pop regardless of how many
//! tasks are ready.

use super::bitops::ffs;
use super::list::{LinkKind, LinkTable, TaskList};
use crate::errors::FatalError;
use crate::task::TaskId;
use alloc::vec::Vec;

/// Highest number of priority levels the bitmap can track.
pub const MAX_PRIORITY_LEVELS: usize = 256;

/// Two-level bitmap over up to 256 priorities.
///
/// Each of the eight 32-bit words covers 32 consecutive priorities; bit `g`
/// of `group` is set when word `g` is non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityBitmap {
    group: u32,
    words: [u32; 8],
}

impl PriorityBitmap {
    pub const fn new() -> Self {
        Self { group: 0, words: [0; 8] }
    }

    pub fn set(&mut self, priority: u8) {
        let g = (priority >> 5) as usize;
        self.words[g] |= 1 << (priority & 31);
        self.group |= 1 << g;
    }

    pub fn clear(&mut self, priority: u8) {
        let g = (priority >> 5) as usize;
        self.words[g] &= !(1 << (priority & 31));
        if self.words[g] == 0 {
            self.group &= !(1 << g);
        }
    }

    pub fn is_set(&self, priority: u8) -> bool {
        self.words[(priority >> 5) as usize] & (1 << (priority & 31)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.group == 0
    }

    /// Lowest set priority number, i.e. the highest ready priority.
    pub fn highest(&self) -> Option<u8> {
        if self.group == 0 {
            return None;
        }
        let g = ffs(self.group) - 1;
        let bit = ffs(self.words[g as usize]) - 1;
        Some(((g << 5) + bit) as u8)
    }
}

/// Ready tasks organised by priority.
#[derive(Debug)]
pub struct ReadyQueue {
    buckets: Vec<TaskList>,
    bitmap: PriorityBitmap,
    len: usize,
}

impl ReadyQueue {
    /// Create a queue for priorities `0..levels`.
    pub fn new(levels: usize) -> Self {
        let levels = levels.clamp(1, MAX_PRIORITY_LEVELS);
        Self {
            buckets: (0..levels).map(|_| TaskList::new(LinkKind::Sched)).collect(),
            bitmap: PriorityBitmap::new(),
            len: 0,
        }
    }

    pub fn levels(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of ready tasks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bitmap(&self) -> &PriorityBitmap {
        &self.bitmap
    }

    /// Number of ready tasks at `priority`.
    pub fn bucket_len(&self, priority: u8) -> usize {
        self.buckets
            .get(priority as usize)
            .map_or(0, |bucket| bucket.len())
    }

    /// Append `id` to the tail of its priority bucket.
    pub fn push_back<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        let priority = table.priority(id);
        if let Some(bucket) = self.buckets.get_mut(priority as usize) {
            bucket.push_back(table, id);
            self.bitmap.set(priority);
            self.len += 1;
        }
    }

    /// Put `id` at the head of its bucket so it keeps its round-robin turn.
    pub fn push_front<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        let priority = table.priority(id);
        if let Some(bucket) = self.buckets.get_mut(priority as usize) {
            bucket.push_front(table, id);
            self.bitmap.set(priority);
            self.len += 1;
        }
    }

    /// Unlink `id` from the bucket of its current priority.
    pub fn remove<T: LinkTable>(&mut self, table: &mut T, id: TaskId) {
        let priority = table.priority(id);
        if let Some(bucket) = self.buckets.get_mut(priority as usize) {
            bucket.remove(table, id);
            if bucket.is_empty() {
                self.bitmap.clear(priority);
            }
            self.len -= 1;
        }
    }

    /// Highest priority with a ready task.
    pub fn highest_priority(&self) -> Option<u8> {
        self.bitmap.highest()
    }

    /// Pop the head of the highest-priority non-empty bucket.
    ///
    /// A bitmap bit without a matching task is reported as corruption.
    pub fn pop_highest<T: LinkTable>(&mut self, table: &mut T) -> Result<Option<TaskId>, FatalError> {
        let Some(priority) = self.bitmap.highest() else {
            return Ok(None);
        };
        let bucket = self
            .buckets
            .get_mut(priority as usize)
            .ok_or(FatalError::ReadyQueueCorrupted { priority })?;
        let id = bucket
            .pop_front(table)
            .ok_or(FatalError::ReadyQueueCorrupted { priority })?;
        if bucket.is_empty() {
            self.bitmap.clear(priority);
        }
        self.len -= 1;
        Ok(Some(id))
    }

    /// Whether `id` is queued. O(n); used by checks and tests.
    pub fn contains<T: LinkTable>(&self, table: &T, id: TaskId) -> bool {
        let priority = table.priority(id);
        self.buckets
            .get(priority as usize)
            .map_or(false, |bucket| bucket.contains(table, id))
    }

    /// Iterate the ready tasks of one priority, head first.
    pub fn bucket_iter<'a, T: LinkTable>(
        &self,
        table: &'a T,
        priority: u8,
    ) -> impl Iterator<Item = TaskId> + 'a {
        let head = self.buckets.get(priority as usize).and_then(|b| b.front());
        core::iter::successors(head, move |&id| table.link(id, LinkKind::Sched).next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::list::tests::fake_tasks;
    use proptest::prelude::*;

    #[test]
    fn test_bitmap_highest() {
        let mut bitmap = PriorityBitmap::new();
        assert_eq!(bitmap.highest(), None);
        bitmap.set(200);
        bitmap.set(9);
        bitmap.set(31);
        assert_eq!(bitmap.highest(), Some(9));
        bitmap.clear(9);
        assert_eq!(bitmap.highest(), Some(31));
        bitmap.clear(31);
        assert_eq!(bitmap.highest(), Some(200));
        assert!(bitmap.is_set(200));
        bitmap.clear(200);
        assert!(bitmap.is_empty());
    }

    #[test]
    fn test_bitmap_shared_word() {
        let mut bitmap = PriorityBitmap::new();
        bitmap.set(32);
        bitmap.set(63);
        bitmap.clear(32);
        assert_eq!(bitmap.highest(), Some(63));
        assert!(!bitmap.is_empty());
        bitmap.set(255);
        bitmap.clear(63);
        assert_eq!(bitmap.highest(), Some(255));
    }

    #[test]
    fn test_round_robin_within_bucket() {
        let (mut table, ids) = fake_tasks(&[3, 3, 3]);
        let mut rq = ReadyQueue::new(32);
        for &id in &ids {
            rq.push_back(&mut table, id);
        }
        assert_eq!(rq.pop_highest(&mut table), Ok(Some(ids[0])));
        rq.push_back(&mut table, ids[0]);
        assert_eq!(rq.pop_highest(&mut table), Ok(Some(ids[1])));
        assert_eq!(rq.pop_highest(&mut table), Ok(Some(ids[2])));
        assert_eq!(rq.pop_highest(&mut table), Ok(Some(ids[0])));
        assert_eq!(rq.pop_highest(&mut table), Ok(None));
        assert!(rq.bitmap().is_empty());
    }

    #[test]
    fn test_remove_clears_bit() {
        let (mut table, ids) = fake_tasks(&[4, 7]);
        let mut rq = ReadyQueue::new(8);
        rq.push_back(&mut table, ids[0]);
        rq.push_back(&mut table, ids[1]);
        rq.remove(&mut table, ids[0]);
        assert!(!rq.bitmap().is_set(4));
        assert_eq!(rq.highest_priority(), Some(7));
        assert_eq!(rq.len(), 1);
    }

    #[test]
    fn test_push_front_keeps_turn() {
        let (mut table, ids) = fake_tasks(&[2, 2]);
        let mut rq = ReadyQueue::new(8);
        rq.push_back(&mut table, ids[1]);
        rq.push_front(&mut table, ids[0]);
        let order: alloc::vec::Vec<_> = rq.bucket_iter(&table, 2).collect();
        assert_eq!(order, [ids[0], ids[1]]);
    }

    proptest! {
        /// Whatever is queued, the pick always comes from the lowest-numbered
        /// non-empty bucket, and the bitmap mirrors bucket occupancy.
        #[test]
        fn pick_is_always_highest_priority(
            priorities in proptest::collection::vec(0u8..64, 1..40),
            pops in 0usize..40,
        ) {
            let (mut table, ids) = fake_tasks(&priorities);
            let mut rq = ReadyQueue::new(64);
            for &id in &ids {
                rq.push_back(&mut table, id);
            }

            for _ in 0..pops.min(ids.len()) {
                let best = (0u8..64).find(|&p| rq.bucket_len(p) > 0);
                let picked = rq.pop_highest(&mut table).unwrap().unwrap();
                prop_assert_eq!(Some(table.priority(picked)), best);
                for p in 0u8..64 {
                    prop_assert_eq!(rq.bitmap().is_set(p), rq.bucket_len(p) > 0);
                }
            }
        }
    }
}
