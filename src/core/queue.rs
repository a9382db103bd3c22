use crate::sync::Mutex;

use std::collections::VecDeque;

use super::job::JobRef;

/// The per-category queue of pending jobs.
pub type JobQueue = ConcurrentQueue<JobRef>;

/// A mutual-exclusion protected FIFO.
///
/// `enqueue` and `dequeue` serialize against each other, but dequeuing from an
/// empty queue returns `None` immediately instead of blocking. Idle waiting is
/// expressed explicitly through `Signal`, never inside the queue.
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        ConcurrentQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
    }

    pub fn dequeue(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        let items = self.items.lock().unwrap();
        items.is_empty()
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        ConcurrentQueue::new()
    }
}
