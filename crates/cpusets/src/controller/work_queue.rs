//! Bounded FIFO work queue with de-duplication.
//!
//! An item that is already queued or being processed is not queued again.
//! Producers wait while the queue is full; consumers wait while it is empty.
//! After [`WorkQueue::shut_down`] no new items are accepted, and consumers
//! drain what is left before [`WorkQueue::get`] returns `None`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub(crate) struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `item`, waiting for room when the queue is full.
    ///
    /// Returns `false` if the item was dropped because it is already pending
    /// or the queue is shutting down.
    pub(crate) async fn add(&self, item: K) -> bool {
        loop {
            let space_ready = self.space_ready.notified();
            {
                let mut state = self.lock();
                if state.shutting_down
                    || state.queued.contains(&item)
                    || state.processing.contains(&item)
                {
                    return false;
                }
                if state.queue.len() < self.capacity {
                    state.queued.insert(item.clone());
                    state.queue.push_back(item);
                    drop(state);
                    self.item_ready.notify_one();
                    return true;
                }
            }
            space_ready.await;
        }
    }

    /// Takes the next item, marking it as being processed.
    ///
    /// Returns `None` once the queue is shut down and empty.
    pub(crate) async fn get(&self) -> Option<K> {
        loop {
            let item_ready = self.item_ready.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.queued.remove(&item);
                    state.processing.insert(item.clone());
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            item_ready.await;
        }
    }

    /// Marks `item` as processed.
    pub(crate) fn done(&self, item: &K) {
        self.lock().processing.remove(item);
    }

    /// Stops accepting items and wakes every waiting producer and consumer.
    pub(crate) fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().queue.len()
    }
}
