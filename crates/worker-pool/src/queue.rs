//! Shared task queue drained by pool workers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// An unbounded multi-consumer FIFO queue.
///
/// Producers push from any task; workers pop after being woken through the
/// queue's [`Notify`]. Wakeups are best-effort (a notification sent while no
/// worker is waiting is retained for at most one waiter), so consumers are
/// expected to also poll on a timer, the way [`WorkerPool`](crate::WorkerPool)
/// workers do.
#[derive(Debug, Default)]
pub struct TaskQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> TaskQueue<T> {
    /// Create a new empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Push a task and wake one waiting worker.
    pub fn push(&self, task: T) {
        self.items.lock().push_back(task);
        self.notify.notify_one();
    }

    /// Pop the oldest task, if any.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// The notifier workers wait on between polls.
    pub fn notifier(&self) -> &Notify {
        &self.notify
    }
}
