//! Fixed-size worker pool implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{PoolError, TaskQueue};

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long an idle worker sleeps before re-checking the queue.
    ///
    /// This is a safety net for lost wakeups; the common path is a
    /// notification from [`TaskQueue::push`].
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Default worker count: half the available cores, at least two.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(2)
}

/// Handler invoked once per dequeued task.
///
/// Implementations must convert task-local failures into result values on
/// their own output channels; an `Err` from `handle` is reserved for
/// infrastructure failures and terminates the worker that observed it.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync + 'static {
    async fn handle(&self, task: T) -> Result<(), PoolError>;
}

/// A fixed-size set of workers draining a shared [`TaskQueue`].
///
/// Workers are tokio tasks collected in a [`JoinSet`]; they park on the
/// queue's notifier (with a poll-interval fallback) and exit when the
/// pool's cancellation token fires.
pub struct WorkerPool {
    name: &'static str,
    config: WorkerPoolConfig,
    token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a pool with the default configuration.
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, WorkerPoolConfig::default())
    }

    /// Create a pool with a custom configuration.
    pub fn with_config(name: &'static str, config: WorkerPoolConfig) -> Self {
        Self {
            name,
            config,
            token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Create a pool whose token is a child of `parent`, so cancelling the
    /// parent also stops this pool.
    pub fn with_parent_token(
        name: &'static str,
        config: WorkerPoolConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            name,
            config,
            token: parent.child_token(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the workers.
    ///
    /// Each worker loops: wait for a wakeup (notification, poll tick or
    /// cancellation), then drain the queue one task at a time through the
    /// handler. A worker only dies early if the handler reports an
    /// infrastructure failure.
    pub fn start<T: Send + 'static>(
        &self,
        queue: Arc<TaskQueue<T>>,
        handler: Arc<dyn TaskHandler<T>>,
    ) {
        let name = self.name;
        info!(pool = name, workers = self.config.workers, "Starting worker pool");

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            error!(pool = name, "Worker pool already stopped; not starting");
            return;
        };

        for i in 0..self.config.workers {
            let queue = queue.clone();
            let handler = handler.clone();
            let token = self.token.clone();
            let poll_interval = self.config.poll_interval;

            join_set.spawn(async move {
                debug!(pool = name, worker = i, "Worker started");

                loop {
                    if token.is_cancelled() {
                        break;
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = queue.notifier().notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }

                    while let Some(task) = queue.pop() {
                        if let Err(e) = handler.handle(task).await {
                            error!(pool = name, worker = i, error = %e, "Worker infrastructure failure; exiting");
                            return;
                        }
                        if token.is_cancelled() {
                            return;
                        }
                    }
                }

                debug!(pool = name, worker = i, "Worker stopped");
            });
        }
    }

    /// Cancel the workers and wait for them to finish.
    pub async fn stop(&self) {
        info!(pool = self.name, "Stopping worker pool");
        self.token.cancel();

        // Take the join set out of the mutex before awaiting.
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!(pool = self.name, "Worker pool stopped");
    }

    /// Whether the pool has not been cancelled yet.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// The pool's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
