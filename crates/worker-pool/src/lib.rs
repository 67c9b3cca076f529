//! # Worker Pool
//!
//! This crate provides a small abstraction for running a fixed-size set of
//! parallel workers that drain a shared task queue. Pools shut down
//! cooperatively through a [`CancellationToken`], so long-running handlers
//! can observe cancellation at their own suspension points.
//!
//! A pool never interprets the tasks it carries: a [`TaskHandler`] is invoked
//! once per dequeued task and is expected to convert every task-local failure
//! into a result value on its own output channel. Only infrastructure-level
//! failures (a closed output channel, an unusable disk) should be surfaced as
//! [`PoolError`], which terminates the affected worker.

use thiserror::Error;

mod pool;
mod queue;

pub use pool::{TaskHandler, WorkerPool, WorkerPoolConfig, default_worker_count};
pub use queue::TaskQueue;

pub use tokio_util::sync::CancellationToken;

/// Errors surfaced by pool workers.
///
/// Task-local failures never show up here; handlers report those on their
/// output queues. A `PoolError` means the worker itself can no longer make
/// progress and will exit.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A channel the handler depends on is gone.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Any other failure that makes the worker unable to continue.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}
