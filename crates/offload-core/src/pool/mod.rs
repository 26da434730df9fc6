//! Worker scheduling.
//!
//! The pool runs at most `capacity` executors and hands each task to an idle
//! one in FIFO order. Waiting for an idle executor is the back-pressure point
//! of the whole provider.

mod executor;
mod worker_pool;

pub use executor::{Executor, ExecutorFactory, TaskParams};
pub use worker_pool::{PoolSnapshot, WorkerInfo, WorkerPool};
