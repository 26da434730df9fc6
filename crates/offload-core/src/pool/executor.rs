//! The executor seam of the worker pool.

use crate::protocol::TaskOutput;
use crate::store::CompiledModule;
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;

/// Everything an executor needs to run one task.
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub module: Arc<CompiledModule>,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub envs: Vec<String>,
    pub stdin: Bytes,
    /// Zip archive unpacked as the task's filesystem.
    pub rootfs: Option<Bytes>,
    /// Paths to collect into a zip archive after the run.
    pub artifacts: Vec<String>,
}

/// One isolated task runner owned by the pool.
///
/// An executor runs one task at a time. Cancellation is destructive: the
/// pool drops the running future and calls [`Executor::terminate`], after
/// which the executor is never used again.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn run(&self, task_id: &str, params: TaskParams) -> Result<TaskOutput>;

    /// Release every resource held by this executor.
    fn terminate(&self) {}

    /// Whether the executor must be replaced after every task, for kinds
    /// that leak memory across runs.
    fn respawn_after_task(&self) -> bool {
        false
    }
}

/// Creates executors for the pool.
#[async_trait::async_trait]
pub trait ExecutorFactory: Send + Sync + 'static {
    async fn spawn(&self, index: usize) -> Result<Arc<dyn Executor>>;
}
