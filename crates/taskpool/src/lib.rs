//! The public facade over `taskpool-core`'s scheduler: ergonomic task
//! constructors (`add_single_task`/`add_linear_task`/`add_each_task`/
//! `add_batch_task`) and the persistent batching coordinator
//! (`add_persistent_batch_task`), mirroring how `fc-router`/`fc-stream` sit
//! on top of `fc-queue` in the teacher's workspace: the lower crate owns the
//! scheduling mechanism, this crate owns the sugar a caller actually writes
//! against.

pub mod batch;
mod sugar;

pub use batch::{BatchOutcome, BatchTaskOpts, Batcher, BatcherState, QueuingDelay};
pub use sugar::BatchSize;

pub use taskpool_core::{
    Busyness, Clock, DynClock, Generator, Group, GroupId, GroupOpts, Instant, Limit, PoolError,
    Result, SchedulableTask, Task, TaskId, TaskOpts, TaskState, TokioClock,
};
pub use taskpool_core::task::FnGenerator;

use std::sync::Arc;
use taskpool_core::pool::{PoolExecutor, PoolOpts as CorePoolOpts};

/// Construction-time configuration for a [`Pool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Pool-wide concurrency limit, applied across every task regardless of
    /// the groups it additionally belongs to. `None` means unbounded.
    pub concurrency_limit: Option<u32>,
    pub clock: Arc<dyn Clock>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            clock: taskpool_core::clock::tokio_clock(),
        }
    }
}

/// The public entry point: a constraint-driven pool of generator-backed
/// tasks (spec.md §6).
#[derive(Clone)]
pub struct Pool {
    executor: Arc<PoolExecutor>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            executor: PoolExecutor::new(CorePoolOpts {
                concurrency_limit: config.concurrency_limit,
                clock: config.clock,
            }),
        }
    }

    /// Register an additional shared group (spec.md §4.2) that several
    /// tasks can later be constructed against.
    pub fn add_group(&self, opts: GroupOpts) -> Result<Arc<Group>> {
        self.executor.add_group(opts)
    }

    /// The general task constructor every sugar constructor in this crate
    /// is built from.
    pub fn add_generic_task<V: Send + Sync + 'static>(&self, opts: TaskOpts<V>) -> Result<Task<V>> {
        self.executor.add_generic_task(opts)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskState> {
        self.executor.get_task_status(id)
    }

    /// Mutate the pool-wide concurrency limit at runtime (spec.md §6).
    pub fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        self.executor.set_concurrency_limit(limit)
    }

    pub fn pause_task(&self, id: TaskId) -> Result<()> {
        self.executor.pause_task(id)
    }

    pub fn resume_task(&self, id: TaskId) -> Result<()> {
        self.executor.resume_task(id)
    }

    /// Stop a task by id. Returns `false` if no such task exists in this
    /// pool (spec.md §6: `stop_task(id) -> bool`, not a `Result`).
    pub fn stop_task(&self, id: TaskId) -> bool {
        self.executor.stop_task(id).is_ok()
    }

    /// Resolve once every task (and, by the same mechanism, every
    /// persistent batch task's backing group) in the pool has drained.
    pub async fn wait_for_idle(&self) -> Result<()> {
        self.executor.wait_for_idle().await
    }

    pub fn shutdown(&self) {
        self.executor.shutdown()
    }

    pub fn active_task_count(&self) -> u32 {
        self.executor.active_task_count()
    }

    /// Add a persistent batch task: a long-lived coordinator that folds
    /// many individually-submitted inputs into shared batched generator
    /// calls (spec.md §4.6).
    pub fn add_persistent_batch_task<I, O>(&self, opts: BatchTaskOpts<I, O>) -> Result<Arc<Batcher<I, O>>>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        batch::Batcher::new(self.executor.clone(), opts)
    }
}
