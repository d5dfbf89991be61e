//! The scheduler: a single background loop that decides, at each wake-up,
//! which tasks may start another invocation right now.
//!
//! Grounded on the teacher's `fc-router::pool::ConnectorPool::worker_loop`,
//! which also runs one long-lived background task per pool that wakes on a
//! notify or a timer and drains whatever work has become eligible. The
//! scheduling pass itself is always dispatched through `tokio::spawn` rather
//! than ever being invoked inline from `add_generic_task`/`stop_task`/an
//! invocation's own completion handler -- a task added from inside another
//! task's generator must not be eligible to start before its own
//! construction has returned, and the only way to guarantee that ordering
//! without a generation counter is to always hop through the scheduler's own
//! async context first.

use crate::clock::{Clock, Instant};
use crate::group::{Group, GroupOpts};
use crate::task::{SchedulableTask, Task, TaskImpl, TaskOpts};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use taskpool_common::{PoolError, Result, TaskId, TaskState};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

/// Construction-time configuration for a [`PoolExecutor`].
#[derive(Clone)]
pub struct PoolOpts {
    /// Pool-wide concurrency limit, applied across every task regardless of
    /// the groups it additionally belongs to. `None` means unbounded.
    pub concurrency_limit: Option<u32>,
    pub clock: Arc<dyn Clock>,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            clock: crate::clock::tokio_clock(),
        }
    }
}

/// `IndexMap` rather than `HashMap`: the scheduler walks tasks in strict
/// registration order (spec.md §4.5, §5), which a hash map's randomized
/// iteration order cannot provide. Grounded on the teacher's
/// `fc-router::manager`, which reaches for `IndexMap` for the same
/// insertion-order-preserving reason.
struct Registry {
    tasks: IndexMap<TaskId, Arc<dyn SchedulableTask>>,
}

/// The pool: owns the task registry, the implicit global group every task
/// belongs to, and the background scheduling loop.
pub struct PoolExecutor {
    pool_token: Arc<()>,
    clock: Arc<dyn Clock>,
    global_group: Arc<Group>,
    registry: Mutex<Registry>,
    wake: Arc<Notify>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolExecutor").finish_non_exhaustive()
    }
}

impl PoolExecutor {
    pub fn new(opts: PoolOpts) -> Arc<Self> {
        let pool_token = Arc::new(());
        let wake = Arc::new(Notify::new());
        let global_group = Group::new(
            pool_token.clone(),
            wake.clone(),
            GroupOpts {
                concurrency_limit: opts.concurrency_limit,
                frequency_limit: None,
                frequency_window: None,
            },
        )
        .expect("pool-wide concurrency limit is always valid here");
        let pool = Arc::new(Self {
            pool_token,
            clock: opts.clock,
            global_group,
            registry: Mutex::new(Registry {
                tasks: IndexMap::new(),
            }),
            wake,
            shut_down: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&pool);
        tokio::spawn(Self::scheduler_loop(weak, pool.wake.clone(), pool.clock.clone()));
        pool
    }

    async fn scheduler_loop(pool: Weak<Self>, wake: Arc<Notify>, clock: Arc<dyn Clock>) {
        loop {
            let notified = wake.notified();
            let next_wake = match pool.upgrade() {
                Some(p) => p.tick(),
                None => return,
            };
            match next_wake {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = clock.sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// One scheduling pass: start every invocation that is currently
    /// eligible, and report the earliest instant at which a timed block
    /// (a sliding frequency window) will next clear, if any.
    fn tick(&self) -> Option<Instant> {
        let now = self.clock.now();
        let tasks: Vec<Arc<dyn SchedulableTask>> = {
            let guard = self.registry.lock();
            guard.tasks.values().cloned().collect()
        };
        let mut next_wake: Option<Instant> = None;
        let mut terminated = Vec::new();
        for task in tasks {
            loop {
                if !task.wants_invocation() {
                    break;
                }
                match task.busy_time(now) {
                    taskpool_common::Busyness::Ready => {
                        task.clone().start_invocation(now);
                    }
                    taskpool_common::Busyness::BusyUntil(at) => {
                        next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                        break;
                    }
                    taskpool_common::Busyness::BusyIndefinite => break,
                }
            }
            if task.state() == TaskState::Terminated {
                terminated.push(task.id());
            }
        }
        if !terminated.is_empty() {
            let mut guard = self.registry.lock();
            for id in &terminated {
                // `shift_remove`, not `swap_remove`: removing a terminated
                // task must not reorder the tasks after it (spec.md §5:
                // "registration order is total").
                guard.tasks.shift_remove(id);
            }
            trace!(count = terminated.len(), "reaped terminated tasks");
        }
        next_wake
    }

    pub fn add_group(&self, opts: GroupOpts) -> Result<Arc<Group>> {
        Group::new(self.pool_token.clone(), self.wake.clone(), opts)
    }

    pub fn add_generic_task<V: Send + Sync + 'static>(&self, opts: TaskOpts<V>) -> Result<Task<V>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutdownInProgress);
        }
        for g in &opts.groups {
            if !g.belongs_to(&self.pool_token) {
                return Err(PoolError::GroupFromAnotherPool);
            }
        }
        let inner = TaskImpl::new(
            opts,
            self.global_group.clone(),
            self.pool_token.clone(),
            self.wake.clone(),
        )?;
        let id = inner.id();
        let task = Task::from_impl(inner.clone());
        self.registry
            .lock()
            .tasks
            .insert(id, task.as_schedulable());
        debug!(task_id = %id, "task registered");
        self.wake.notify_one();
        Ok(task)
    }

    pub fn get_task_status(&self, id: TaskId) -> Result<TaskState> {
        self.registry
            .lock()
            .tasks
            .get(&id)
            .map(|t| t.state())
            .ok_or(PoolError::TaskNotFound(id))
    }

    pub fn pause_task(&self, id: TaskId) -> Result<()> {
        let task = self.lookup(id)?;
        task.pause();
        Ok(())
    }

    pub fn resume_task(&self, id: TaskId) -> Result<()> {
        let task = self.lookup(id)?;
        task.resume();
        Ok(())
    }

    pub fn stop_task(&self, id: TaskId) -> Result<()> {
        let task = self.lookup(id)?;
        task.end();
        Ok(())
    }

    fn lookup(&self, id: TaskId) -> Result<Arc<dyn SchedulableTask>> {
        self.registry
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(PoolError::TaskNotFound(id))
    }

    /// Resolve once every task in the pool has terminated, or reject with
    /// the first recorded pool-wide failure.
    pub async fn wait_for_idle(&self) -> Result<()> {
        self.global_group.wait_for_idle().await
    }

    /// Mutate the pool-wide concurrency limit at runtime (spec.md §6: "Pool
    /// API: ... mutable `concurrency_limit`"). Re-triggers the scheduler
    /// (§4.5 trigger (c)) so a newly-raised limit can admit invocations that
    /// were previously capped.
    pub fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        self.global_group.set_concurrency_limit(limit)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Stop accepting new tasks. Existing tasks run to completion.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        info!("pool shutting down; no further tasks will be accepted");
    }

    pub fn active_task_count(&self) -> u32 {
        self.global_group.active_task_count()
    }
}
