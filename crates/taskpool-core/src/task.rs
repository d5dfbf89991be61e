//! Tasks: a generator invoked under concurrency, invocation and group
//! limits, producing an ordered result sequence.
//!
//! Grounded on the teacher's `fc-stream::batch_dispatcher::BatchDispatcher`
//! for the shape of "keep calling a user-supplied async function until some
//! limit is reached, track per-call outcomes, surface exactly one terminal
//! error" -- and on `fc-router::mediator::DispatchTarget` for type-erasing a
//! generic collaborator behind a trait object so a pool can hold tasks of
//! different result types in one registry.

use crate::clock::Instant;
use crate::group::{Group, GroupOpts};
use crate::resolvable::Settled;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskpool_common::{Busyness, Limit, PoolError, Result, TaskId, TaskState};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// A user-supplied producer of invocations. `invoke` is called once per
/// invocation with a zero-based invocation number. `Ok(None)` is the "no
/// more work" sentinel (spec.md §4.3): the task exhausts without this call
/// counting towards the result sequence. `Ok(Some(v))` becomes the
/// corresponding entry of the task's eventual result sequence.
#[async_trait]
pub trait Generator<V: Send + 'static>: Send + Sync {
    async fn invoke(&self, invocation_number: u32) -> Result<Option<V>>;
}

/// Adapts a boxed async closure to [`Generator`], for the sugar
/// constructors in the `taskpool` facade crate.
pub struct FnGenerator<V> {
    f: Box<dyn Fn(u32) -> BoxFuture<'static, Result<Option<V>>> + Send + Sync>,
}

impl<V> FnGenerator<V> {
    /// Build a generator from a closure that never signals exhaustion on
    /// its own (relies purely on `invocation_limit`).
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<V>> + Send + 'static,
    {
        Self {
            f: Box::new(move |n| {
                let fut = f(n);
                Box::pin(async move { fut.await.map(Some) })
            }),
        }
    }

    /// Build a generator from a closure that may itself signal exhaustion
    /// by returning `Ok(None)`.
    pub fn new_optional<F, Fut>(f: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<V>>> + Send + 'static,
    {
        Self {
            f: Box::new(move |n| Box::pin(f(n))),
        }
    }
}

#[async_trait]
impl<V: Send + 'static> Generator<V> for FnGenerator<V> {
    async fn invoke(&self, invocation_number: u32) -> Result<Option<V>> {
        (self.f)(invocation_number).await
    }
}

/// Construction-time configuration for a task (spec.md §3, §4.3).
///
/// `concurrency_limit`/`frequency_limit`/`frequency_window` here scope a
/// *private* group owned exclusively by this task (spec.md §3: "slot 1 is a
/// private group exclusively owning this task's concurrency/frequency
/// fields"); `groups` lists additional, possibly shared, groups the task
/// also belongs to. The pool prepends its own global group ahead of both.
pub struct TaskOpts<V> {
    pub groups: Vec<Arc<Group>>,
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Option<Duration>,
    pub invocation_limit: Option<u32>,
    pub generator: Arc<dyn Generator<V>>,
}

struct Inner<V> {
    state: TaskState,
    invocation_limit: Limit,
    invocations_started: u32,
    active_promise_count: u32,
    results: Vec<(u32, V)>,
    rejection: Option<PoolError>,
    /// Set once the generator itself has signalled "no more work" by
    /// returning `Ok(None)`, independent of `invocation_limit`.
    generator_exhausted: bool,
}

/// Type-erased view of a task, for storage in the pool's task registry
/// alongside tasks of other result types. Mirrors how `fc-router` keeps a
/// `HashMap<String, Arc<dyn DispatchTarget>>` of mediators with unrelated
/// payload types behind one trait object.
pub trait SchedulableTask: Send + Sync {
    fn id(&self) -> TaskId;
    fn state(&self) -> TaskState;
    fn groups(&self) -> &[Arc<Group>];

    /// Combined readiness of this task's own limits and every group it
    /// belongs to, at `now`.
    fn busy_time(&self, now: Instant) -> Busyness;

    /// Whether this task currently wants another invocation at all (i.e.
    /// ignoring group/own readiness, does it have capacity left).
    fn wants_invocation(&self) -> bool;

    /// `min(remaining invocation_limit, remaining concurrency across every
    /// group this task belongs to)` (spec.md §6).
    fn free_slots(&self) -> u32;

    /// Commit one invocation: bump counters on the task and every group,
    /// then spawn the generator call and its completion handling. Caller
    /// must have already confirmed `busy_time(now) == Ready` and
    /// `wants_invocation()` in the same scheduling pass.
    fn start_invocation(self: Arc<Self>, now: Instant);

    fn pause(self: Arc<Self>);
    fn resume(self: Arc<Self>);

    /// Stop generating further invocations and, once in-flight invocations
    /// drain, terminate. Equivalent to `stop_task` by id at the pool level.
    fn end(self: Arc<Self>);
}

/// A handle to a running or completed task, parameterized by its result
/// type. Cheap to clone; all state lives behind the shared `Arc`.
pub struct Task<V: Send + 'static> {
    inner: Arc<TaskImpl<V>>,
}

impl<V: Send + 'static> Clone for Task<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct TaskImpl<V: Send + 'static> {
    id: TaskId,
    groups: Vec<Arc<Group>>,
    generator: Arc<dyn Generator<V>>,
    state: Mutex<Inner<V>>,
    rejection_handled: Arc<AtomicBool>,
    completion: Settled<Result<Arc<Vec<V>>>>,
    wake: Arc<Notify>,
}

impl<V: Send + Sync + 'static> TaskImpl<V> {
    /// `global_group` is the pool's shared group (always slot 0);
    /// `pool_token` is used only to construct this task's private group
    /// (slot 1) so it validates as belonging to the same pool.
    pub(crate) fn new(
        opts: TaskOpts<V>,
        global_group: Arc<Group>,
        pool_token: Arc<()>,
        wake: Arc<Notify>,
    ) -> Result<Arc<Self>> {
        let private_group = Group::new(
            pool_token,
            wake.clone(),
            GroupOpts {
                concurrency_limit: opts.concurrency_limit,
                frequency_limit: opts.frequency_limit,
                frequency_window: opts.frequency_window,
            },
        )?;
        let invocation_limit = match opts.invocation_limit {
            Some(n) => Limit::bounded_allow_zero(n),
            None => Limit::Unbounded,
        };
        let id = TaskId::next();
        let mut groups = Vec::with_capacity(opts.groups.len() + 2);
        groups.push(global_group);
        groups.push(private_group);
        groups.extend(opts.groups);
        for g in &groups {
            g.task_added();
        }
        let state = if matches!(invocation_limit, Limit::Bounded(0)) {
            TaskState::Exhausted
        } else {
            TaskState::Active
        };
        let task = Arc::new(Self {
            id,
            groups,
            generator: opts.generator,
            state: Mutex::new(Inner {
                state,
                invocation_limit,
                invocations_started: 0,
                active_promise_count: 0,
                results: Vec::new(),
                rejection: None,
                generator_exhausted: false,
            }),
            rejection_handled: Arc::new(AtomicBool::new(true)),
            completion: Settled::new(),
            wake,
        });
        if state == TaskState::Exhausted {
            task.clone().finalize_if_drained();
        }
        Ok(task)
    }

    /// Await the task's terminal outcome: the ordered result sequence, or
    /// the single error that ended the task. Marks the error handled so the
    /// deferred unobserved-rejection check stands down.
    pub(crate) async fn promise(self: &Arc<Self>) -> Result<Arc<Vec<V>>> {
        self.rejection_handled.store(true, Ordering::SeqCst);
        self.completion.wait().await
    }

    fn finalize_if_drained(self: Arc<Self>) {
        let mut guard = self.state.lock();
        if guard.state == TaskState::Terminated {
            return;
        }
        let exhausted = guard.invocation_limit.is_reached(guard.invocations_started)
            || guard.generator_exhausted;
        if exhausted && guard.state < TaskState::Exhausted {
            guard.state = TaskState::Exhausted;
        }
        if guard.state >= TaskState::Exhausted && guard.active_promise_count == 0 {
            guard.state = TaskState::Terminated;
            let rejection = guard.rejection.clone();
            let mut results = std::mem::take(&mut guard.results);
            drop(guard);
            for g in &self.groups {
                g.task_removed();
            }
            let outcome = match rejection {
                Some(err) => Err(err),
                None => {
                    results.sort_by_key(|(n, _)| *n);
                    Ok(Arc::new(results.into_iter().map(|(_, v)| v).collect()))
                }
            };
            let settled = self.completion.settle(outcome.clone());
            if settled {
                if let Err(err) = outcome {
                    self.schedule_unhandled_rejection_check(err);
                }
            }
        }
    }

    /// Mutable `invocation_limit` (spec.md §4.3, §6): setting a value that
    /// the task has already reached or passed ends it immediately, the same
    /// as calling `end()`; otherwise the new limit takes effect and the
    /// scheduler is re-triggered, since a previously-reached cap may now
    /// have room (spec.md §4.5 trigger (c)).
    fn set_invocation_limit(self: &Arc<Self>, limit: Option<u32>) {
        let new_limit = match limit {
            Some(n) => Limit::bounded_allow_zero(n),
            None => Limit::Unbounded,
        };
        let ends_now = {
            let guard = self.state.lock();
            new_limit.is_reached(guard.invocations_started)
        };
        if ends_now {
            SchedulableTask::end(self.clone());
            return;
        }
        self.state.lock().invocation_limit = new_limit;
        self.wake.notify_one();
    }

    fn schedule_unhandled_rejection_check(self: &Arc<Self>, err: PoolError) {
        self.rejection_handled.store(false, Ordering::SeqCst);
        let handled = self.rejection_handled.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !handled.load(Ordering::SeqCst) {
                error!(task_id = %id, error = %err, "task rejected with no observer; promise() was never called");
            }
        });
    }

    fn record_invocation_result(
        self: &Arc<Self>,
        invocation_number: u32,
        outcome: Result<Option<V>>,
    ) {
        let mut guard = self.state.lock();
        guard.active_promise_count = guard.active_promise_count.saturating_sub(1);
        match outcome {
            Ok(Some(v)) => guard.results.push((invocation_number, v)),
            Ok(None) => guard.generator_exhausted = true,
            Err(err) => {
                if guard.rejection.is_none() {
                    guard.rejection = Some(err.clone());
                }
                drop(guard);
                for g in &self.groups {
                    g.reject(err.clone(), self.rejection_handled.clone());
                }
                self.clone().finalize_if_drained();
                return;
            }
        }
        drop(guard);
        self.clone().finalize_if_drained();
    }
}

impl<V: Send + Sync + 'static> SchedulableTask for TaskImpl<V> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        self.state.lock().state
    }

    fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    fn busy_time(&self, now: Instant) -> Busyness {
        if self.state.lock().state != TaskState::Active {
            return Busyness::BusyIndefinite;
        }
        self.groups
            .iter()
            .fold(Busyness::Ready, |acc, g| acc.combine(g.busy_time(now)))
    }

    fn wants_invocation(&self) -> bool {
        let guard = self.state.lock();
        guard.state == TaskState::Active
            && !guard.invocation_limit.is_reached(guard.invocations_started)
    }

    fn free_slots(&self) -> u32 {
        let guard = self.state.lock();
        let invocation_remaining = guard.invocation_limit.remaining(guard.invocations_started);
        drop(guard);
        self.groups
            .iter()
            .map(|g| g.concurrency_remaining())
            .fold(invocation_remaining, u32::min)
    }

    fn start_invocation(self: Arc<Self>, now: Instant) {
        let invocation_number = {
            let mut guard = self.state.lock();
            let n = guard.invocations_started;
            guard.invocations_started += 1;
            guard.active_promise_count += 1;
            n
        };
        for g in &self.groups {
            g.begin_promise(now);
        }
        debug!(task_id = %self.id, invocation_number, "starting invocation");
        let this = self.clone();
        let groups = self.groups.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            let outcome = this.generator.invoke(invocation_number).await;
            for g in &groups {
                g.end_promise();
            }
            this.record_invocation_result(invocation_number, outcome);
            wake.notify_one();
        });
    }

    fn pause(self: Arc<Self>) {
        let mut guard = self.state.lock();
        if guard.state == TaskState::Active {
            guard.state = TaskState::Paused;
        }
        drop(guard);
        self.wake.notify_one();
    }

    fn resume(self: Arc<Self>) {
        let mut guard = self.state.lock();
        if guard.state == TaskState::Paused {
            guard.state = TaskState::Active;
        }
        drop(guard);
        self.wake.notify_one();
    }

    fn end(self: Arc<Self>) {
        let mut guard = self.state.lock();
        if guard.state < TaskState::Exhausted {
            guard.invocation_limit = Limit::bounded_allow_zero(guard.invocations_started);
        }
        drop(guard);
        warn!(task_id = %self.id, "task ended early via end()/stop_task()");
        self.clone().finalize_if_drained();
        self.wake.notify_one();
    }
}

impl<V: Send + Sync + 'static> Task<V> {
    pub(crate) fn from_impl(inner: Arc<TaskImpl<V>>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    pub fn free_slots(&self) -> u32 {
        SchedulableTask::free_slots(self.inner.as_ref())
    }

    pub fn invocations(&self) -> u32 {
        self.inner.state.lock().invocations_started
    }

    pub fn active_promise_count(&self) -> u32 {
        self.inner.state.lock().active_promise_count
    }

    pub async fn promise(&self) -> Result<Arc<Vec<V>>> {
        self.inner.promise().await
    }

    pub fn pause(&self) {
        SchedulableTask::pause(self.inner.clone())
    }

    pub fn resume(&self) {
        SchedulableTask::resume(self.inner.clone())
    }

    pub fn end(&self) {
        SchedulableTask::end(self.inner.clone())
    }

    /// Setting a value at or below `invocations()` ends the task (spec.md
    /// §4.3); otherwise the new limit takes effect and the scheduler is
    /// re-triggered.
    pub fn set_invocation_limit(&self, limit: Option<u32>) {
        self.inner.set_invocation_limit(limit)
    }

    /// Mutates the concurrency limit of this task's own private group
    /// (spec.md §3 slot 1, §6) and re-triggers the scheduler.
    pub fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        self.inner.groups[1].set_concurrency_limit(limit)
    }

    /// Mutates the frequency limit of this task's own private group,
    /// keeping its current `frequency_window`.
    pub fn set_frequency_limit(&self, limit: Option<u32>) -> Result<()> {
        let group = &self.inner.groups[1];
        group.set_frequency_limit(limit, group.frequency_window())
    }

    /// Mutates the frequency window of this task's own private group,
    /// keeping its current `frequency_limit`.
    pub fn set_frequency_window(&self, window: Option<Duration>) -> Result<()> {
        let group = &self.inner.groups[1];
        group.set_frequency_limit(group.frequency_limit(), window)
    }

    pub(crate) fn as_schedulable(&self) -> Arc<dyn SchedulableTask> {
        self.inner.clone()
    }
}
