//! Groups: shared concurrency and frequency limits applied across tasks.
//!
//! Grounded on the teacher's `fc-router::pool::ConnectorPool`, which pairs a
//! `Semaphore` for concurrency with a `governor::RateLimiter` for frequency.
//! That pairing doesn't transfer directly: spec.md requires a group's
//! frequency window to be *introspectable* (the scheduler needs to know the
//! instant at which the oldest counted invocation ages out, so it can sleep
//! exactly that long), and `governor` only exposes an accept/reject
//! decision. So frequency tracking here is a plain sliding window of
//! timestamps, kept in a `VecDeque`, which is how `fc-router`'s own
//! `rate_limit_tests.rs` mocks reasoned about windows before reaching for
//! `governor` in the real implementation.

use crate::clock::Instant;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskpool_common::{Busyness, GroupId, Limit, PoolError, Result};
use tokio::sync::{oneshot, Notify};
use tracing::trace;

/// Configuration for a [`Group`], gathered at construction time.
#[derive(Debug, Clone, Default)]
pub struct GroupOpts {
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Option<Duration>,
}

#[derive(Debug)]
struct FrequencyWindow {
    limit: u32,
    window: Duration,
    starts: VecDeque<Instant>,
}

struct Inner {
    concurrency_limit: Limit,
    frequency: Option<FrequencyWindow>,
    active_promise_count: u32,
    active_task_count: u32,
    rejection: Option<PoolError>,
    /// The flag of whichever task's failure first populated `rejection`.
    /// Set once a waiter actually receives the rejection, so that task's
    /// deferred unobserved-rejection check stands down.
    rejection_handled: Option<Arc<AtomicBool>>,
    idle_waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// A named bucket of shared concurrency/frequency limits that any number of
/// tasks may register against (spec.md §3, §4.2).
pub struct Group {
    id: GroupId,
    pool_token: Arc<()>,
    wake: Arc<Notify>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("id", &self.id).finish()
    }
}

impl Group {
    pub(crate) fn new(pool_token: Arc<()>, wake: Arc<Notify>, opts: GroupOpts) -> Result<Arc<Self>> {
        let concurrency_limit = match opts.concurrency_limit {
            Some(n) => Limit::bounded(n)?,
            None => Limit::Unbounded,
        };
        let frequency = match (opts.frequency_limit, opts.frequency_window) {
            (Some(limit), Some(window)) => {
                if limit == 0 {
                    return Err(PoolError::Validation(
                        "frequency_limit must be positive".into(),
                    ));
                }
                Some(FrequencyWindow {
                    limit,
                    window,
                    starts: VecDeque::new(),
                })
            }
            (None, None) => None,
            _ => {
                return Err(PoolError::Validation(
                    "frequency_limit and frequency_window must be set together".into(),
                ))
            }
        };
        Ok(Arc::new(Self {
            id: GroupId::next(),
            pool_token,
            wake,
            inner: Mutex::new(Inner {
                concurrency_limit,
                frequency,
                active_promise_count: 0,
                active_task_count: 0,
                rejection: None,
                rejection_handled: None,
                idle_waiters: Vec::new(),
            }),
        }))
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Whether `self` was constructed by the same pool as `other_token`.
    pub(crate) fn belongs_to(&self, other_token: &Arc<()>) -> bool {
        Arc::ptr_eq(&self.pool_token, other_token)
    }

    pub fn concurrency_limit(&self) -> Limit {
        self.inner.lock().concurrency_limit
    }

    /// Mutating `concurrency_limit` at runtime triggers a scheduler
    /// re-evaluation (spec.md §4.2, §4.5 trigger (c)) -- a lowered limit may
    /// newly block invocations; a raised one may newly admit them.
    pub fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        let new_limit = match limit {
            Some(n) => Limit::bounded(n)?,
            None => Limit::Unbounded,
        };
        self.inner.lock().concurrency_limit = new_limit;
        self.wake.notify_one();
        Ok(())
    }

    pub fn frequency_limit(&self) -> Option<u32> {
        self.inner.lock().frequency.as_ref().map(|f| f.limit)
    }

    pub fn frequency_window(&self) -> Option<Duration> {
        self.inner.lock().frequency.as_ref().map(|f| f.window)
    }

    pub fn set_frequency_limit(&self, limit: Option<u32>, window: Option<Duration>) -> Result<()> {
        let mut guard = self.inner.lock();
        match (limit, window) {
            (Some(limit), Some(window)) => {
                if limit == 0 {
                    return Err(PoolError::Validation(
                        "frequency_limit must be positive".into(),
                    ));
                }
                let starts = guard
                    .frequency
                    .take()
                    .map(|f| f.starts)
                    .unwrap_or_default();
                guard.frequency = Some(FrequencyWindow {
                    limit,
                    window,
                    starts,
                });
            }
            (None, None) => guard.frequency = None,
            _ => {
                return Err(PoolError::Validation(
                    "frequency_limit and frequency_window must be set together".into(),
                ))
            }
        }
        drop(guard);
        self.wake.notify_one();
        Ok(())
    }

    /// Drop timestamps that have aged out of the window, and report the
    /// combined readiness of concurrency and frequency at `now`. Exposed
    /// beyond the crate so the `taskpool` facade's persistent batch
    /// coordinator can gate its own dispatch loop on a group the same way
    /// the scheduler does.
    pub fn busy_time(&self, now: Instant) -> Busyness {
        let mut guard = self.inner.lock();
        if guard.concurrency_limit.is_reached(guard.active_promise_count) {
            return Busyness::BusyIndefinite;
        }
        if let Some(freq) = &mut guard.frequency {
            while let Some(&front) = freq.starts.front() {
                if now.saturating_duration_since(front) >= freq.window {
                    freq.starts.pop_front();
                } else {
                    break;
                }
            }
            if freq.starts.len() as u32 >= freq.limit {
                let oldest = *freq.starts.front().expect("len checked above");
                return Busyness::BusyUntil(oldest + freq.window);
            }
        }
        Busyness::Ready
    }

    /// Commit one invocation against this group's limits. Must only be
    /// called once `busy_time` has confirmed readiness for every group the
    /// invoking task belongs to, in the same scheduling pass.
    pub fn begin_promise(&self, now: Instant) {
        let mut guard = self.inner.lock();
        guard.active_promise_count += 1;
        if let Some(freq) = &mut guard.frequency {
            freq.starts.push_back(now);
        }
    }

    pub fn end_promise(&self) {
        let mut guard = self.inner.lock();
        guard.active_promise_count = guard.active_promise_count.saturating_sub(1);
    }

    pub(crate) fn task_added(&self) {
        self.inner.lock().active_task_count += 1;
    }

    pub(crate) fn task_removed(&self) {
        let mut guard = self.inner.lock();
        guard.active_task_count = guard.active_task_count.saturating_sub(1);
        if guard.active_task_count == 0 {
            // The error is cleared when the group next becomes idle
            // (spec.md §4.2, §7): a past rejection must not poison every
            // later wait_for_idle() call once nothing is running anymore.
            guard.rejection = None;
            guard.rejection_handled = None;
            let waiters = std::mem::take(&mut guard.idle_waiters);
            drop(guard);
            for tx in waiters {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Record a failure against this group, rejecting any current idle
    /// waiters with it and marking `handled` (the originating task's
    /// deferred unobserved-rejection flag) once a waiter actually receives
    /// it (spec.md §4.2: "reject").
    pub fn reject(&self, err: PoolError, handled: Arc<AtomicBool>) {
        let mut guard = self.inner.lock();
        if guard.rejection.is_none() {
            guard.rejection = Some(err.clone());
            guard.rejection_handled = Some(handled);
        }
        let waiters = std::mem::take(&mut guard.idle_waiters);
        let had_waiters = !waiters.is_empty();
        let recorded_handled = guard.rejection_handled.clone();
        drop(guard);
        if had_waiters {
            if let Some(handled) = recorded_handled {
                handled.store(true, Ordering::SeqCst);
            }
        }
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Resolve once this group has no active tasks, or reject immediately
    /// if a failure is already recorded.
    pub async fn wait_for_idle(&self) -> Result<()> {
        let rx = {
            let mut guard = self.inner.lock();
            if let Some(err) = &guard.rejection {
                let err = err.clone();
                if let Some(handled) = &guard.rejection_handled {
                    handled.store(true, Ordering::SeqCst);
                }
                return Err(err);
            }
            if guard.active_task_count == 0 {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            guard.idle_waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(PoolError::ShutdownInProgress))
    }

    pub fn active_task_count(&self) -> u32 {
        self.inner.lock().active_task_count
    }

    pub fn active_promise_count(&self) -> u32 {
        self.inner.lock().active_promise_count
    }

    /// Remaining concurrency slots, ignoring frequency. Used by
    /// `Task::free_slots` (spec.md §6: "free_slots = min across groups and
    /// remaining invocations").
    pub(crate) fn concurrency_remaining(&self) -> u32 {
        let guard = self.inner.lock();
        guard.concurrency_limit.remaining(guard.active_promise_count)
    }

    pub(crate) fn debug_tick(&self) {
        trace!(group_id = %self.id, "group considered in scheduling pass");
    }
}
