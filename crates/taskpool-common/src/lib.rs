//! Shared vocabulary for the `taskpool` workspace.
//!
//! Mirrors the role `fc-common` plays for FlowCatalyst: opaque ids, the
//! error taxonomy, and a `logging` module, shared by every other crate in
//! the workspace so none of them re-derive the same small primitives.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

pub mod logging;

// ============================================================================
// Opaque ids
// ============================================================================

/// Unique, opaque identifier for a [`Task`](https://docs.rs/taskpool-core).
///
/// Allocated from a process-wide counter; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Unique, opaque identifier for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

macro_rules! opaque_id {
    ($ty:ident, $counter:ident) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $ty {
            /// Allocate the next unused id.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(TaskId, NEXT_TASK_ID);
opaque_id!(GroupId, NEXT_GROUP_ID);

// ============================================================================
// Task lifecycle state
// ============================================================================

/// Lifecycle state of a task.
///
/// Declaration order is significant: the derived [`Ord`] implementation
/// gives `Active < Paused < Exhausted < Terminated`, which the scheduler and
/// `end()`/`stop_task()` rely on for comparisons such as "is this task at
/// least Exhausted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    Active,
    Paused,
    Exhausted,
    Terminated,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Exhausted => "exhausted",
            TaskState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Limits
// ============================================================================

/// A positive bound, or no bound at all.
///
/// Used for concurrency limits and invocation limits, both of which are
/// "a positive integer or unbounded" per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Bounded(u32),
    Unbounded,
}

impl Limit {
    /// Construct a bounded limit, validating it is positive.
    ///
    /// `0` is rejected because every bounded limit in this system ("at most
    /// N concurrent", "at most N invocations") is meaningless at zero except
    /// for `invocation_limit`, which has its own `zero` constructor.
    pub fn bounded(n: u32) -> Result<Self> {
        if n == 0 {
            Err(PoolError::Validation("limit must be positive".into()))
        } else {
            Ok(Limit::Bounded(n))
        }
    }

    /// `invocation_limit` alone may legitimately be zero (a task that never
    /// runs its generator and resolves immediately with an empty result).
    pub fn bounded_allow_zero(n: u32) -> Self {
        Limit::Bounded(n)
    }

    pub fn is_reached(&self, count: u32) -> bool {
        match self {
            Limit::Bounded(n) => count >= *n,
            Limit::Unbounded => false,
        }
    }

    pub fn remaining(&self, count: u32) -> u32 {
        match self {
            Limit::Bounded(n) => n.saturating_sub(count),
            Limit::Unbounded => u32::MAX,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Limit::Bounded(n) => Some(*n),
            Limit::Unbounded => None,
        }
    }
}

impl Default for Limit {
    fn default() -> Self {
        Limit::Unbounded
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Result of asking a [`Group`](https://docs.rs/taskpool-core) whether it can
/// admit another invocation right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Busyness {
    /// Can start now.
    Ready,
    /// Blocked by a sliding frequency window that will admit at `Instant`.
    BusyUntil(Instant),
    /// Blocked by concurrency with no time-based resolution.
    BusyIndefinite,
}

impl Busyness {
    /// Combine two readiness results the way the scheduler combines every
    /// group a task belongs to: the worst of the two wins, and
    /// `BusyIndefinite` always wins over a timed block since there is
    /// nothing useful to wait for.
    pub fn combine(self, other: Busyness) -> Busyness {
        use Busyness::*;
        match (self, other) {
            (BusyIndefinite, _) | (_, BusyIndefinite) => BusyIndefinite,
            (BusyUntil(a), BusyUntil(b)) => BusyUntil(a.max(b)),
            (BusyUntil(a), Ready) | (Ready, BusyUntil(a)) => BusyUntil(a),
            (Ready, Ready) => Ready,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error taxonomy for the whole `taskpool` workspace.
///
/// Cloneable so it can be delivered to every waiter of a task or group
/// (`promise()` may be called more than once, `wait_for_idle()` may have
/// several concurrent callers).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Bad construction parameters: non-positive limits, a group owned by a
    /// different pool, a duplicate task id, an invalid batch size.
    #[error("validation error: {0}")]
    Validation(String),

    /// A generator threw synchronously or its returned operation rejected.
    #[error("generator failed: {0}")]
    Generator(Arc<dyn std::error::Error + Send + Sync>),

    /// A persistent batch generator returned an output sequence whose
    /// length does not match the input sequence it was given.
    #[error("batch output length {actual} does not match input length {expected}")]
    BatchShapeMismatch { expected: usize, actual: usize },

    /// The pool, group or batcher has been shut down and rejects new work.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// `get_task_status`/`stop_task` referenced an id not present in the
    /// pool (possibly already terminated and removed).
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A group passed to `add_generic_task` belongs to a different pool.
    #[error("group belongs to a different pool")]
    GroupFromAnotherPool,
}

pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Wrap an arbitrary generator error.
    pub fn from_generator<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PoolError::Generator(Arc::new(err))
    }
}
