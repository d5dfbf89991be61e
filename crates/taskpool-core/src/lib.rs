//! Constraint-driven concurrency scheduling: groups, tasks, and the
//! scheduler loop that ties them together.
//!
//! This crate is the engine; the `taskpool` crate on top of it supplies the
//! ergonomic constructors (`add_single_task`, `add_batch_task`, ...) and the
//! persistent batching coordinator. Layering mirrors `fc-router` sitting on
//! top of `fc-queue`: the lower crate owns the mechanism, the higher crate
//! owns the sugar.

pub mod clock;
pub mod group;
pub mod pool;
pub mod resolvable;
pub mod task;

pub use clock::{Clock, DynClock, Instant, TokioClock};
pub use group::{Group, GroupOpts};
pub use pool::{PoolExecutor, PoolOpts};
pub use resolvable::Settled;
pub use task::{FnGenerator, Generator, SchedulableTask, Task, TaskOpts};

pub use taskpool_common::{Busyness, GroupId, Limit, PoolError, Result, TaskId, TaskState};
