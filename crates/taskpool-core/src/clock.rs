//! Clock abstraction.
//!
//! The scheduler never reads wall-clock time or sleeps directly; every
//! timing decision goes through a [`Clock`], injected at `PoolExecutor`
//! construction. This mirrors how the teacher's `HttpMediator` takes its
//! `reqwest::Client` as a configured dependency rather than constructing one
//! ad hoc deep inside request handling — the collaborator is a seam, not a
//! hidden global.
//!
//! The production implementation, [`TokioClock`], is a thin wrapper around
//! `tokio::time`. Deterministic tests don't need a bespoke virtual clock:
//! running under a paused Tokio runtime (`#[tokio::test(start_paused =
//! true)]` plus `tokio::time::advance`) already makes `TokioClock` behave
//! like one, since `tokio::time::Instant` and `tokio::time::sleep_until` are
//! themselves driven by the paused clock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use tokio::time::Instant;

/// Reports the current time and provides a suspendable wait until a future
/// instant. Single-shot: there is no periodic timer here, only "sleep until
/// T", which is all the scheduler ever needs (spec.md §4.1).
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;

    /// Suspend until `at` has passed (or return immediately if it already
    /// has).
    fn sleep_until(&self, at: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Default, production [`Clock`] backed by the Tokio time driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, at: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { tokio::time::sleep_until(at).await })
    }
}

pub type DynClock = Arc<dyn Clock>;

/// Convenience constructor so callers don't have to spell out the `Arc<dyn
/// Clock>` coercion.
pub fn tokio_clock() -> DynClock {
    Arc::new(TokioClock)
}
