//! A single-shot, multi-waiter notifier.
//!
//! The teacher's `ProcessPool` hands back a single `oneshot::Sender<AckNack>`
//! per message because exactly one consumer ever awaits it. `Task::promise()`
//! and `Group::wait_for_idle()` don't have that luxury: spec.md allows either
//! to be called any number of times, including after the outcome has already
//! landed, and every caller must observe the same final value. `Settled<T>`
//! is that generalization: internally it's still built out of
//! `tokio::sync::oneshot` channels, just fanned out to however many waiters
//! have registered by the time the value lands.
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

enum State<T> {
    Pending(Vec<oneshot::Sender<T>>),
    Settled(T),
}

/// A value that is produced at most once and may be awaited any number of
/// times, before or after it lands.
pub struct Settled<T: Clone + Send + 'static> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T: Clone + Send + 'static> Clone for Settled<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Settled<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Settled<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Settle with `value`, waking every waiter registered so far. Returns
    /// `false` (and does nothing) if this `Settled` was already settled --
    /// every settle-able thing in this system fires at most once.
    pub fn settle(&self, value: T) -> bool {
        let mut guard = self.inner.lock();
        match &mut *guard {
            State::Settled(_) => false,
            State::Pending(waiters) => {
                let waiters = std::mem::take(waiters);
                *guard = State::Settled(value.clone());
                for tx in waiters {
                    let _ = tx.send(value.clone());
                }
                true
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.lock(), State::Settled(_))
    }

    /// Await the settled value. Resolves immediately if already settled.
    pub async fn wait(&self) -> T {
        let rx = {
            let mut guard = self.inner.lock();
            match &mut *guard {
                State::Settled(v) => return v.clone(),
                State::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.expect("Settled dropped without settling")
    }
}
