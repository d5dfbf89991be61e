//! Sugar constructors over [`Pool::add_generic_task`](crate::Pool::add_generic_task):
//! `add_single_task`/`add_linear_task`/`add_each_task`/`add_batch_task`
//! (spec.md §4.4, §6). Each one is a thin [`FnGenerator`] shaped to match a
//! common calling convention; none of them teach the scheduler anything it
//! didn't already know how to do.

use crate::Pool;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use taskpool_core::task::{FnGenerator, TaskOpts};
use taskpool_core::{PoolError, Result, Task};

/// The batch size a [`Pool::add_batch_task`] should slice off the remaining
/// data on each invocation: either a fixed count, or a callback computed
/// from how much data is left and how many concurrent slots the task has
/// free right now (spec.md §4.4: "`batch_size` may be callable `(remaining,
/// free_slots) -> n`").
#[derive(Clone)]
pub enum BatchSize {
    Fixed(u32),
    Dynamic(Arc<dyn Fn(u32, u32) -> Result<u32> + Send + Sync>),
}

impl BatchSize {
    pub fn fixed(n: u32) -> Self {
        BatchSize::Fixed(n)
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(u32, u32) -> Result<u32> + Send + Sync + 'static,
    {
        BatchSize::Dynamic(Arc::new(f))
    }

    fn resolve(&self, remaining: u32, free_slots: u32) -> Result<u32> {
        match self {
            BatchSize::Fixed(n) => Ok(*n),
            BatchSize::Dynamic(f) => f(remaining, free_slots),
        }
    }
}

impl Pool {
    /// A task that runs its generator exactly once and resolves with its
    /// single value (spec.md §4.4: "invocation limit 1, returns first
    /// result"). `data`, if given, is handed to the generator on its one
    /// call and nowhere else.
    pub fn add_single_task<D, V, F, Fut>(&self, data: Option<D>, generator: F) -> Result<Task<V>>
    where
        D: Send + 'static,
        V: Send + Sync + 'static,
        F: Fn(Option<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let data_cell = Arc::new(Mutex::new(Some(data)));
        let generator = Arc::new(generator);
        let gen = FnGenerator::new(move |_n| {
            let data = data_cell.lock().take().flatten();
            let generator = generator.clone();
            async move { generator(data).await }
        });
        self.add_generic_task(TaskOpts {
            groups: vec![],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
            invocation_limit: Some(1),
            generator: Arc::new(gen),
        })
    }

    /// A task with `concurrency_limit` fixed at 1 (spec.md §4.4). The
    /// generator is given the raw `Option<V>` signature directly so it can
    /// signal its own exhaustion rather than relying solely on
    /// `invocation_limit`.
    pub fn add_linear_task<V, F, Fut>(&self, generator: F, invocation_limit: Option<u32>) -> Result<Task<V>>
    where
        V: Send + Sync + 'static,
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let gen = FnGenerator::new_optional(generator);
        self.add_generic_task(TaskOpts {
            groups: vec![],
            concurrency_limit: Some(1),
            frequency_limit: None,
            frequency_window: None,
            invocation_limit,
            generator: Arc::new(gen),
        })
    }

    /// A task whose generator is indexed straight off `data`: invocation `i`
    /// yields `generator(data[i], i)`, and the task exhausts on its own the
    /// moment `i >= data.len()` (spec.md §4.4).
    pub fn add_each_task<T, V, F, Fut>(
        &self,
        data: Vec<T>,
        generator: F,
        concurrency_limit: Option<u32>,
        invocation_limit: Option<u32>,
    ) -> Result<Task<V>>
    where
        T: Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: Fn(T, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let data = Arc::new(data);
        let generator = Arc::new(generator);
        let gen = FnGenerator::new_optional(move |n| {
            let data = data.clone();
            let generator = generator.clone();
            async move {
                match data.get(n as usize) {
                    Some(item) => generator(item.clone(), n).await.map(Some),
                    None => Ok(None),
                }
            }
        });
        self.add_generic_task(TaskOpts {
            groups: vec![],
            concurrency_limit,
            frequency_limit: None,
            frequency_window: None,
            invocation_limit,
            generator: Arc::new(gen),
        })
    }

    /// A task whose generator slices the next unconsumed range off `data`
    /// each invocation (spec.md §4.4). `batch_size` may be fixed or
    /// computed per-call from how much data remains and how many of the
    /// task's own slots are currently free.
    pub fn add_batch_task<T, V, F, Fut>(
        &self,
        data: Vec<T>,
        batch_size: BatchSize,
        generator: F,
        concurrency_limit: Option<u32>,
        invocation_limit: Option<u32>,
    ) -> Result<Task<Vec<V>>>
    where
        T: Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: Fn(Vec<T>, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>>> + Send + 'static,
    {
        let data = Arc::new(data);
        let offset = Arc::new(AtomicUsize::new(0));
        let generator = Arc::new(generator);
        let task_cell: Arc<OnceLock<Task<Vec<V>>>> = Arc::new(OnceLock::new());
        let task_cell_for_gen = task_cell.clone();

        let gen = FnGenerator::new_optional(move |_n| {
            let data = data.clone();
            let offset = offset.clone();
            let generator = generator.clone();
            let task_cell = task_cell_for_gen.clone();
            let batch_size = batch_size.clone();
            async move {
                let total = data.len();
                let start = offset.load(Ordering::SeqCst);
                if start >= total {
                    return Ok(None);
                }
                let remaining = (total - start) as u32;
                // Only populated once the task itself has been registered; a
                // generator can never run before that (one cooperative yield
                // separates construction from the first invocation).
                let free_slots = task_cell.get().map(|t| t.free_slots()).unwrap_or(u32::MAX);
                let n = batch_size.resolve(remaining, free_slots)?;
                if n == 0 {
                    return Err(PoolError::Validation("batch_size must be positive".into()));
                }
                let n = n.min(remaining) as usize;
                let reserved_start = offset.fetch_add(n, Ordering::SeqCst).min(total);
                let reserved_end = (reserved_start + n).min(total);
                if reserved_start >= reserved_end {
                    return Ok(None);
                }
                let slice = data[reserved_start..reserved_end].to_vec();
                let out = generator(slice, reserved_start as u32).await?;
                Ok(Some(out))
            }
        });

        let task = self.add_generic_task(TaskOpts {
            groups: vec![],
            concurrency_limit,
            frequency_limit: None,
            frequency_window: None,
            invocation_limit,
            generator: Arc::new(gen),
        })?;
        let _ = task_cell.set(task.clone());
        Ok(task)
    }
}
