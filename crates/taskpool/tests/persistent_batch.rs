use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskpool::{BatchOutcome, BatchTaskOpts, Pool, PoolConfig, QueuingDelay};
use taskpool_core::PoolError;

fn pool() -> Pool {
    Pool::new(PoolConfig::default())
}

#[tokio::test(start_paused = true)]
async fn batch_fires_once_max_batch_size_is_reached() {
    let pool = pool();
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();

    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(move |inputs: Vec<i32>| {
                let calls = calls2.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(inputs.into_iter().map(BatchOutcome::Value).collect())
                })
            }),
            max_batch_size: Some(2),
            queuing_delay: QueuingDelay::After(Duration::from_secs(3600)),
            queuing_thresholds: vec![1],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let b1 = batcher.clone();
    let b2 = batcher.clone();
    let h1 = tokio::spawn(async move { b1.get_result(1).await });
    let h2 = tokio::spawn(async move { b2.get_result(2).await });

    let r1 = h1.await.unwrap().unwrap();
    let r2 = h2.await.unwrap().unwrap();
    assert_eq!((r1, r2), (1, 2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn queuing_delay_flushes_a_partial_batch() {
    let pool = pool();
    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(|inputs: Vec<i32>| {
                Box::pin(async move { Ok(inputs.into_iter().map(BatchOutcome::Value).collect()) })
            }),
            max_batch_size: Some(10),
            queuing_delay: QueuingDelay::After(Duration::from_millis(50)),
            queuing_thresholds: vec![1],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let b1 = batcher.clone();
    let handle = tokio::spawn(async move { b1.get_result(9).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result, 9);
}

#[tokio::test(start_paused = true)]
async fn retry_outcome_requeues_at_head_preserving_order() {
    let pool = pool();
    let attempt = Arc::new(AtomicU32::new(0));
    let attempt2 = attempt.clone();

    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(move |inputs: Vec<i32>| {
                let attempt = attempt2.clone();
                Box::pin(async move {
                    let n = attempt.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        // First batch: retry everything once.
                        Ok(inputs.into_iter().map(|_| BatchOutcome::Retry).collect())
                    } else {
                        Ok(inputs.into_iter().map(BatchOutcome::Value).collect())
                    }
                })
            }),
            max_batch_size: Some(3),
            queuing_delay: QueuingDelay::Tick,
            queuing_thresholds: vec![1, u32::MAX],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let b1 = batcher.clone();
    let b2 = batcher.clone();
    let b3 = batcher.clone();
    let h1 = tokio::spawn(async move { b1.get_result(1).await });
    let h2 = tokio::spawn(async move { b2.get_result(2).await });
    let h3 = tokio::spawn(async move { b3.get_result(3).await });

    let r1 = h1.await.unwrap().unwrap();
    let r2 = h2.await.unwrap().unwrap();
    let r3 = h3.await.unwrap().unwrap();
    assert_eq!((r1, r2, r3), (1, 2, 3));
    assert!(attempt.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn output_length_mismatch_rejects_the_whole_batch() {
    let pool = pool();
    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(|_inputs: Vec<i32>| {
                Box::pin(async move { Ok(vec![BatchOutcome::Value(1)]) })
            }),
            max_batch_size: Some(5),
            queuing_delay: QueuingDelay::Tick,
            queuing_thresholds: vec![1],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let b1 = batcher.clone();
    let b2 = batcher.clone();
    let h1 = tokio::spawn(async move { b1.get_result(10).await });
    let h2 = tokio::spawn(async move { b2.get_result(20).await });

    let e1 = h1.await.unwrap().unwrap_err();
    let e2 = h2.await.unwrap().unwrap_err();
    assert!(matches!(e1, PoolError::BatchShapeMismatch { .. }));
    assert!(matches!(e2, PoolError::BatchShapeMismatch { .. }));
}

#[tokio::test(start_paused = true)]
async fn end_rejects_queued_and_future_inputs() {
    let pool = pool();
    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(|inputs: Vec<i32>| {
                Box::pin(async move { Ok(inputs.into_iter().map(BatchOutcome::Value).collect()) })
            }),
            max_batch_size: Some(10),
            queuing_delay: QueuingDelay::After(Duration::from_secs(3600)),
            queuing_thresholds: vec![1],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let b1 = batcher.clone();
    let queued = tokio::spawn(async move { b1.get_result(1).await });
    batcher.end();
    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::ShutdownInProgress));

    let err2 = batcher.get_result(2).await.unwrap_err();
    assert!(matches!(err2, PoolError::ShutdownInProgress));
}

#[tokio::test(start_paused = true)]
async fn second_concurrent_batch_waits_on_queuing_threshold() {
    let pool = pool();
    let active = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));
    let active2 = active.clone();
    let max_seen2 = max_seen.clone();

    let batcher = pool
        .add_persistent_batch_task(BatchTaskOpts {
            generator: Arc::new(move |inputs: Vec<i32>| {
                let active = active2.clone();
                let max_seen = max_seen2.clone();
                Box::pin(async move {
                    let cur = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(cur, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(inputs.into_iter().map(BatchOutcome::Value).collect())
                })
            }),
            max_batch_size: Some(1),
            queuing_delay: QueuingDelay::Tick,
            // A second concurrent batch is never allowed to start.
            queuing_thresholds: vec![1, u32::MAX],
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
        })
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let b = batcher.clone();
        handles.push(tokio::spawn(async move { b.get_result(i).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}
