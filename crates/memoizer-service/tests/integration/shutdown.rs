use std::num::NonZeroUsize;
use std::time::Duration;

use memoizer_service::Error;
use memoizer_service::config::ExecutionPolicy;
use memoizer_service::execution::{Execute, ExecuteExt, Lifecycle, WorkerPool};

use crate::{Counter, Latch, setup_services};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_completes_accepted_work() {
    let services = setup_services(|config| {
        config.execution.workers = NonZeroUsize::new(1).unwrap();
    });
    let cache = services.cache::<u32, u32>("numbers");
    let computations = Counter::new();
    let started = Latch::new(1);

    let callers: Vec<_> = (0..5)
        .map(|n| {
            let cache = cache.clone();
            let computations = computations.clone();
            let started = started.clone();
            tokio::spawn(async move {
                cache
                    .compute(n, move || async move {
                        started.count_down();
                        computations.increment();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, Error>(n * n)
                    })
                    .await
            })
        })
        .collect();
    started.wait().await;
    while cache.pending() + cache.len() < 5 {
        tokio::task::yield_now().await;
    }
    // the last caller may still be handing its computation to the executor
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancelled = services.shutdown(Duration::from_secs(5)).await;
    assert_eq!(cancelled, Some(vec![]));

    for (n, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.await.unwrap().unwrap(), (n * n) as u32);
    }
    assert_eq!(computations.get(), 5);

    // computed values are still served after the shutdown, new computations are rejected
    assert_eq!(
        cache.compute(4, || async { Ok::<_, Error>(0) }).await.unwrap(),
        16
    );
    let rejected = cache.compute(5, || async { Ok::<_, Error>(25) }).await;
    assert!(matches!(rejected, Err(Error::Rejected)));
}

/// Computations that do not finish in time are cancelled and reported.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_escalates_and_reports_cancelled_tasks() {
    for policy in [ExecutionPolicy::Pooled, ExecutionPolicy::PerTask] {
        let services = setup_services(|config| config.execution.policy = policy);
        let cache = services.cache::<u32, u32>("forever");
        let started = Latch::new(2);

        let callers: Vec<_> = (0..2)
            .map(|n| {
                let cache = cache.clone();
                let started = started.clone();
                tokio::spawn(async move {
                    cache
                        .compute(n, move || async move {
                            started.count_down();
                            std::future::pending::<Result<u32, Error>>().await
                        })
                        .await
                })
            })
            .collect();
        started.wait().await;

        let cancelled = services
            .shutdown(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 2, "{policy:?}");
        assert!(cancelled.iter().all(|task| task.name.as_deref() == Some("forever")));

        for caller in callers {
            assert!(matches!(caller.await.unwrap(), Err(Error::Cancelled)));
        }
        assert!(cache.is_empty());
        assert!(services.executor().is_terminated());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_now_hands_back_queued_tasks() {
    let pool = WorkerPool::new(
        "handback",
        NonZeroUsize::new(1).unwrap(),
        &tokio::runtime::Handle::current(),
    );
    let started = Latch::new(1);

    let running = {
        let started = started.clone();
        pool.submit(async move {
            started.count_down();
            std::future::pending::<()>().await
        })
        .unwrap()
    };
    started.wait().await;

    let queued: Vec<_> = (0..3).map(|i| pool.submit(async move { i }).unwrap()).collect();
    let drained = pool.shutdown_now();
    assert_eq!(drained.len(), 3);
    assert!(matches!(running.await, Err(Error::Cancelled)));
    assert!(pool.await_termination(Duration::from_secs(5)).await);
    assert_eq!(pool.lifecycle(), Lifecycle::Terminated);

    // discarded tasks can be handed to another executor, and still complete their handles
    let fallback = WorkerPool::new(
        "fallback",
        NonZeroUsize::new(2).unwrap(),
        &tokio::runtime::Handle::current(),
    );
    for task in drained {
        fallback.execute(task).unwrap();
    }
    let results: Vec<_> = futures::future::join_all(queued)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec![0, 1, 2]);
}
