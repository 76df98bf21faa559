use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memoizer_service::admission::AdmissionGate;
use memoizer_service::caching::MemoizingCache;
use memoizer_service::execution::{Execute, SpawnPerTask, Task};
use memoizer_service::services::Services;
use memoizer_service::{CacheEntry, Error};
use memoizer_test as test;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{Counter, Latch, setup_services};

/// With a capacity of `C`, the `C + 1`th submission waits until one of the first `C` completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_bounds_in_flight_tasks() {
    test::setup();
    // spawns every task right away, so only the gate bounds concurrency
    let executor = Arc::new(SpawnPerTask::new("unbounded", Handle::current()));
    let gate = AdmissionGate::new(NonZeroUsize::new(3).unwrap());
    let started = Arc::new(AtomicUsize::new(0));
    let releases: Vec<_> = (0..4).map(|_| Latch::new(1)).collect();

    let blocking_task = |release: &Latch| {
        let release = release.clone();
        let started = Arc::clone(&started);
        Task::new(async move {
            started.fetch_add(1, Ordering::SeqCst);
            release.wait().await;
        })
    };

    for release in &releases[..3] {
        gate.submit(&*executor, blocking_task(release)).await.unwrap();
    }
    while started.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executor.running(), 3);
    assert_eq!(gate.available(), 0);

    let blocked = {
        let gate = gate.clone();
        let executor = Arc::clone(&executor);
        let task = blocking_task(&releases[3]);
        tokio::spawn(async move { gate.submit(&*executor, task).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(executor.running(), 3);

    releases[0].count_down();
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    while started.load(Ordering::SeqCst) < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executor.running(), 3);

    for release in &releases[1..] {
        release.count_down();
    }
    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(5)).await);
    wait_for_free_slots(&gate, 3).await;
}

/// Computations of a cache are throttled by the configured admission gate.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_uses_configured_gate() {
    let services = setup_services(|config| {
        config.admission.max_in_flight = NonZeroUsize::new(1);
    });
    let gate = services.admission().unwrap().clone();
    let cache = services.cache::<u32, u32>("gated");
    let release = Latch::new(1);

    let first = {
        let cache = cache.clone();
        let release = release.clone();
        tokio::spawn(async move {
            cache
                .compute(1, move || async move {
                    release.wait().await;
                    Ok::<_, Error>(1)
                })
                .await
        })
    };
    while gate.available() > 0 {
        tokio::task::yield_now().await;
    }

    // a different key has to wait for the slot
    let second = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.compute(2, || async { Ok::<_, Error>(2) }).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(cache.pending(), 2);

    release.count_down();
    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(second.await.unwrap().unwrap(), 2);
    wait_for_free_slots(&gate, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_gate_rejects_computations() {
    let services = setup_services(|config| {
        config.admission.max_in_flight = NonZeroUsize::new(2);
    });
    let cache = services.cache::<u32, u32>("gated");

    services.admission().unwrap().close();
    let result = cache.compute(1, || async { Ok::<_, Error>(1) }).await;
    assert!(matches!(result, Err(Error::Rejected)));
    assert!(cache.is_empty());
}

/// Waits until `gate` has `slots` free slots.
///
/// A task returns its slot right after it delivered its outcome, so this may lag behind.
async fn wait_for_free_slots(gate: &AdmissionGate, slots: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gate.available() < slots {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Holds the only admission slot with a computation for key `0` until the returned latch opens.
async fn occupy_gate(
    services: &Services,
    cache: &MemoizingCache<u32, u32>,
) -> (JoinHandle<CacheEntry<u32>>, Latch) {
    let gate = services.admission().unwrap().clone();
    let release = Latch::new(1);

    let holder = {
        let cache = cache.clone();
        let release = release.clone();
        tokio::spawn(async move {
            cache
                .compute(0, move || async move {
                    release.wait().await;
                    Ok::<_, Error>(0)
                })
                .await
        })
    };
    while gate.available() > 0 {
        tokio::task::yield_now().await;
    }
    (holder, release)
}

/// A caller that gives up while its computation waits for admission leaves it to the others.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_while_waiting_for_admission() {
    let services = setup_services(|config| {
        config.admission.max_in_flight = NonZeroUsize::new(1);
    });
    let cache = services.cache::<u32, u32>("gated");
    let (holder, release) = occupy_gate(&services, &cache).await;
    let computations = Counter::new();

    let impatient = {
        let cache = cache.clone();
        let computations = computations.clone();
        tokio::spawn(async move {
            cache
                .compute_timeout(2, Duration::from_millis(30), move || async move {
                    computations.increment();
                    Ok::<_, Error>(2)
                })
                .await
        })
    };
    while cache.pending() < 2 {
        tokio::task::yield_now().await;
    }
    let patient = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.compute(2, || async { Ok::<_, Error>(0) }).await })
    };

    let err = impatient.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!patient.is_finished());
    assert_eq!(cache.pending(), 2);

    release.count_down();
    assert_eq!(holder.await.unwrap().unwrap(), 0);
    let value = tokio::time::timeout(Duration::from_secs(5), patient)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(computations.get(), 1);
    assert_eq!(cache.get(&2), Some(2));
}

/// Cancelling a computation that waits for admission resolves its waiters right away.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_waiting_for_admission() {
    let services = setup_services(|config| {
        config.admission.max_in_flight = NonZeroUsize::new(1);
    });
    let gate = services.admission().unwrap().clone();
    let cache = services.cache::<u32, u32>("gated");
    let (holder, release) = occupy_gate(&services, &cache).await;
    let computations = Counter::new();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                cache
                    .compute(2, move || async move {
                        computations.increment();
                        Ok::<_, Error>(2)
                    })
                    .await
            })
        })
        .collect();
    while cache.pending() < 2 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(cache.cancel(&2));
    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
    assert_eq!(cache.pending(), 1);
    assert_eq!(gate.available(), 0);

    release.count_down();
    assert_eq!(holder.await.unwrap().unwrap(), 0);
    assert_eq!(computations.get(), 0);
    wait_for_free_slots(&gate, 1).await;
}
