use std::sync::Arc;
use std::time::Duration;

use memoizer_service::Error;
use memoizer_service::caching::MemoizingCache;
use memoizer_service::config::ExecutionPolicy;
use memoizer_test::factorize;

use crate::{Counter, Latch, setup_services};

async fn factorize_concurrently(
    cache: &MemoizingCache<u64, Arc<[u64]>>,
    computations: &Counter,
    numbers: &[u64],
    callers_per_number: usize,
) -> Vec<Arc<[u64]>> {
    let callers: Vec<_> = numbers
        .iter()
        .flat_map(|&n| std::iter::repeat_n(n, callers_per_number))
        .map(|n| {
            let cache = cache.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                cache
                    .compute(n, move || async move {
                        computations.increment();
                        // make sure the callers overlap
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, Error>(factorize(n).into())
                    })
                    .await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(callers.len());
    for caller in callers {
        results.push(caller.await.unwrap().unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_number_factorized_once() {
    let services = setup_services(|_| ());
    let cache = services.cache::<u64, Arc<[u64]>>("factors");
    let computations = Counter::new();

    let numbers = [360, 7919, 1_000_000_007, 600_851_475_143];
    let results = factorize_concurrently(&cache, &computations, &numbers, 25).await;

    assert_eq!(computations.get(), numbers.len());
    assert_eq!(cache.len(), numbers.len());
    for (result, &n) in results.iter().zip(numbers.iter().flat_map(|n| [n; 25].into_iter())) {
        assert_eq!(result.iter().product::<u64>(), n);
    }

    // all callers for a number share the same value
    let shared = &results[..25];
    assert!(shared.iter().all(|factors| Arc::ptr_eq(factors, &shared[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_task_policy() {
    let services = setup_services(|config| config.execution.policy = ExecutionPolicy::PerTask);
    let cache = services.cache::<u64, Arc<[u64]>>("factors");
    let computations = Counter::new();

    factorize_concurrently(&cache, &computations, &[12, 13, 14], 10).await;
    assert_eq!(computations.get(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caches_are_independent() {
    let services = setup_services(|_| ());
    let squares = services.cache::<u64, u64>("squares");
    let cubes = services.cache::<u64, u64>("cubes");

    let square = squares.compute(3, || async { Ok::<_, Error>(9) }).await;
    let cube = cubes.compute(3, || async { Ok::<_, Error>(27) }).await;

    assert_eq!(square.unwrap(), 9);
    assert_eq!(cube.unwrap(), 27);
    assert_eq!(squares.get(&3), Some(9));
    assert_eq!(cubes.get(&3), Some(27));
}

/// A blocking read on a socket is interrupted by cancelling the computation that owns it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_closes_registered_socket() {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    let services = setup_services(|_| ());
    let cache = services.cache::<&'static str, usize>("sockets");

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (socket, _) = listener.accept().unwrap();
    let registered = Latch::new(1);

    let caller = {
        let cache = cache.clone();
        let registered = registered.clone();
        tokio::spawn(async move {
            cache
                .compute_with("read", move |handle| async move {
                    let registration = handle.register(socket.try_clone()?);
                    registered.count_down();

                    let read = tokio::task::spawn_blocking(move || {
                        let mut socket = socket;
                        let mut buf = [0u8; 16];
                        socket.read(&mut buf)
                    })
                    .await
                    .map_err(std::io::Error::other)?;

                    drop(registration);
                    match read? {
                        0 => Err(std::io::Error::other("connection closed")),
                        n => Ok(n),
                    }
                })
                .await
        })
    };

    registered.wait().await;
    assert!(cache.cancel(&"read"));

    let result = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(cache.is_empty());
}
