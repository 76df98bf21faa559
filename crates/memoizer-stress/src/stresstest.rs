use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use memoizer_service::config::Config;
use memoizer_service::services::Services;

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

/// How long accepted computations get to finish once the stresstest is over.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Outcomes {
    durations: DDSketch,
    failures: usize,
}

pub async fn perform_stresstest(
    config: Config,
    compute_runtime: Handle,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let services = Services::new(config, &compute_runtime);

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| -> Result<_> {
            let cache = services.cache(&format!("workload-{i}"));
            let payload = prepare_payload(cache, workload.keys, workload.payload)?;
            Ok((workload.concurrency, Arc::new(payload)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_payload(&workload).await.ok();
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.iter() {
        let concurrency = *concurrency;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let outcomes = Arc::new(Mutex::new(Outcomes::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let outcomes = Arc::clone(&outcomes);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = process_payload(&workload).await;

                            transaction.finish();

                            let mut outcomes = outcomes.lock().unwrap();
                            outcomes.durations.add(task_start.elapsed().as_secs_f64());
                            if result.is_err() {
                                outcomes.failures += 1;
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let outcomes: Outcomes = {
                let mut outcomes = outcomes.lock().unwrap();
                std::mem::take(&mut outcomes)
            };

            (concurrency, outcomes)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, (_, workload))) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let (concurrency, outcomes) = task?;
        let task_durations = outcomes.durations;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!(
            "  computations: {}; failures: {}; cached: {}",
            workload.computations.get(),
            outcomes.failures,
            workload.cache.len(),
        );

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
    println!();

    match services.shutdown(SHUTDOWN_TIMEOUT).await {
        Some(cancelled) if cancelled.is_empty() => println!("Shutdown: all tasks completed"),
        Some(cancelled) => {
            println!("Shutdown: {} tasks cancelled", cancelled.len());
            for task in cancelled {
                println!("  {}", task.id);
            }
        }
        None => anyhow::bail!("executor did not terminate within {SHUTDOWN_TIMEOUT:?}"),
    }

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let seconds = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(seconds)
}
