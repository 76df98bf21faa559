use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde::Deserialize;

use memoizer_service::CacheEntry;
use memoizer_service::caching::MemoizingCache;
use memoizer_test::{Counter, factorize};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys requests are spread over.
    ///
    /// Fewer keys mean more requests that are coalesced or served from memory.
    #[serde(default = "default_keys")]
    pub keys: u64,
    pub payload: Payload,
}

fn default_keys() -> u64 {
    1
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Factorizes numbers just below `max`.
    Factorize { max: u64 },
    /// Does nothing but wait.
    Sleep {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Fails randomly, which means the failed keys are computed again.
    Flaky { failure_rate: f64 },
}

pub type Factors = Arc<[u64]>;

/// A workload ready to be run against its own cache.
pub struct ParsedPayload {
    pub cache: MemoizingCache<u64, Factors>,
    /// How often a computation actually ran.
    pub computations: Counter,
    keys: u64,
    payload: Payload,
}

pub fn prepare_payload(
    cache: MemoizingCache<u64, Factors>,
    keys: u64,
    payload: Payload,
) -> anyhow::Result<ParsedPayload> {
    if keys == 0 {
        bail!("a workload needs at least one key");
    }
    match payload {
        Payload::Factorize { max } if max < keys => {
            bail!("cannot factorize {keys} distinct numbers below {max}")
        }
        Payload::Flaky { failure_rate } if !(0.0..=1.0).contains(&failure_rate) => {
            bail!("failure rate must be between 0 and 1, got {failure_rate}")
        }
        _ => {}
    }

    Ok(ParsedPayload {
        cache,
        computations: Counter::new(),
        keys,
        payload,
    })
}

pub async fn process_payload(workload: &ParsedPayload) -> CacheEntry<Factors> {
    let key = rand::random_range(0..workload.keys);
    let computations = workload.computations.clone();
    let payload = workload.payload.clone();

    workload
        .cache
        .compute_with_default_timeout(key, move || async move {
            computations.increment();
            match payload {
                Payload::Factorize { max } => Ok(factorize(max - key).into()),
                Payload::Sleep { duration } => {
                    tokio::time::sleep(duration).await;
                    Ok(Factors::from([key]))
                }
                Payload::Flaky { failure_rate } => {
                    if rand::random_bool(failure_rate) {
                        anyhow::bail!("flaky computation for {key} failed");
                    }
                    Ok(Factors::from([key]))
                }
            }
        })
        .await
}
