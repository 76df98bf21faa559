use std::num::NonZeroUsize;

use memoizer_service::config::{Config, ExecutionPolicy};
use memoizer_service::services::Services;
use memoizer_test as test;

pub use test::{Counter, Latch};

/// Setup tests and create the shared services.
///
/// The services run a worker pool with four workers on the current runtime. The `update_config`
/// closure can modify any default configuration if needed before the services are created.
pub fn setup_services(update_config: impl FnOnce(&mut Config)) -> Services {
    test::setup();

    let mut config = Config::default();
    config.execution.policy = ExecutionPolicy::Pooled;
    config.execution.workers = NonZeroUsize::new(4).unwrap();
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    Services::new(config, &handle)
}
