#[macro_use]
pub mod metrics;

pub mod admission;
pub mod caching;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod services;

pub use error::{CacheEntry, Error};
