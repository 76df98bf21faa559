// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod admission;
pub mod memoization;
pub mod shutdown;
pub mod utils;

pub use utils::*;
