// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cluster;
pub mod eviction;
pub mod reconnect;
pub mod utils;

pub use utils::*;
