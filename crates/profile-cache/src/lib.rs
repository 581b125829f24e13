//! A cluster-aware cache of aggregated profiles.
//!
//! Every query node keeps the profiles it loaded in a bounded [`LocalStore`](caching::LocalStore).
//! A coordination service shared by all nodes records which node holds which profile, so that
//! every profile is loaded by at most one node and requests for it can be redirected there. The
//! entry point is the [`CacheCoordinator`](caching::CacheCoordinator).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordination;
pub mod logging;
pub mod types;
