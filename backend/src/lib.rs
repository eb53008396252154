pub mod admission;
pub mod cli;
pub mod config;
pub mod db;
pub mod delivery;
pub mod execution;
pub mod ledger;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;
pub mod task;
pub mod user;

pub mod error;
pub mod logger;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;
