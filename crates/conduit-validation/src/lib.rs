//! Validation runner for conduit
//!
//! Proves a rendered Vector config valid by executing `vector validate` in
//! an isolated pod before any live workload sees it.

#![deny(missing_docs)]

pub mod pod;
mod runner;
mod store;

pub use runner::{
    RunnerConfig, ValidationOutcome, ValidationRequest, ValidationRunner, DEFAULT_DEADLINE,
    DEFAULT_POLL_INTERVAL,
};
pub use store::{KubeValidationStore, ValidationStore};
