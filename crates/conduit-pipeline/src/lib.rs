//! VectorPipeline reconciliation.
//!
//! Pipelines carry configuration fragments. Their reconciler checks each
//! fragment, resolves which workloads it attaches to, and fans change
//! events out to those workloads' reconcilers.

#![deny(missing_docs)]

mod backend;
mod reconciler;

pub use backend::{KubePipelineBackend, PipelineBackend};
pub use reconciler::{error_policy, reconcile, Context, DEFAULT_RESYNC_INTERVAL};
