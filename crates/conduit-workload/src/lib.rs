//! Workload reconciliation for VectorAgent, VectorAggregator and
//! ClusterVectorAggregator.
//!
//! The three kinds share one reconciler ([`reconcile`]) parameterized by
//! [`ManagedWorkload`]; side effects go through [`WorkloadBackend`].

#![deny(missing_docs)]

mod apply;
mod backend;
pub mod manifests;
mod reconciler;
mod snapshot;

pub use backend::{attached_fragments, KubeWorkloadBackend, RenderOutcome, WorkloadBackend};
pub use reconciler::{
    error_policy, reconcile, reconcile_workload, Context, DEFAULT_RESYNC_INTERVAL,
};
pub use snapshot::{ManagedWorkload, WorkloadSnapshot};
