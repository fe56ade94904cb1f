//! Common types for conduit: CRDs, workload identity, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod identity;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use identity::{WorkloadIdentity, WorkloadKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
