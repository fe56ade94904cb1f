//! Custom Resource Definitions for the conduit operator
//!
//! All kinds live in `observability.conduit.dev/v1alpha1`.

mod agent;
mod aggregator;
mod pipeline;
mod types;

pub use agent::{VectorAgent, VectorAgentSpec};
pub use aggregator::{
    ClusterVectorAggregator, ClusterVectorAggregatorSpec, VectorAggregator, VectorAggregatorSpec,
    DEFAULT_AGGREGATOR_NAME,
};
pub use pipeline::{
    PipelinePhase, PipelineStatus, PipelineTarget, TargetKind, VectorPipeline, VectorPipelineSpec,
};
pub use types::{
    condition_types, conditions_match, preserve_transition_times, ApiSpec, Condition,
    ConditionStatus, ConfigCheckSpec, VectorRuntimeSpec, WorkloadPhase, WorkloadStatus,
    DEFAULT_API_PORT, DEFAULT_DATA_DIR, DEFAULT_VECTOR_IMAGE,
};

use kube::CustomResourceExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

/// Every CRD this operator serves, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        VectorAgent::crd(),
        VectorAggregator::crd(),
        ClusterVectorAggregator::crd(),
        VectorPipeline::crd(),
    ]
}
