//! VectorAggregator and ClusterVectorAggregator CRDs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{VectorRuntimeSpec, WorkloadStatus};

/// Name of the aggregator that `Aggregator` pipelines without a name attach to
pub const DEFAULT_AGGREGATOR_NAME: &str = "default";

fn default_replicas() -> i32 {
    1
}

/// Spec for a namespaced VectorAggregator (runs as a Deployment)
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.conduit.dev",
    version = "v1alpha1",
    kind = "VectorAggregator",
    plural = "vectoraggregators",
    shortname = "vagg",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Hash","type":"string","jsonPath":".status.appliedHash"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VectorAggregatorSpec {
    /// Vector runtime settings
    #[serde(flatten)]
    pub runtime: VectorRuntimeSpec,

    /// Number of aggregator replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

impl Default for VectorAggregatorSpec {
    fn default() -> Self {
        Self {
            runtime: VectorRuntimeSpec::default(),
            replicas: default_replicas(),
        }
    }
}

/// Spec for the cluster-scoped aggregator
///
/// There is normally exactly one. Its Deployment and supporting objects live
/// in `resourceNamespace`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.conduit.dev",
    version = "v1alpha1",
    kind = "ClusterVectorAggregator",
    plural = "clustervectoraggregators",
    shortname = "cvagg",
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.resourceNamespace"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Hash","type":"string","jsonPath":".status.appliedHash"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVectorAggregatorSpec {
    /// Namespace holding the Deployment, Service, Secret and validation pods
    pub resource_namespace: String,

    /// Vector runtime settings
    #[serde(flatten)]
    pub runtime: VectorRuntimeSpec,

    /// Number of aggregator replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}
