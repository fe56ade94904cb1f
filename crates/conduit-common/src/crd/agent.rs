//! VectorAgent CRD: the node-level collection fleet

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{VectorRuntimeSpec, WorkloadStatus};

/// Spec for a VectorAgent
///
/// Each agent runs as a DaemonSet in its own namespace. Pipelines targeting
/// `Agent` with no name attach to every agent in the cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.conduit.dev",
    version = "v1alpha1",
    kind = "VectorAgent",
    plural = "vectoragents",
    shortname = "va",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Hash","type":"string","jsonPath":".status.appliedHash"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VectorAgentSpec {
    /// Vector runtime settings
    #[serde(flatten)]
    pub runtime: VectorRuntimeSpec,
}
