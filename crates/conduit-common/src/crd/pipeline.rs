//! VectorPipeline CRD: one configuration fragment
//!
//! A pipeline contributes sources, transforms and sinks to the merged
//! configuration of every workload its `target` resolves to. Component bodies
//! are opaque Vector component configs; only `type` and `inputs` are
//! interpreted by the renderer.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::identity::WorkloadIdentity;

/// Which class of workload a pipeline attaches to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetKind {
    /// VectorAgent fleet
    #[default]
    Agent,
    /// VectorAggregator in the pipeline's namespace
    Aggregator,
    /// ClusterVectorAggregator
    Cluster,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "Agent"),
            Self::Aggregator => write!(f, "Aggregator"),
            Self::Cluster => write!(f, "Cluster"),
        }
    }
}

/// Scope declaration of a pipeline
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTarget {
    /// Workload class
    #[serde(default)]
    pub kind: TargetKind,

    /// Explicit workload name; omitted means the kind's implicit scope
    /// (all agents, the namespace's `default` aggregator, or every cluster
    /// aggregator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Spec for a VectorPipeline
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "observability.conduit.dev",
    version = "v1alpha1",
    kind = "VectorPipeline",
    plural = "vectorpipelines",
    shortname = "vp",
    namespaced,
    status = "PipelineStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.kind"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VectorPipelineSpec {
    /// Where this fragment attaches
    #[serde(default)]
    pub target: PipelineTarget,

    /// Vector sources keyed by component id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, serde_json::Value>,

    /// Vector transforms keyed by component id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transforms: BTreeMap<String, serde_json::Value>,

    /// Vector sinks keyed by component id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sinks: BTreeMap<String, serde_json::Value>,
}

/// Lifecycle phase of a pipeline
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Not yet checked
    #[default]
    Pending,
    /// Fragment is well-formed and routed
    Ready,
    /// Fragment is malformed on its own
    Invalid,
    /// Finalizer cleanup in progress
    Terminating,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Invalid => write!(f, "Invalid"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Status for a VectorPipeline
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PipelinePhase,

    /// Human-readable detail (fragment error or dangling reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions (`Routed`, `DanglingReference`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Workloads this fragment currently attaches to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<WorkloadIdentity>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PipelineStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: PipelinePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Add a condition (builder style)
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Equal in everything except condition timestamps
    pub fn same_state(&self, other: &PipelineStatus) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.targets == other.targets
            && self.observed_generation == other.observed_generation
            && super::types::conditions_match(&self.conditions, &other.conditions)
    }
}

impl VectorPipeline {
    /// Whether this fragment should be merged into workload configs
    pub fn is_renderable(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self
                .status
                .as_ref()
                .is_some_and(|s| s.phase == PipelinePhase::Ready)
    }

    /// Targets recorded on the last reconcile
    pub fn previous_targets(&self) -> &[WorkloadIdentity] {
        self.status
            .as_ref()
            .map(|s| s.targets.as_slice())
            .unwrap_or_default()
    }
}
