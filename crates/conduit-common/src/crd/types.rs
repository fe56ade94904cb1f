//! Shared types used by more than one CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default Vector image for agents, aggregators and validation pods
pub const DEFAULT_VECTOR_IMAGE: &str = "timberio/vector:0.43.0-distroless-libc";

/// Default Vector API port
pub const DEFAULT_API_PORT: u16 = 8686;

/// Default Vector data directory
pub const DEFAULT_DATA_DIR: &str = "/vector-data-dir";

// =============================================================================
// Conditions
// =============================================================================

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., ConfigValid, Routed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Equal in everything but the transition timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Compare two condition lists ignoring timestamps
pub fn conditions_match(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

/// Carry the previous transition time forward for conditions whose state did not change
pub fn preserve_transition_times(previous: &[Condition], next: &mut [Condition]) {
    for condition in next.iter_mut() {
        if let Some(prev) = previous.iter().find(|p| p.same_state(condition)) {
            condition.last_transition_time = prev.last_transition_time;
        }
    }
}

/// Well-known condition types
pub mod condition_types {
    /// The last rendered configuration is valid
    pub const CONFIG_VALID: &str = "ConfigValid";
    /// Live objects run the last validated configuration
    pub const READY: &str = "Ready";
    /// The pipeline attaches to at least one workload
    pub const ROUTED: &str = "Routed";
    /// The pipeline's target does not resolve to any workload
    pub const DANGLING_REFERENCE: &str = "DanglingReference";
}

// =============================================================================
// Workload runtime
// =============================================================================

/// Vector API settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    /// Enable the Vector GraphQL API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port the API listens on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_API_PORT,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

/// Overrides applied to validation pods only
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCheckSpec {
    /// Image for the validation pod (defaults to the workload image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Extra environment for the validation pod; wins over workload env on name clash
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Runtime settings shared by every workload kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VectorRuntimeSpec {
    /// Vector container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Environment for Vector containers (live and validation pods)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Container resource requests/limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Vector API settings
    #[serde(default)]
    pub api: ApiSpec,

    /// Vector data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Validation pod overrides
    #[serde(default)]
    pub config_check: ConfigCheckSpec,
}

impl VectorRuntimeSpec {
    /// Image for live pods
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_VECTOR_IMAGE)
    }

    /// Image for validation pods
    pub fn config_check_image(&self) -> &str {
        self.config_check.image.as_deref().unwrap_or(self.image())
    }

    /// Data directory
    pub fn data_dir(&self) -> &str {
        self.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR)
    }

    /// Environment for validation pods: workload env with config-check overrides applied
    pub fn config_check_env(&self) -> Vec<EnvVar> {
        let mut merged: BTreeMap<String, EnvVar> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for var in self.env.iter().chain(self.config_check.env.iter()) {
            if !merged.contains_key(&var.name) {
                order.push(var.name.clone());
            }
            merged.insert(var.name.clone(), var.clone());
        }
        order
            .into_iter()
            .filter_map(|name| merged.remove(&name))
            .collect()
    }
}

// =============================================================================
// Workload status
// =============================================================================

/// Lifecycle phase of a managed workload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Just created, nothing rendered yet
    #[default]
    Pending,
    /// Render succeeded, validation in flight
    Validating,
    /// Last validated config is applied to live objects
    Ready,
    /// Last render or validation failed; prior config left running
    Invalid,
    /// Finalizer cleanup in progress
    Terminating,
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Validating => write!(f, "Validating"),
            Self::Ready => write!(f, "Ready"),
            Self::Invalid => write!(f, "Invalid"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Status shared by VectorAgent, VectorAggregator and ClusterVectorAggregator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Current phase
    #[serde(default)]
    pub phase: WorkloadPhase,

    /// Failure detail when Invalid (merge error or validation output)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Content hash of the configuration currently applied to live objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_hash: Option<String>,

    /// Content hash of the configuration most recently rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_hash: Option<String>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the last validation attempt finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<DateTime<Utc>>,
}

impl WorkloadStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: WorkloadPhase) -> Self {
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

    /// Equal in everything except timestamps
    pub fn same_state(&self, other: &WorkloadStatus) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.applied_hash == other.applied_hash
            && self.invalid_hash == other.invalid_hash
            && self.observed_generation == other.observed_generation
            && conditions_match(&self.conditions, &other.conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn runtime_defaults() {
        let spec = VectorRuntimeSpec::default();
        assert_eq!(spec.image(), DEFAULT_VECTOR_IMAGE);
        assert_eq!(spec.config_check_image(), DEFAULT_VECTOR_IMAGE);
        assert_eq!(spec.data_dir(), DEFAULT_DATA_DIR);
        assert!(spec.api.enabled);
        assert_eq!(spec.api.port, 8686);
    }

    #[test]
    fn config_check_image_falls_back_to_workload_image() {
        let spec = VectorRuntimeSpec {
            image: Some("registry.local/vector:1".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.config_check_image(), "registry.local/vector:1");

        let spec = VectorRuntimeSpec {
            image: Some("registry.local/vector:1".to_string()),
            config_check: ConfigCheckSpec {
                image: Some("registry.local/vector:debug".to_string()),
                env: vec![],
            },
            ..Default::default()
        };
        assert_eq!(spec.config_check_image(), "registry.local/vector:debug");
    }

    #[test]
    fn config_check_env_overrides_win_and_keep_order() {
        let spec = VectorRuntimeSpec {
            env: vec![env("A", "1"), env("B", "2")],
            config_check: ConfigCheckSpec {
                image: None,
                env: vec![env("B", "override"), env("C", "3")],
            },
            ..Default::default()
        };
        let merged = spec.config_check_env();
        let pairs: Vec<(&str, &str)> = merged
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "override"), ("C", "3")]);
    }

    #[test]
    fn runtime_spec_parses_camel_case() {
        let spec: VectorRuntimeSpec = serde_json::from_value(serde_json::json!({
            "image": "timberio/vector:0.40.0",
            "dataDir": "/data",
            "api": { "enabled": false },
            "configCheck": { "env": [{ "name": "VECTOR_LOG", "value": "debug" }] }
        }))
        .unwrap();
        assert_eq!(spec.data_dir(), "/data");
        assert!(!spec.api.enabled);
        assert_eq!(spec.api.port, 8686);
        assert_eq!(spec.config_check.env[0].name, "VECTOR_LOG");
    }

    #[test]
    fn status_comparison_ignores_timestamps() {
        let a = WorkloadStatus::with_phase(WorkloadPhase::Ready).condition(Condition::new(
            condition_types::CONFIG_VALID,
            ConditionStatus::True,
            "Validated",
            "ok",
        ));
        let mut b = a.clone();
        b.conditions[0].last_transition_time = Utc::now() + chrono::Duration::seconds(30);
        b.last_validated = Some(Utc::now());
        assert!(a.same_state(&b));

        b.applied_hash = Some("abc".to_string());
        assert!(!a.same_state(&b));
    }

    #[test]
    fn transition_times_survive_unchanged_conditions() {
        let mut old = Condition::new("Ready", ConditionStatus::True, "Applied", "ok");
        old.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        let mut next = vec![
            Condition::new("Ready", ConditionStatus::True, "Applied", "ok"),
            Condition::new("ConfigValid", ConditionStatus::True, "Validated", "ok"),
        ];
        preserve_transition_times(std::slice::from_ref(&old), &mut next);
        assert_eq!(next[0].last_transition_time, old.last_transition_time);
        assert_ne!(next[1].last_transition_time, old.last_transition_time);
    }
}
