//! Workload identity: the key every fan-out event and debounce entry carries.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::deterministic_hash;

/// Hex digits of the identity hash appended to shortened names
const IDENTITY_HASH_LEN: usize = 8;

/// The three kinds of workload that execute merged configuration
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum WorkloadKind {
    /// Node-level agent fleet (DaemonSet)
    Agent,
    /// Namespaced aggregator (Deployment)
    Aggregator,
    /// Cluster-scoped aggregator (Deployment in its resource namespace)
    ClusterAggregator,
}

impl WorkloadKind {
    /// All kinds, in consumer-class order
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Agent,
        WorkloadKind::Aggregator,
        WorkloadKind::ClusterAggregator,
    ];

    /// Short token used in generated object names and labels
    pub fn short(&self) -> &'static str {
        match self {
            WorkloadKind::Agent => "agt",
            WorkloadKind::Aggregator => "agg",
            WorkloadKind::ClusterAggregator => "cagg",
        }
    }

    /// Whether workloads of this kind live in a namespace of their own
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, WorkloadKind::ClusterAggregator)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Agent => write!(f, "Agent"),
            WorkloadKind::Aggregator => write!(f, "Aggregator"),
            WorkloadKind::ClusterAggregator => write!(f, "ClusterAggregator"),
        }
    }
}

/// Uniquely addresses one managed workload.
///
/// Cluster-scoped workloads carry an empty namespace. Fields are private so
/// an identity cannot change once built.
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct WorkloadIdentity {
    kind: WorkloadKind,
    #[serde(default)]
    namespace: String,
    name: String,
}

impl WorkloadIdentity {
    /// Build an identity; the namespace is dropped for cluster-scoped kinds
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.is_namespaced() {
            namespace.into()
        } else {
            String::new()
        };
        Self {
            kind,
            namespace,
            name: name.into(),
        }
    }

    /// A VectorAgent identity
    pub fn agent(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Agent, namespace, name)
    }

    /// A VectorAggregator identity
    pub fn aggregator(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Aggregator, namespace, name)
    }

    /// A ClusterVectorAggregator identity
    pub fn cluster_aggregator(name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::ClusterAggregator, "", name)
    }

    /// Workload kind
    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    /// Namespace (empty for cluster-scoped workloads)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespace as an Option, `None` for cluster-scoped workloads
    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Coalescing key: `<kind>/<namespace>/<name>`
    pub fn debounce_key(&self) -> String {
        self.to_string()
    }

    /// Label value safe for `conduit.dev/workload`: `<short>-<name>`, max 63 chars
    pub fn label_value(&self) -> String {
        self.bounded_name("", 63)
    }

    /// `<prefix><short>-<name>` in at most `max` chars.
    ///
    /// A value that has to be shortened ends in a hash of the whole identity,
    /// so workloads whose names share a long prefix still get distinct values.
    pub fn bounded_name(&self, prefix: &str, max: usize) -> String {
        let full = format!("{}{}-{}", prefix, self.kind.short(), self.name);
        if full.len() <= max {
            return full;
        }
        let digest = deterministic_hash(&self.debounce_key());
        let keep = max.saturating_sub(IDENTITY_HASH_LEN + 1);
        let head: String = full.chars().take(keep).collect();
        format!(
            "{}-{}",
            head.trim_end_matches(&['-', '.', '_'][..]),
            &digest[..IDENTITY_HASH_LEN]
        )
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_identity_drops_namespace() {
        let id = WorkloadIdentity::new(WorkloadKind::ClusterAggregator, "ignored", "central");
        assert_eq!(id.namespace(), "");
        assert_eq!(id.namespace_opt(), None);
        assert_eq!(id, WorkloadIdentity::cluster_aggregator("central"));
    }

    #[test]
    fn debounce_key_distinguishes_kind_namespace_and_name() {
        let agent = WorkloadIdentity::agent("logging", "vector");
        let aggregator = WorkloadIdentity::aggregator("logging", "vector");
        let other_ns = WorkloadIdentity::aggregator("audit", "vector");

        assert_eq!(agent.debounce_key(), "Agent/logging/vector");
        assert_ne!(agent.debounce_key(), aggregator.debounce_key());
        assert_ne!(aggregator.debounce_key(), other_ns.debounce_key());
        assert_eq!(
            WorkloadIdentity::cluster_aggregator("central").debounce_key(),
            "ClusterAggregator//central"
        );
    }

    #[test]
    fn label_value_is_bounded() {
        let id = WorkloadIdentity::aggregator("ns", "a".repeat(80));
        let label = id.label_value();
        assert!(label.len() <= 63);
        assert!(label.starts_with("agg-"));
    }

    #[test]
    fn long_names_with_a_shared_prefix_get_distinct_labels() {
        let shared = "ingest-".repeat(10);
        let first = WorkloadIdentity::aggregator("logging", format!("{shared}eu"));
        let second = WorkloadIdentity::aggregator("logging", format!("{shared}us"));

        let (a, b) = (first.label_value(), second.label_value());
        assert_ne!(a, b);
        assert_eq!(a.len(), 63);
        assert_eq!(b.len(), 63);
        assert_eq!(a, first.label_value());
    }

    #[test]
    fn short_names_are_left_as_is() {
        let id = WorkloadIdentity::agent("logging", "vector");
        assert_eq!(id.label_value(), "agt-vector");
        assert_eq!(id.bounded_name("configcheck-", 52), "configcheck-agt-vector");
    }

    #[test]
    fn identity_round_trips_through_status_json() {
        let id = WorkloadIdentity::aggregator("logging", "default");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["kind"], "Aggregator");
        let back: WorkloadIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
