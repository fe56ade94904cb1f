//! Kind-independent view of a workload CR

use std::fmt::Debug;

use conduit_common::crd::{
    ClusterVectorAggregator, VectorAgent, VectorAggregator, VectorRuntimeSpec, WorkloadStatus,
};
use conduit_common::kube_utils::{has_finalizer, owner_reference, FINALIZER};
use conduit_common::{Error, WorkloadIdentity, WorkloadKind};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Everything the reconciler needs from a workload CR
#[derive(Clone, Debug)]
pub struct WorkloadSnapshot {
    /// Identity of the CR
    pub identity: WorkloadIdentity,
    /// `metadata.generation`
    pub generation: Option<i64>,
    /// Deletion has been requested
    pub deleting: bool,
    /// Cleanup finalizer is present
    pub has_finalizer: bool,
    /// Runtime settings
    pub runtime: VectorRuntimeSpec,
    /// Deployment replicas; `None` for agents
    pub replicas: Option<i32>,
    /// Namespace that holds live objects and validation artifacts
    pub resource_namespace: String,
    /// Current status
    pub status: Option<WorkloadStatus>,
    /// Owner reference for generated objects (`None` until the CR has a uid)
    pub owner: Option<OwnerReference>,
    /// Reference for Kubernetes Events
    pub object_ref: ObjectReference,
}

impl WorkloadSnapshot {
    /// Owner reference, required before anything is generated
    pub fn require_owner(&self) -> Result<&OwnerReference, Error> {
        self.owner.as_ref().ok_or_else(|| {
            Error::invalid_resource(self.identity.to_string(), "object has no uid yet")
        })
    }
}

/// CRDs reconciled by the generic workload reconciler
pub trait ManagedWorkload:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    /// Consumer class of this CRD
    const KIND: WorkloadKind;

    /// Runtime settings
    fn runtime(&self) -> &VectorRuntimeSpec;

    /// Deployment replicas; `None` for DaemonSet workloads
    fn replicas(&self) -> Option<i32>;

    /// Namespace of live objects; defaults to the CR's own namespace
    fn resource_namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    /// Current status
    fn workload_status(&self) -> Option<&WorkloadStatus>;

    /// Identity of this CR
    fn identity(&self) -> WorkloadIdentity {
        WorkloadIdentity::new(
            Self::KIND,
            self.meta().namespace.clone().unwrap_or_default(),
            self.name_any(),
        )
    }

    /// Project into a [`WorkloadSnapshot`]
    fn snapshot(&self) -> Result<WorkloadSnapshot, Error> {
        let identity = self.identity();
        let resource_namespace = self
            .resource_namespace()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::invalid_resource(identity.to_string(), "no namespace for live objects")
            })?;
        Ok(WorkloadSnapshot {
            generation: self.meta().generation,
            deleting: self.meta().deletion_timestamp.is_some(),
            has_finalizer: has_finalizer(self, FINALIZER),
            runtime: self.runtime().clone(),
            replicas: self.replicas(),
            resource_namespace,
            status: self.workload_status().cloned(),
            owner: owner_reference(self).ok(),
            object_ref: self.object_ref(&()),
            identity,
        })
    }
}

impl ManagedWorkload for VectorAgent {
    const KIND: WorkloadKind = WorkloadKind::Agent;

    fn runtime(&self) -> &VectorRuntimeSpec {
        &self.spec.runtime
    }

    fn replicas(&self) -> Option<i32> {
        None
    }

    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

impl ManagedWorkload for VectorAggregator {
    const KIND: WorkloadKind = WorkloadKind::Aggregator;

    fn runtime(&self) -> &VectorRuntimeSpec {
        &self.spec.runtime
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.replicas)
    }

    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

impl ManagedWorkload for ClusterVectorAggregator {
    const KIND: WorkloadKind = WorkloadKind::ClusterAggregator;

    fn runtime(&self) -> &VectorRuntimeSpec {
        &self.spec.runtime
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.replicas)
    }

    fn resource_namespace(&self) -> Option<String> {
        Some(self.spec.resource_namespace.clone())
    }

    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use conduit_common::crd::{ClusterVectorAggregatorSpec, VectorAgentSpec};

    #[test]
    fn namespaced_snapshot_uses_own_namespace() {
        let snap = fixtures::aggregator(None).snapshot().unwrap();
        assert_eq!(snap.identity, WorkloadIdentity::aggregator("logging", "default"));
        assert_eq!(snap.resource_namespace, "logging");
        assert_eq!(snap.replicas, Some(1));
        assert!(snap.has_finalizer);
        assert!(!snap.deleting);
        assert_eq!(snap.generation, Some(3));
        assert_eq!(snap.require_owner().unwrap().kind, "VectorAggregator");
    }

    #[test]
    fn cluster_snapshot_uses_resource_namespace() {
        let mut cagg = ClusterVectorAggregator::new(
            "central",
            ClusterVectorAggregatorSpec {
                resource_namespace: "vector".to_string(),
                runtime: VectorRuntimeSpec::default(),
                replicas: 2,
            },
        );
        cagg.metadata.uid = Some("1".to_string());
        let snap = cagg.snapshot().unwrap();
        assert_eq!(snap.identity, WorkloadIdentity::cluster_aggregator("central"));
        assert_eq!(snap.resource_namespace, "vector");
        assert_eq!(snap.replicas, Some(2));
    }

    #[test]
    fn empty_resource_namespace_is_rejected() {
        let cagg = ClusterVectorAggregator::new(
            "central",
            ClusterVectorAggregatorSpec {
                resource_namespace: String::new(),
                runtime: VectorRuntimeSpec::default(),
                replicas: 1,
            },
        );
        let err = cagg.snapshot().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn agent_has_no_replicas_and_no_owner_without_uid() {
        let mut agent = VectorAgent::new("vector", VectorAgentSpec::default());
        agent.metadata.namespace = Some("logging".to_string());
        let snap = agent.snapshot().unwrap();
        assert_eq!(snap.replicas, None);
        assert!(snap.owner.is_none());
        assert!(snap.require_owner().is_err());
    }
}
