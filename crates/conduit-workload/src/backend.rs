//! Side effects of workload reconciliation behind a mockable seam

use async_trait::async_trait;
use conduit_common::crd::{
    ClusterVectorAggregator, VectorAgent, VectorAggregator, VectorPipeline, WorkloadStatus,
};
use conduit_common::kube_utils::{
    add_finalizer, patch_cluster_resource_status, patch_resource_status, remove_finalizer,
    FINALIZER,
};
use conduit_common::{Error, WorkloadIdentity, WorkloadKind};
use conduit_fanout::target_matches;
use conduit_render::{render, BaseConfig, Fragment, RenderedConfig};
use conduit_validation::{ValidationOutcome, ValidationRequest, ValidationRunner};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::apply::{apply_live, delete_live};
use crate::snapshot::WorkloadSnapshot;

/// Result of merging the fragments attached to a workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A candidate config
    Rendered(RenderedConfig),
    /// Fragments cannot be merged; the detail names the conflict
    MergeConflict(String),
}

/// Everything the workload reconciler does to the outside world
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    /// Merge every Ready pipeline attached to `workload`
    async fn render(&self, workload: &WorkloadSnapshot) -> Result<RenderOutcome, Error>;

    /// Run the runtime's own validator against `config`
    async fn validate(
        &self,
        workload: &WorkloadSnapshot,
        config: &RenderedConfig,
    ) -> Result<ValidationOutcome, Error>;

    /// Roll `config` out to the live objects
    async fn apply(&self, workload: &WorkloadSnapshot, config: &RenderedConfig)
        -> Result<(), Error>;

    /// Delete the live objects
    async fn cleanup(&self, workload: &WorkloadSnapshot) -> Result<(), Error>;

    /// Write the status sub-resource
    async fn patch_status(
        &self,
        workload: &WorkloadIdentity,
        status: &WorkloadStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, workload: &WorkloadIdentity) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, workload: &WorkloadIdentity) -> Result<(), Error>;
}

/// [`WorkloadBackend`] talking to the API server
pub struct KubeWorkloadBackend {
    client: Client,
    runner: ValidationRunner,
}

impl KubeWorkloadBackend {
    /// Create a backend; `runner` performs validation attempts
    pub fn new(client: Client, runner: ValidationRunner) -> Self {
        Self { client, runner }
    }
}

/// Pipelines contributing to `workload`, as fragments
pub fn attached_fragments(
    pipelines: &[VectorPipeline],
    workload: &WorkloadIdentity,
) -> Vec<Fragment> {
    pipelines
        .iter()
        .filter(|p| p.is_renderable())
        .filter(|p| {
            target_matches(
                &p.spec.target,
                p.namespace().as_deref().unwrap_or_default(),
                workload,
            )
        })
        .map(Fragment::from)
        .collect()
}

#[async_trait]
impl WorkloadBackend for KubeWorkloadBackend {
    async fn render(&self, workload: &WorkloadSnapshot) -> Result<RenderOutcome, Error> {
        let api: Api<VectorPipeline> = Api::all(self.client.clone());
        let pipelines = api.list(&ListParams::default()).await?;
        let fragments = attached_fragments(&pipelines.items, &workload.identity);
        debug!(
            workload = %workload.identity,
            fragments = fragments.len(),
            "collected fragments"
        );
        match render(&BaseConfig::for_runtime(&workload.runtime), &fragments) {
            Ok(config) => Ok(RenderOutcome::Rendered(config)),
            Err(e) => Ok(RenderOutcome::MergeConflict(e.to_string())),
        }
    }

    async fn validate(
        &self,
        workload: &WorkloadSnapshot,
        config: &RenderedConfig,
    ) -> Result<ValidationOutcome, Error> {
        let request = ValidationRequest {
            workload: &workload.identity,
            namespace: &workload.resource_namespace,
            config,
            image: workload.runtime.config_check_image(),
            env: workload.runtime.config_check_env(),
            owner: workload.owner.clone(),
        };
        self.runner.validate(&request).await
    }

    async fn apply(
        &self,
        workload: &WorkloadSnapshot,
        config: &RenderedConfig,
    ) -> Result<(), Error> {
        apply_live(&self.client, workload, config).await
    }

    async fn cleanup(&self, workload: &WorkloadSnapshot) -> Result<(), Error> {
        delete_live(&self.client, workload).await
    }

    async fn patch_status(
        &self,
        workload: &WorkloadIdentity,
        status: &WorkloadStatus,
    ) -> Result<(), Error> {
        let name = workload.name();
        let ns = workload.namespace();
        match workload.kind() {
            WorkloadKind::Agent => {
                patch_resource_status::<VectorAgent>(&self.client, name, ns, status).await?
            }
            WorkloadKind::Aggregator => {
                patch_resource_status::<VectorAggregator>(&self.client, name, ns, status).await?
            }
            WorkloadKind::ClusterAggregator => {
                patch_cluster_resource_status::<ClusterVectorAggregator>(&self.client, name, status)
                    .await?
            }
        }
        Ok(())
    }

    async fn add_finalizer(&self, workload: &WorkloadIdentity) -> Result<(), Error> {
        let name = workload.name();
        match workload.kind() {
            WorkloadKind::Agent => {
                let api: Api<VectorAgent> =
                    Api::namespaced(self.client.clone(), workload.namespace());
                add_finalizer(&api, name, FINALIZER).await
            }
            WorkloadKind::Aggregator => {
                let api: Api<VectorAggregator> =
                    Api::namespaced(self.client.clone(), workload.namespace());
                add_finalizer(&api, name, FINALIZER).await
            }
            WorkloadKind::ClusterAggregator => {
                let api: Api<ClusterVectorAggregator> = Api::all(self.client.clone());
                add_finalizer(&api, name, FINALIZER).await
            }
        }
    }

    async fn remove_finalizer(&self, workload: &WorkloadIdentity) -> Result<(), Error> {
        let name = workload.name();
        match workload.kind() {
            WorkloadKind::Agent => {
                let api: Api<VectorAgent> =
                    Api::namespaced(self.client.clone(), workload.namespace());
                remove_finalizer(&api, name, FINALIZER).await
            }
            WorkloadKind::Aggregator => {
                let api: Api<VectorAggregator> =
                    Api::namespaced(self.client.clone(), workload.namespace());
                remove_finalizer(&api, name, FINALIZER).await
            }
            WorkloadKind::ClusterAggregator => {
                let api: Api<ClusterVectorAggregator> = Api::all(self.client.clone());
                remove_finalizer(&api, name, FINALIZER).await
            }
        }
    }
}
