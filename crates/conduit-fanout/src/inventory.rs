//! Known workloads, as seen through the Resource Store

use async_trait::async_trait;
use conduit_common::crd::{ClusterVectorAggregator, VectorAgent, VectorAggregator};
use conduit_common::{Error, WorkloadIdentity};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

/// Lists workloads a pipeline may attach to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadInventory: Send + Sync {
    /// Every VectorAgent in the cluster
    async fn agents(&self) -> Result<Vec<WorkloadIdentity>, Error>;

    /// VectorAggregators in `namespace`
    async fn aggregators(&self, namespace: &str) -> Result<Vec<WorkloadIdentity>, Error>;

    /// Every ClusterVectorAggregator
    async fn cluster_aggregators(&self) -> Result<Vec<WorkloadIdentity>, Error>;
}

/// [`WorkloadInventory`] backed by `Api::list`
pub struct KubeWorkloadInventory {
    client: Client,
}

impl KubeWorkloadInventory {
    /// Create an inventory backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadInventory for KubeWorkloadInventory {
    async fn agents(&self) -> Result<Vec<WorkloadIdentity>, Error> {
        let api: Api<VectorAgent> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .map(|a| WorkloadIdentity::agent(a.namespace().unwrap_or_default(), a.name_any()))
            .collect())
    }

    async fn aggregators(&self, namespace: &str) -> Result<Vec<WorkloadIdentity>, Error> {
        let api: Api<VectorAggregator> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .map(|a| WorkloadIdentity::aggregator(namespace, a.name_any()))
            .collect())
    }

    async fn cluster_aggregators(&self) -> Result<Vec<WorkloadIdentity>, Error> {
        let api: Api<ClusterVectorAggregator> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .map(|a| WorkloadIdentity::cluster_aggregator(a.name_any()))
            .collect())
    }
}
