//! Pipeline status and finalizer writes

use async_trait::async_trait;
use conduit_common::crd::{PipelineStatus, VectorPipeline};
use conduit_common::kube_utils::{
    add_finalizer, patch_resource_status, remove_finalizer, FINALIZER,
};
use conduit_common::Error;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

/// Writes the pipeline reconciler makes to its own CR
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Write the status sub-resource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PipelineStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`PipelineBackend`] talking to the API server
pub struct KubePipelineBackend {
    client: Client,
}

impl KubePipelineBackend {
    /// Create a backend backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<VectorPipeline> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PipelineBackend for KubePipelineBackend {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PipelineStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<VectorPipeline>(&self.client, name, namespace, status).await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        add_finalizer(&self.api(namespace), name, FINALIZER).await
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        remove_finalizer(&self.api(namespace), name, FINALIZER).await
    }
}
