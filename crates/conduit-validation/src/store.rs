//! Resource Store capability used by the validation runner

use async_trait::async_trait;
use conduit_common::kube_utils::{apply_resource, delete_ignore_not_found};
use conduit_common::Error;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

/// Kubernetes operations a validation attempt needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ValidationStore: Send + Sync {
    /// Create or update the validation ServiceAccount
    async fn ensure_service_account(&self, account: &ServiceAccount) -> Result<(), Error>;

    /// Create or update a candidate config secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Create a validation pod; an existing pod surfaces as a Conflict error
    async fn create_pod(&self, pod: &Pod) -> Result<(), Error>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Combined log output of a pod's vector container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a pod; NotFound is success
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a secret; NotFound is success
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes implementation of [`ValidationStore`]
pub struct KubeValidationStore {
    client: Client,
}

impl KubeValidationStore {
    /// Create a store backed by `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String, Error> {
    obj.namespace().ok_or_else(|| {
        Error::invalid_resource(obj.name_any(), "validation artifacts must be namespaced")
    })
}

#[async_trait]
impl ValidationStore for KubeValidationStore {
    async fn ensure_service_account(&self, account: &ServiceAccount) -> Result<(), Error> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &namespace_of(account)?);
        apply_resource(&api, &account.name_any(), account).await?;
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let api = self.secrets(&namespace_of(secret)?);
        apply_resource(&api, &secret.name_any(), secret).await?;
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let api = self.pods(&namespace_of(pod)?);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        let params = LogParams {
            container: Some("vector".to_string()),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(name, &params).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_not_found(&self.pods(namespace), name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_not_found(&self.secrets(namespace), name).await
    }
}
