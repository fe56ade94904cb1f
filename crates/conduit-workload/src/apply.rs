//! Server-side apply and cleanup of live objects

use conduit_common::kube_utils::{apply_resource, delete_ignore_not_found};
use conduit_common::{Error, WorkloadKind};
use conduit_render::RenderedConfig;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{Api, Client};
use tracing::{debug, info};

use crate::manifests::{
    build_cluster_role, build_cluster_role_binding, build_config_secret, build_daemonset,
    build_deployment, build_service, build_service_account, ObjectNames,
};
use crate::snapshot::WorkloadSnapshot;

/// Roll `config` out to the live objects of `workload`.
///
/// The Secret is written before the pod controller so new pods never mount
/// a config older than their template hash.
pub async fn apply_live(
    client: &Client,
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
) -> Result<(), Error> {
    let owner = workload.require_owner()?;
    let names = ObjectNames::for_workload(workload);
    let ns = workload.resource_namespace.as_str();

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), ns);
    apply_resource(&accounts, &names.workload, &build_service_account(workload, owner)).await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    apply_resource(
        &secrets,
        &names.config,
        &build_config_secret(workload, config, owner),
    )
    .await?;

    match workload.identity.kind() {
        WorkloadKind::Agent => {
            let roles: Api<ClusterRole> = Api::all(client.clone());
            apply_resource(&roles, &names.cluster_role, &build_cluster_role(workload)).await?;
            let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
            apply_resource(
                &bindings,
                &names.cluster_role,
                &build_cluster_role_binding(workload),
            )
            .await?;

            let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), ns);
            apply_resource(
                &daemonsets,
                &names.workload,
                &build_daemonset(workload, config, owner),
            )
            .await?;
        }
        WorkloadKind::Aggregator | WorkloadKind::ClusterAggregator => {
            let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
            apply_resource(
                &deployments,
                &names.workload,
                &build_deployment(workload, config, owner),
            )
            .await?;

            let services: Api<Service> = Api::namespaced(client.clone(), ns);
            match build_service(workload, config, owner) {
                Some(service) => {
                    apply_resource(&services, &names.workload, &service).await?;
                }
                None => {
                    debug!(service = %names.workload, "no listening ports, removing service");
                    delete_ignore_not_found(&services, &names.workload).await?;
                }
            }
        }
    }

    info!(
        workload = %workload.identity,
        hash = %config.content_hash(),
        "applied live objects"
    );
    Ok(())
}

/// Delete every live object of `workload`; missing objects are fine
pub async fn delete_live(client: &Client, workload: &WorkloadSnapshot) -> Result<(), Error> {
    let names = ObjectNames::for_workload(workload);
    let ns = workload.resource_namespace.as_str();

    match workload.identity.kind() {
        WorkloadKind::Agent => {
            let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), ns);
            delete_ignore_not_found(&daemonsets, &names.workload).await?;
            let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
            delete_ignore_not_found(&bindings, &names.cluster_role).await?;
            let roles: Api<ClusterRole> = Api::all(client.clone());
            delete_ignore_not_found(&roles, &names.cluster_role).await?;
        }
        WorkloadKind::Aggregator | WorkloadKind::ClusterAggregator => {
            let services: Api<Service> = Api::namespaced(client.clone(), ns);
            delete_ignore_not_found(&services, &names.workload).await?;
            let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
            delete_ignore_not_found(&deployments, &names.workload).await?;
        }
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    delete_ignore_not_found(&secrets, &names.config).await?;
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), ns);
    delete_ignore_not_found(&accounts, &names.workload).await?;

    info!(workload = %workload.identity, "removed live objects");
    Ok(())
}
