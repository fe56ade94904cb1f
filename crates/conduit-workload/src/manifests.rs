//! Live objects for a workload
//!
//! Agents run as a DaemonSet reading node logs; aggregators and cluster
//! aggregators run as a Deployment fronted by a Service. All of them mount
//! the rendered config from a Secret and carry its hash on the pod template
//! so a config change rolls the pods.

use std::collections::{BTreeMap, BTreeSet};

use conduit_common::kube_utils::{labels, sanitize_name};
use conduit_common::WorkloadKind;
use conduit_render::{listening_ports, RenderedConfig};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServiceAccount, ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::snapshot::WorkloadSnapshot;

/// Key of the config inside the workload Secret
pub const CONFIG_KEY: &str = "vector.json";

const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/etc/vector";
const DATA_VOLUME: &str = "data";
const CONTAINER_NAME: &str = "vector";
const API_PORT_NAME: &str = "api";
const MAX_NAME_LEN: usize = 63;

/// Names of every object generated for one workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectNames {
    /// DaemonSet / Deployment, ServiceAccount and Service
    pub workload: String,
    /// Secret holding the rendered config
    pub config: String,
    /// ClusterRole and ClusterRoleBinding (agents only)
    pub cluster_role: String,
}

impl ObjectNames {
    /// Names for `workload`
    pub fn for_workload(workload: &WorkloadSnapshot) -> Self {
        let identity = &workload.identity;
        let suffix = match identity.kind() {
            WorkloadKind::Agent => "agent",
            WorkloadKind::Aggregator => "aggregator",
            WorkloadKind::ClusterAggregator => "cluster-aggregator",
        };
        // Leave room for "-config"
        let base = sanitize_name(
            &format!("{}-{}", identity.name(), suffix),
            MAX_NAME_LEN - 7,
        );
        Self {
            config: format!("{base}-config"),
            cluster_role: sanitize_name(
                &format!("conduit-{}-{}", workload.resource_namespace, base),
                MAX_NAME_LEN,
            ),
            workload: base,
        }
    }
}

fn component(kind: WorkloadKind) -> &'static str {
    match kind {
        WorkloadKind::Agent => "Agent",
        WorkloadKind::Aggregator | WorkloadKind::ClusterAggregator => "Aggregator",
    }
}

/// Selector labels shared by the workload's pods and objects
pub fn selector_labels(workload: &WorkloadSnapshot) -> BTreeMap<String, String> {
    let name = match workload.identity.kind() {
        WorkloadKind::Agent => "vector-agent",
        _ => "vector-aggregator",
    };
    BTreeMap::from([
        (labels::NAME.to_string(), name.to_string()),
        (
            labels::INSTANCE.to_string(),
            workload.identity.label_value(),
        ),
    ])
}

/// Full label set for generated objects
pub fn object_labels(workload: &WorkloadSnapshot) -> BTreeMap<String, String> {
    let mut labels = selector_labels(workload);
    labels.insert(
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_VALUE.to_string(),
    );
    labels.insert(
        labels::COMPONENT.to_string(),
        component(workload.identity.kind()).to_string(),
    );
    labels.insert(
        labels::WORKLOAD.to_string(),
        workload.identity.label_value(),
    );
    labels
}

fn metadata(
    workload: &WorkloadSnapshot,
    name: &str,
    owner: Option<&OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(workload.resource_namespace.clone()),
        labels: Some(object_labels(workload)),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

/// ServiceAccount the workload's pods run as
pub fn build_service_account(workload: &WorkloadSnapshot, owner: &OwnerReference) -> ServiceAccount {
    let names = ObjectNames::for_workload(workload);
    ServiceAccount {
        metadata: metadata(workload, &names.workload, Some(owner)),
        ..Default::default()
    }
}

/// Secret carrying the rendered config
pub fn build_config_secret(
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
    owner: &OwnerReference,
) -> Secret {
    let names = ObjectNames::for_workload(workload);
    let mut meta = metadata(workload, &names.config, Some(owner));
    meta.annotations = Some(BTreeMap::from([(
        labels::CONFIG_HASH.to_string(),
        config.content_hash().to_string(),
    )]));
    Secret {
        metadata: meta,
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            ByteString(config.bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Read access the kubernetes_logs source needs.
///
/// Cluster-scoped, so it carries labels but no owner reference; cleanup
/// deletes it explicitly.
pub fn build_cluster_role(workload: &WorkloadSnapshot) -> ClusterRole {
    let names = ObjectNames::for_workload(workload);
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(names.cluster_role),
            labels: Some(object_labels(workload)),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![
                "namespaces".to_string(),
                "nodes".to_string(),
                "pods".to_string(),
            ]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Binds [`build_cluster_role`] to the agent ServiceAccount
pub fn build_cluster_role_binding(workload: &WorkloadSnapshot) -> ClusterRoleBinding {
    let names = ObjectNames::for_workload(workload);
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(names.cluster_role.clone()),
            labels: Some(object_labels(workload)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: names.cluster_role,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: names.workload,
            namespace: Some(workload.resource_namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn container_ports(workload: &WorkloadSnapshot, config: &RenderedConfig) -> Vec<ContainerPort> {
    let mut seen = BTreeSet::new();
    let mut ports = Vec::new();
    if workload.runtime.api.enabled {
        seen.insert((workload.runtime.api.port, "TCP"));
        ports.push(ContainerPort {
            name: Some(API_PORT_NAME.to_string()),
            container_port: i32::from(workload.runtime.api.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    // Aggregator sources are reachable from outside the pod
    if workload.identity.kind() != WorkloadKind::Agent {
        for port in listening_ports(config) {
            if seen.insert((port.port, port.protocol)) {
                ports.push(ContainerPort {
                    name: Some(port.port_name()),
                    container_port: i32::from(port.port),
                    protocol: Some(port.protocol.to_string()),
                    ..Default::default()
                });
            }
        }
    }
    ports
}

/// Pod template shared by DaemonSet and Deployment
fn pod_template(
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
    extra_env: Vec<EnvVar>,
    extra_volumes: Vec<(Volume, VolumeMount)>,
    data_volume: Volume,
) -> PodTemplateSpec {
    let names = ObjectNames::for_workload(workload);
    let runtime = &workload.runtime;

    let mut env = extra_env;
    env.extend(runtime.env.iter().cloned());

    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(names.config.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        data_volume,
    ];
    let mut mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH, true),
        mount(DATA_VOLUME, runtime.data_dir(), false),
    ];
    for (volume, volume_mount) in extra_volumes {
        volumes.push(volume);
        mounts.push(volume_mount);
    }

    let ports = container_ports(workload, config);
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(runtime.image().to_string()),
        args: Some(vec![
            "--config".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}"),
        ]),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: runtime.resources.clone(),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let mut pod_labels = object_labels(workload);
    // The collector must not ingest its own output
    pod_labels.insert(labels::VECTOR_EXCLUDE.to_string(), "true".to_string());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            annotations: Some(BTreeMap::from([(
                labels::CONFIG_HASH.to_string(),
                config.content_hash().to_string(),
            )])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(names.workload),
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

/// Node-level DaemonSet for a VectorAgent
pub fn build_daemonset(
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
    owner: &OwnerReference,
) -> DaemonSet {
    let names = ObjectNames::for_workload(workload);
    let env = vec![
        field_env("VECTOR_SELF_NODE_NAME", "spec.nodeName"),
        field_env("VECTOR_SELF_POD_NAME", "metadata.name"),
        field_env("VECTOR_SELF_POD_NAMESPACE", "metadata.namespace"),
    ];
    let host_mounts = vec![
        (host_path("var-log", "/var/log"), mount("var-log", "/var/log", true)),
        (
            host_path("var-lib", "/var/lib"),
            mount("var-lib", "/var/lib", true),
        ),
    ];
    // Checkpoints survive pod restarts on the same node
    let data = host_path(
        DATA_VOLUME,
        &format!(
            "/var/lib/vector/{}",
            sanitize_name(
                &format!("{}-{}", workload.resource_namespace, workload.identity.name()),
                MAX_NAME_LEN
            )
        ),
    );

    let mut template = pod_template(workload, config, env, host_mounts, data);
    if let Some(spec) = template.spec.as_mut() {
        spec.tolerations = Some(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]);
    }

    DaemonSet {
        metadata: metadata(workload, &names.workload, Some(owner)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(workload)),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment for a VectorAggregator or ClusterVectorAggregator
pub fn build_deployment(
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
    owner: &OwnerReference,
) -> Deployment {
    let names = ObjectNames::for_workload(workload);
    let data = Volume {
        name: DATA_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let template = pod_template(workload, config, Vec::new(), Vec::new(), data);

    Deployment {
        metadata: metadata(workload, &names.workload, Some(owner)),
        spec: Some(DeploymentSpec {
            replicas: Some(workload.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(workload)),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing aggregator source ports and the API.
///
/// `None` when nothing listens, in which case any old Service is removed.
pub fn build_service(
    workload: &WorkloadSnapshot,
    config: &RenderedConfig,
    owner: &OwnerReference,
) -> Option<Service> {
    let ports: Vec<ServicePort> = container_ports(workload, config)
        .into_iter()
        .map(|p| ServicePort {
            name: p.name,
            port: p.container_port,
            target_port: Some(IntOrString::Int(p.container_port)),
            protocol: p.protocol,
            ..Default::default()
        })
        .collect();
    if ports.is_empty() {
        return None;
    }

    let names = ObjectNames::for_workload(workload);
    Some(Service {
        metadata: metadata(workload, &names.workload, Some(owner)),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(workload)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{fixtures, ManagedWorkload};
    use conduit_common::crd::{VectorAgent, VectorAgentSpec};
    use conduit_common::kube_utils::FINALIZER;
    use conduit_render::{render, BaseConfig, Fragment};
    use serde_json::json;

    fn aggregator_config(sources: serde_json::Value) -> RenderedConfig {
        let fragment = Fragment {
            namespace: "apps".to_string(),
            name: "ingest".to_string(),
            sources: serde_json::from_value(sources).unwrap(),
            transforms: Default::default(),
            sinks: serde_json::from_value(json!({
                "out": { "type": "blackhole", "inputs": ["*"] }
            }))
            .unwrap(),
        };
        render(
            &BaseConfig {
                data_dir: "/vector-data-dir".to_string(),
                api_port: None,
            },
            &[fragment],
        )
        .unwrap()
    }

    fn agent_snapshot() -> WorkloadSnapshot {
        let mut agent = VectorAgent::new("vector", VectorAgentSpec::default());
        agent.metadata.namespace = Some("logging".to_string());
        agent.metadata.uid = Some("42".to_string());
        agent.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        agent.snapshot().unwrap()
    }

    #[test]
    fn object_names_are_kind_specific() {
        let names = ObjectNames::for_workload(&agent_snapshot());
        assert_eq!(names.workload, "vector-agent");
        assert_eq!(names.config, "vector-agent-config");
        assert_eq!(names.cluster_role, "conduit-logging-vector-agent");

        let agg = fixtures::aggregator(None).snapshot().unwrap();
        assert_eq!(ObjectNames::for_workload(&agg).config, "default-aggregator-config");
    }

    #[test]
    fn long_names_stay_within_dns_limits() {
        let mut snap = agent_snapshot();
        snap.identity = conduit_common::WorkloadIdentity::agent("logging", "x".repeat(80));
        let names = ObjectNames::for_workload(&snap);
        assert!(names.workload.len() <= 56);
        assert!(names.config.len() <= 63);
        assert!(names.cluster_role.len() <= 63);
    }

    #[test]
    fn daemonset_mounts_node_logs_and_rolls_on_config_change() {
        let snap = agent_snapshot();
        let owner = snap.require_owner().unwrap().clone();
        let config = aggregator_config(json!({ "logs": { "type": "kubernetes_logs" } }));
        let ds = build_daemonset(&snap, &config, &owner);

        let template = ds.spec.as_ref().unwrap().template.clone();
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations[labels::CONFIG_HASH], config.content_hash());

        let pod = template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.host_path.as_ref().is_some_and(|h| h.path == "/var/log")));
        let env = pod.containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "VECTOR_SELF_NODE_NAME"));
        assert_eq!(pod.service_account_name.as_deref(), Some("vector-agent"));
        assert_eq!(ds.metadata.owner_references.unwrap()[0].uid, "42");
    }

    #[test]
    fn agents_do_not_expose_source_ports() {
        let snap = agent_snapshot();
        let config = aggregator_config(json!({
            "syslog": { "type": "syslog", "address": "0.0.0.0:514", "mode": "udp" }
        }));
        let ports = container_ports(&snap, &config);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some(API_PORT_NAME));
    }

    #[test]
    fn deployment_uses_replicas_and_service_exposes_sources() {
        let snap = fixtures::aggregator(None).snapshot().unwrap();
        let owner = snap.require_owner().unwrap().clone();
        let config = aggregator_config(json!({
            "http": { "type": "http_server", "address": "0.0.0.0:8080" },
            "syslog": { "type": "syslog", "address": "0.0.0.0:514", "mode": "udp" }
        }));

        let deploy = build_deployment(&snap, &config, &owner);
        assert_eq!(deploy.spec.as_ref().unwrap().replicas, Some(1));

        let svc = build_service(&snap, &config, &owner).unwrap();
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().any(|p| p.port == 8686));
        assert!(ports
            .iter()
            .any(|p| p.port == 514 && p.protocol.as_deref() == Some("UDP")));
        assert!(ports.iter().any(|p| p.port == 8080));
    }

    #[test]
    fn service_is_omitted_when_nothing_listens() {
        let mut snap = fixtures::aggregator(None).snapshot().unwrap();
        snap.runtime.api.enabled = false;
        let owner = snap.require_owner().unwrap().clone();
        let config = aggregator_config(json!({ "gen": { "type": "demo_logs", "format": "json" } }));
        assert!(build_service(&snap, &config, &owner).is_none());
    }

    #[test]
    fn config_secret_carries_rendered_bytes() {
        let snap = fixtures::aggregator(None).snapshot().unwrap();
        let owner = snap.require_owner().unwrap().clone();
        let config = aggregator_config(json!({}));
        let secret = build_config_secret(&snap, &config, &owner);
        assert_eq!(secret.data.unwrap()[CONFIG_KEY].0, config.bytes());
        assert_eq!(
            secret.metadata.annotations.unwrap()[labels::CONFIG_HASH],
            config.content_hash()
        );
    }

    #[test]
    fn cluster_role_is_bound_to_agent_service_account() {
        let snap = agent_snapshot();
        let binding = build_cluster_role_binding(&snap);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, "vector-agent");
        assert_eq!(subject.namespace.as_deref(), Some("logging"));
        assert_eq!(binding.role_ref.name, build_cluster_role(&snap).metadata.name.unwrap());
    }
}
