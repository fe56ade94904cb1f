//! Validation artifact construction
//!
//! Builds the ServiceAccount, Secret and Pod a validation attempt uses, and
//! reads back what the runner needs from an observed Pod.

use std::collections::BTreeMap;

use conduit_common::kube_utils::{labels, sanitize_name};
use conduit_common::WorkloadIdentity;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, Secret, SecretVolumeSource, ServiceAccount, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;

/// ServiceAccount every validation pod runs as
pub const SERVICE_ACCOUNT_NAME: &str = "conduit-configcheck";

/// Volume holding the candidate config; GC finds the secret through it
pub const CONFIG_VOLUME: &str = "config";

/// Key of the candidate config inside the secret
pub const CONFIG_KEY: &str = "config.json";

const CONFIG_MOUNT_PATH: &str = "/etc/vector";
const CONTAINER_NAME: &str = "vector";
const NAME_PREFIX: &str = "configcheck";
const HASH_SUFFIX_LEN: usize = 10;
const MAX_NAME_LEN: usize = 63;

/// Labels shared by every validation artifact of every workload
pub fn class_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
        (labels::NAME.to_string(), "vector-configcheck".to_string()),
        (labels::COMPONENT.to_string(), "ConfigCheck".to_string()),
        (labels::VECTOR_EXCLUDE.to_string(), "true".to_string()),
    ])
}

/// Labels for one attempt: class labels plus workload and content hash
pub fn artifact_labels(workload: &WorkloadIdentity, hash: &str) -> BTreeMap<String, String> {
    let mut labels = class_labels();
    labels.insert(labels::WORKLOAD.to_string(), workload.label_value());
    labels.insert(labels::CONFIG_HASH.to_string(), hash.to_string());
    labels
}

/// Selector matching every validation artifact
pub fn class_selector() -> String {
    to_selector(&class_labels())
}

/// Selector matching every validation artifact of one workload
pub fn workload_selector(workload: &WorkloadIdentity) -> String {
    let mut labels = class_labels();
    labels.insert(labels::WORKLOAD.to_string(), workload.label_value());
    to_selector(&labels)
}

fn to_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Name shared by the pod and secret of one attempt.
///
/// `configcheck-<kind>-<name>-<hash[..10]>`; the workload part is truncated
/// so the hash always survives.
pub fn artifact_name(workload: &WorkloadIdentity, hash: &str) -> String {
    let suffix: String = hash
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(HASH_SUFFIX_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    let budget = MAX_NAME_LEN - suffix.len() - 1;
    let prefix = sanitize_name(&workload.bounded_name(&format!("{NAME_PREFIX}-"), budget), budget);
    format!("{prefix}-{suffix}")
}

/// ServiceAccount for validation pods
pub fn build_service_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(class_labels()),
            ..Default::default()
        },
        automount_service_account_token: Some(false),
        ..Default::default()
    }
}

/// Everything needed to build one attempt's objects
#[derive(Clone, Debug)]
pub struct ArtifactSpec<'a> {
    /// Workload being validated
    pub workload: &'a WorkloadIdentity,
    /// Namespace the artifacts live in
    pub namespace: &'a str,
    /// Content hash of the candidate
    pub hash: &'a str,
    /// Candidate configuration bytes
    pub config: &'a [u8],
    /// Runtime image
    pub image: &'a str,
    /// Container environment
    pub env: &'a [EnvVar],
    /// Workload CR owning the artifacts
    pub owner: Option<&'a OwnerReference>,
}

impl ArtifactSpec<'_> {
    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(artifact_name(self.workload, self.hash)),
            namespace: Some(self.namespace.to_string()),
            labels: Some(artifact_labels(self.workload, self.hash)),
            owner_references: self.owner.map(|o| vec![o.clone()]),
            ..Default::default()
        }
    }
}

/// Secret carrying the candidate config
pub fn build_secret(spec: &ArtifactSpec<'_>) -> Secret {
    Secret {
        metadata: spec.metadata(),
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            ByteString(spec.config.to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Pod running `vector validate` against the secret
pub fn build_pod(spec: &ArtifactSpec<'_>) -> Pod {
    let metadata = spec.metadata();
    let secret_name = metadata.name.clone();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.to_string()),
        args: Some(vec![
            "validate".to_string(),
            "--no-environment".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}"),
        ]),
        env: (!spec.env.is_empty()).then(|| spec.env.to_vec()),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    Pod {
        metadata,
        spec: Some(PodSpec {
            service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name,
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Observed pod phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Not yet running (or phase not reported)
    Pending,
    /// Container started
    Running,
    /// Exited zero
    Succeeded,
    /// Exited non-zero
    Failed,
    /// Node lost contact
    Unknown,
}

impl PodPhase {
    /// Whether the pod reached an outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Phase of `pod`; anything unrecognized counts as pending
pub fn pod_phase(pod: &Pod) -> PodPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some("Unknown") => PodPhase::Unknown,
        _ => PodPhase::Pending,
    }
}

/// Secret mounted through the `config` volume
pub fn config_secret_name(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == CONFIG_VOLUME)?
        .secret
        .as_ref()?
        .secret_name
        .clone()
}

/// Content hash label of `pod`
pub fn pod_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(labels::CONFIG_HASH)
        .map(String::as_str)
}

/// Termination message of the vector container, if it wrote one
pub fn termination_message(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == CONTAINER_NAME)?
        .state
        .as_ref()?
        .terminated
        .as_ref()?
        .message
        .clone()
        .filter(|m| !m.trim().is_empty())
}

#[cfg(test)]
pub(crate) fn pod_in_phase(name: &str, hash: &str, phase: Option<&str>) -> Pod {
    use k8s_openapi::api::core::v1::PodStatus;

    let workload = WorkloadIdentity::aggregator("logging", "default");
    let mut pod = build_pod(&ArtifactSpec {
        workload: &workload,
        namespace: "logging",
        hash,
        config: b"{}",
        image: "timberio/vector:0.43.0-distroless-libc",
        env: &[],
        owner: None,
    });
    pod.metadata.name = Some(name.to_string());
    pod.status = Some(PodStatus {
        phase: phase.map(str::to_string),
        ..Default::default()
    });
    pod
}
