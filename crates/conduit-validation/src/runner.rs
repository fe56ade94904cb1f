//! Validation runner
//!
//! Proves a rendered config valid by running `vector validate` against it in
//! a disposable pod. One attempt:
//!
//! 1. ensure the validation ServiceAccount
//! 2. delete in-flight pods of the same workload that carry another hash
//! 3. reuse the pod for this hash if it already exists, else materialize the
//!    secret and create the pod (a 409 adopts the existing pod)
//! 4. poll the pod phase until `Succeeded` or `Failed`
//! 5. on success, garbage-collect finished artifacts in the namespace
//!
//! Artifact names derive from the content hash, so concurrent reconciles of
//! identical content converge on one pod instead of racing.

use std::sync::Arc;
use std::time::Duration;

use conduit_common::kube_utils::labels;
use conduit_common::retry::{retry_with_backoff, RetryConfig};
use conduit_common::{Error, WorkloadIdentity};
use conduit_render::RenderedConfig;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::pod::{
    artifact_name, build_pod, build_secret, build_service_account, class_selector,
    config_secret_name, pod_hash, pod_phase, termination_message, workload_selector,
    ArtifactSpec, PodPhase,
};
use crate::store::ValidationStore;

/// Failure detail is capped so it fits comfortably in a status field
const MAX_DETAIL_BYTES: usize = 8 * 1024;

/// Default time between pod phase checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default outer deadline for one attempt
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

/// Terminal result of a validation attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The runtime accepted the config
    Valid,
    /// The runtime rejected the config
    Invalid {
        /// Runtime diagnostic output
        detail: String,
    },
}

/// Tunables for [`ValidationRunner`]
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Time between pod phase checks
    pub poll_interval: Duration,
    /// Outer deadline for one attempt
    pub deadline: Duration,
    /// Retry policy for each pod read while polling
    pub get_retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: DEFAULT_DEADLINE,
            get_retry: RetryConfig::with_max_attempts(3),
        }
    }
}

/// One candidate config to validate
#[derive(Clone, Debug)]
pub struct ValidationRequest<'a> {
    /// Workload the config is for
    pub workload: &'a WorkloadIdentity,
    /// Namespace the validation artifacts live in
    pub namespace: &'a str,
    /// Candidate config
    pub config: &'a RenderedConfig,
    /// Runtime image
    pub image: &'a str,
    /// Environment (workload env with config-check overrides applied)
    pub env: Vec<EnvVar>,
    /// Workload CR that owns the artifacts
    pub owner: Option<OwnerReference>,
}

impl ValidationRequest<'_> {
    fn artifact_name(&self) -> String {
        artifact_name(self.workload, self.config.content_hash())
    }
}

/// Runs validation attempts against a [`ValidationStore`]
pub struct ValidationRunner {
    store: Arc<dyn ValidationStore>,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl ValidationRunner {
    /// Create a runner; `cancel` aborts in-flight polls on shutdown
    pub fn new(
        store: Arc<dyn ValidationStore>,
        config: RunnerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    /// The outer deadline applied to each attempt
    pub fn deadline(&self) -> Duration {
        self.config.deadline
    }

    /// Validate `request.config`.
    ///
    /// `Ok(Invalid)` is a terminal verdict on the content. `Err` means the
    /// attempt could not finish (API failure, deadline, shutdown) and says
    /// nothing about the content.
    #[instrument(
        skip(self, request),
        fields(
            workload = %request.workload,
            hash = %request.config.content_hash(),
            namespace = %request.namespace
        )
    )]
    pub async fn validate(
        &self,
        request: &ValidationRequest<'_>,
    ) -> Result<ValidationOutcome, Error> {
        match tokio::time::timeout(self.config.deadline, self.attempt(request)).await {
            Ok(result) => result,
            Err(_) => {
                let name = request.artifact_name();
                warn!(
                    pod = %name,
                    deadline_secs = self.config.deadline.as_secs(),
                    "validation did not finish before deadline, discarding artifacts"
                );
                self.discard(request.namespace, &name).await;
                Err(Error::validation_timeout(
                    request.workload.to_string(),
                    self.config.deadline,
                ))
            }
        }
    }

    async fn attempt(&self, request: &ValidationRequest<'_>) -> Result<ValidationOutcome, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled("validation"));
        }
        let namespace = request.namespace;
        let name = request.artifact_name();
        let hash = request.config.content_hash();

        self.store
            .ensure_service_account(&build_service_account(namespace))
            .await?;
        self.supersede(request.workload, namespace, hash).await?;

        if self.store.get_pod(namespace, &name).await?.is_some() {
            debug!(pod = %name, "reusing validation pod for identical content");
        } else {
            self.launch(request).await?;
        }

        let outcome = self.wait_for_outcome(namespace, &name).await?;
        match &outcome {
            ValidationOutcome::Valid => {
                info!(pod = %name, "config validated");
                self.collect_garbage(request.workload, namespace, hash).await?;
            }
            ValidationOutcome::Invalid { detail } => {
                info!(pod = %name, detail = %detail, "config rejected, keeping pod for inspection");
            }
        }
        Ok(outcome)
    }

    /// Delete non-terminal pods of `workload` validating some other content
    async fn supersede(
        &self,
        workload: &WorkloadIdentity,
        namespace: &str,
        hash: &str,
    ) -> Result<(), Error> {
        let pods = self
            .store
            .list_pods(namespace, &workload_selector(workload))
            .await?;
        for pod in pods {
            if pod_hash(&pod) == Some(hash) || pod_phase(&pod).is_terminal() {
                continue;
            }
            info!(pod = %pod.name_any(), "superseding in-flight validation of older content");
            self.delete_artifact(namespace, &pod).await?;
        }
        Ok(())
    }

    async fn launch(&self, request: &ValidationRequest<'_>) -> Result<(), Error> {
        let spec = ArtifactSpec {
            workload: request.workload,
            namespace: request.namespace,
            hash: request.config.content_hash(),
            config: request.config.bytes(),
            image: request.image,
            env: &request.env,
            owner: request.owner.as_ref(),
        };
        self.store.apply_secret(&build_secret(&spec)).await?;
        match self.store.create_pod(&build_pod(&spec)).await {
            Ok(()) => {
                debug!(pod = %request.artifact_name(), "validation pod created");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(pod = %request.artifact_name(), "validation pod already exists, adopting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_outcome(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ValidationOutcome, Error> {
        loop {
            let pod = retry_with_backoff(&self.config.get_retry, "get_validation_pod", || {
                self.store.get_pod(namespace, name)
            })
            .await?
            .ok_or_else(|| {
                Error::internal_with_context(
                    "validation",
                    format!("validation pod {namespace}/{name} disappeared"),
                )
            })?;

            match pod_phase(&pod) {
                PodPhase::Succeeded => return Ok(ValidationOutcome::Valid),
                PodPhase::Failed => {
                    let detail = self.failure_detail(namespace, &pod).await?;
                    return Ok(ValidationOutcome::Invalid { detail });
                }
                phase => debug!(pod = %name, ?phase, "waiting for validation result"),
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::cancelled("validation poll")),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn failure_detail(&self, namespace: &str, pod: &Pod) -> Result<String, Error> {
        let logs = self.store.pod_logs(namespace, &pod.name_any()).await?;
        let detail = if !logs.trim().is_empty() {
            logs
        } else if let Some(message) = termination_message(pod) {
            message
        } else {
            format!(
                "validation pod {} failed without reporting a reason",
                pod.name_any()
            )
        };
        Ok(truncate(detail.trim_end().to_string(), MAX_DETAIL_BYTES))
    }

    /// Delete finished artifacts after a success.
    ///
    /// Succeeded artifacts of every workload in the namespace go, plus failed
    /// artifacts of this workload for content it has since moved past.
    async fn collect_garbage(
        &self,
        workload: &WorkloadIdentity,
        namespace: &str,
        hash: &str,
    ) -> Result<(), Error> {
        let owner_label = workload.label_value();
        let pods = self.store.list_pods(namespace, &class_selector()).await?;
        let mut removed = 0usize;
        for pod in pods {
            let stale_failure = pod_phase(&pod) == PodPhase::Failed
                && pod_hash(&pod) != Some(hash)
                && pod
                    .labels()
                    .get(labels::WORKLOAD)
                    .is_some_and(|w| *w == owner_label);
            if pod_phase(&pod) == PodPhase::Succeeded || stale_failure {
                self.delete_artifact(namespace, &pod).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "cleaned up validation artifacts");
        }
        Ok(())
    }

    async fn delete_artifact(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        if let Some(secret) = config_secret_name(pod) {
            self.store.delete_secret(namespace, &secret).await?;
        }
        self.store.delete_pod(namespace, &pod.name_any()).await
    }

    /// Best-effort removal of an abandoned attempt
    async fn discard(&self, namespace: &str, name: &str) {
        if let Err(e) = self.store.delete_pod(namespace, name).await {
            warn!(pod = %name, error = %e, "failed to delete abandoned validation pod");
        }
        if let Err(e) = self.store.delete_secret(namespace, name).await {
            warn!(secret = %name, error = %e, "failed to delete abandoned validation secret");
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str("\n[truncated]");
    s
}
