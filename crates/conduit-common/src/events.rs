//! Kubernetes Event recording for conduit controllers.
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events on managed objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        // Event notes are capped at 1kB by the API server
        let note = note.map(|mut n| {
            if n.len() > 1024 {
                let mut cut = 1024;
                while !n.is_char_boundary(cut) {
                    cut -= 1;
                }
                n.truncate(cut);
            }
            n
        });
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Validated configuration rolled out to live objects
    pub const CONFIG_APPLIED: &str = "ConfigApplied";
    /// The runtime rejected the rendered configuration
    pub const CONFIG_INVALID: &str = "ConfigInvalid";
    /// Fragments could not be merged
    pub const MERGE_FAILED: &str = "MergeFailed";
    /// Validation did not finish before its deadline
    pub const VALIDATION_TIMEOUT: &str = "ValidationTimeout";
    /// A pipeline's target resolved to no workload
    pub const DANGLING_REFERENCE: &str = "DanglingReference";
    /// A pipeline fragment is malformed on its own
    pub const PIPELINE_INVALID: &str = "PipelineInvalid";
    /// Live objects are being removed
    pub const DELETION_STARTED: &str = "DeletionStarted";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Running a validation pod
    pub const VALIDATE: &str = "Validate";
    /// Applying live objects
    pub const APPLY: &str = "Apply";
    /// Routing a fragment to workloads
    pub const ROUTE: &str = "Route";
    /// Deleting owned resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::CONFIG_APPLIED, "ConfigApplied");
        assert_eq!(reasons::MERGE_FAILED, "MergeFailed");
        assert_eq!(reasons::DANGLING_REFERENCE, "DanglingReference");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::CONFIG_INVALID,
                actions::VALIDATE,
                Some("unknown field: foo".to_string()),
            )
            .await;
    }
}
