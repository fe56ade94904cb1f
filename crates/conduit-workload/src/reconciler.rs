//! Generic reconciler for the three workload kinds
//!
//! One state machine drives VectorAgent, VectorAggregator and
//! ClusterVectorAggregator; kind-specific behavior lives behind
//! [`WorkloadBackend`] and [`ManagedWorkload`].
//!
//! Live objects are only ever touched with a config whose hash the
//! validator accepted. Rejected content is remembered by hash so a resync
//! does not validate it again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conduit_common::crd::{
    condition_types, preserve_transition_times, Condition, ConditionStatus, WorkloadPhase,
    WorkloadStatus,
};
use conduit_common::events::{actions, reasons, EventPublisher};
use conduit_common::retry::BackoffTracker;
use conduit_common::Error;
use conduit_render::RenderedConfig;
use conduit_validation::ValidationOutcome;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{RenderOutcome, WorkloadBackend};
use crate::snapshot::{ManagedWorkload, WorkloadSnapshot};

/// Requeue interval for healthy and known-bad workloads
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

const REASON_MERGE_ERROR: &str = "MergeError";
const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
const REASON_VALIDATED: &str = "Validated";
const REASON_APPLIED: &str = "Applied";
const REASON_PREVIOUS_CONFIG: &str = "PreviousConfigRunning";
const REASON_NO_VALID_CONFIG: &str = "NoValidConfig";

/// Controller context for the workload reconcilers
pub struct Context {
    /// Side effects (render, validate, apply, status)
    pub backend: Arc<dyn WorkloadBackend>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Requeue interval after a reconcile that needs nothing further
    pub resync_interval: Duration,
    /// Consecutive failures per workload, for the error policy
    pub backoff: BackoffTracker,
}

impl Context {
    /// Create a context
    pub fn new(
        backend: Arc<dyn WorkloadBackend>,
        events: Arc<dyn EventPublisher>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            backend,
            events,
            resync_interval,
            backoff: BackoffTracker::default(),
        }
    }

    /// Context with a no-op event publisher and default resync
    #[cfg(test)]
    pub fn for_testing(backend: Arc<dyn WorkloadBackend>) -> Self {
        Self::new(
            backend,
            Arc::new(conduit_common::events::NoopEventPublisher),
            DEFAULT_RESYNC_INTERVAL,
        )
    }
}

/// Reconcile one workload CR of any managed kind
#[instrument(skip(obj, ctx), fields(workload = %obj.identity()))]
pub async fn reconcile<K: ManagedWorkload>(
    obj: Arc<K>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let workload = obj.snapshot()?;
    let action = reconcile_workload(&workload, &ctx).await?;
    ctx.backoff.reset(&workload.identity.debounce_key());
    Ok(action)
}

/// Requeue with per-object exponential backoff.
///
/// Errors that need a spec or code change wait the full backoff cap.
pub fn error_policy<K: ManagedWorkload>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = obj.identity().debounce_key();
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(&key)
    } else {
        ctx.backoff.max_delay()
    };
    error!(
        ?error,
        workload = %key,
        retry_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// State machine over a [`WorkloadSnapshot`]
pub async fn reconcile_workload(
    workload: &WorkloadSnapshot,
    ctx: &Context,
) -> Result<Action, Error> {
    if workload.deleting {
        return handle_deletion(workload, ctx).await;
    }

    if !workload.has_finalizer {
        info!("adding finalizer");
        ctx.backend.add_finalizer(&workload.identity).await?;
        if workload.status.is_none() {
            update_status(ctx, workload, WorkloadStatus::with_phase(WorkloadPhase::Pending))
                .await?;
        }
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let resync = Action::requeue(ctx.resync_interval);
    let current = workload.status.clone().unwrap_or_default();

    let config = match ctx.backend.render(workload).await? {
        RenderOutcome::Rendered(config) => config,
        RenderOutcome::MergeConflict(detail) => {
            warn!(%detail, "fragments cannot be merged");
            let mut status = invalid_status(&current, REASON_MERGE_ERROR, detail.clone());
            // The rejected hash no longer describes what is wrong
            status.invalid_hash = None;
            if update_status(ctx, workload, status).await? {
                publish(
                    ctx,
                    workload,
                    EventType::Warning,
                    reasons::MERGE_FAILED,
                    actions::RECONCILE,
                    detail,
                )
                .await;
            }
            return Ok(resync);
        }
    };
    let hash = config.content_hash();

    // Verdicts apply to one runtime spec; an image or env edit bumps the
    // generation and needs a fresh validation
    let same_generation = current.observed_generation == workload.generation;

    if same_generation
        && current.phase == WorkloadPhase::Invalid
        && current.invalid_hash.as_deref() == Some(hash)
    {
        debug!(%hash, "config already rejected, waiting for a change");
        return Ok(resync);
    }

    if same_generation
        && current.phase == WorkloadPhase::Ready
        && current.applied_hash.as_deref() == Some(hash)
    {
        debug!(%hash, "config unchanged, re-applying live objects");
        ctx.backend.apply(workload, &config).await?;
        update_status(ctx, workload, current).await?;
        return Ok(resync);
    }

    validate_and_apply(workload, ctx, &current, &config).await?;
    Ok(resync)
}

async fn validate_and_apply(
    workload: &WorkloadSnapshot,
    ctx: &Context,
    current: &WorkloadStatus,
    config: &RenderedConfig,
) -> Result<(), Error> {
    let hash = config.content_hash();
    let validating = WorkloadStatus {
        phase: WorkloadPhase::Validating,
        message: None,
        ..current.clone()
    };
    update_status(ctx, workload, validating).await?;

    let outcome = match ctx.backend.validate(workload, config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if matches!(e, Error::ValidationTimeout { .. }) {
                publish(
                    ctx,
                    workload,
                    EventType::Warning,
                    reasons::VALIDATION_TIMEOUT,
                    actions::VALIDATE,
                    e.to_string(),
                )
                .await;
            }
            return Err(e);
        }
    };

    match outcome {
        ValidationOutcome::Valid => {
            ctx.backend.apply(workload, config).await?;
            let status = WorkloadStatus {
                phase: WorkloadPhase::Ready,
                message: None,
                conditions: vec![
                    Condition::new(
                        condition_types::CONFIG_VALID,
                        ConditionStatus::True,
                        REASON_VALIDATED,
                        "configuration accepted by the runtime",
                    ),
                    Condition::new(
                        condition_types::READY,
                        ConditionStatus::True,
                        REASON_APPLIED,
                        format!("running configuration {hash}"),
                    ),
                ],
                applied_hash: Some(hash.to_string()),
                invalid_hash: None,
                observed_generation: None,
                last_validated: Some(Utc::now()),
            };
            update_status(ctx, workload, status).await?;
            info!(%hash, "validated configuration applied");
            publish(
                ctx,
                workload,
                EventType::Normal,
                reasons::CONFIG_APPLIED,
                actions::APPLY,
                format!("applied configuration {hash}"),
            )
            .await;
        }
        ValidationOutcome::Invalid { detail } => {
            warn!(%hash, "configuration rejected, live objects left untouched");
            let mut status = invalid_status(current, REASON_VALIDATION_FAILED, detail.clone());
            status.invalid_hash = Some(hash.to_string());
            status.last_validated = Some(Utc::now());
            update_status(ctx, workload, status).await?;
            publish(
                ctx,
                workload,
                EventType::Warning,
                reasons::CONFIG_INVALID,
                actions::VALIDATE,
                detail,
            )
            .await;
        }
    }
    Ok(())
}

async fn handle_deletion(workload: &WorkloadSnapshot, ctx: &Context) -> Result<Action, Error> {
    let key = workload.identity.debounce_key();
    if !workload.has_finalizer {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    info!("workload deleted, removing live objects");
    let terminating = WorkloadStatus {
        phase: WorkloadPhase::Terminating,
        message: None,
        ..workload.status.clone().unwrap_or_default()
    };
    if update_status(ctx, workload, terminating).await? {
        publish(
            ctx,
            workload,
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            "removing live objects".to_string(),
        )
        .await;
    }
    ctx.backend.cleanup(workload).await?;
    ctx.backend.remove_finalizer(&workload.identity).await?;
    ctx.backoff.reset(&key);
    Ok(Action::await_change())
}

/// `Invalid` status that keeps whatever config is still running
fn invalid_status(current: &WorkloadStatus, reason: &str, detail: String) -> WorkloadStatus {
    let ready = match &current.applied_hash {
        Some(hash) => Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            REASON_PREVIOUS_CONFIG,
            format!("still running configuration {hash}"),
        ),
        None => Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            REASON_NO_VALID_CONFIG,
            "no configuration has been validated yet",
        ),
    };
    WorkloadStatus {
        phase: WorkloadPhase::Invalid,
        conditions: vec![
            Condition::new(
                condition_types::CONFIG_VALID,
                ConditionStatus::False,
                reason,
                detail.clone(),
            ),
            ready,
        ],
        message: Some(detail),
        ..current.clone()
    }
}

/// Patch status unless only timestamps would change; returns whether it patched
async fn update_status(
    ctx: &Context,
    workload: &WorkloadSnapshot,
    mut next: WorkloadStatus,
) -> Result<bool, Error> {
    next.observed_generation = workload.generation;
    if let Some(current) = &workload.status {
        preserve_transition_times(&current.conditions, &mut next.conditions);
        if current.same_state(&next) {
            debug!(phase = %next.phase, "status unchanged, skipping update");
            return Ok(false);
        }
    }
    ctx.backend.patch_status(&workload.identity, &next).await?;
    Ok(true)
}

async fn publish(
    ctx: &Context,
    workload: &WorkloadSnapshot,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&workload.object_ref, type_, reason, action, Some(note))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use conduit_common::crd::VectorAggregator;
    use conduit_common::WorkloadIdentity;
    use conduit_fanout::Debouncer;
    use conduit_render::{render, BaseConfig};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::backend::MockWorkloadBackend;
    use crate::snapshot::fixtures;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("synthetic {code}"),
                reason: String::new(),
                code,
            }),
        }
    }

    /// An empty render against a data dir, so different dirs give different hashes
    fn config(data_dir: &str) -> RenderedConfig {
        render(
            &BaseConfig {
                data_dir: data_dir.to_string(),
                api_port: None,
            },
            &[],
        )
        .unwrap()
    }

    fn ready_status(applied: &RenderedConfig) -> WorkloadStatus {
        WorkloadStatus {
            phase: WorkloadPhase::Ready,
            applied_hash: Some(applied.content_hash().to_string()),
            observed_generation: Some(3),
            ..Default::default()
        }
    }

    fn snapshot(status: Option<WorkloadStatus>) -> WorkloadSnapshot {
        fixtures::aggregator(status).snapshot().unwrap()
    }

    /// Records the order of side effects and every status written
    #[derive(Clone, Default)]
    struct Capture {
        calls: Arc<Mutex<Vec<&'static str>>>,
        statuses: Arc<Mutex<Vec<WorkloadStatus>>>,
    }

    impl Capture {
        fn call(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, name: &str) -> usize {
            self.calls().iter().filter(|c| **c == name).count()
        }

        fn last_status(&self) -> Option<WorkloadStatus> {
            self.statuses.lock().unwrap().last().cloned()
        }

        fn phases(&self) -> Vec<WorkloadPhase> {
            self.statuses.lock().unwrap().iter().map(|s| s.phase).collect()
        }
    }

    /// Backend whose render returns `rendered` and validate returns `verdict`
    fn backend(
        capture: &Capture,
        rendered: RenderOutcome,
        verdict: Result<ValidationOutcome, Error>,
    ) -> MockWorkloadBackend {
        let mut mock = MockWorkloadBackend::new();
        let c = capture.clone();
        mock.expect_render().returning(move |_| {
            c.call("render");
            Ok(rendered.clone())
        });
        let c = capture.clone();
        let verdict = Mutex::new(Some(verdict));
        mock.expect_validate().returning(move |_, _| {
            c.call("validate");
            verdict
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(ValidationOutcome::Valid))
        });
        let c = capture.clone();
        mock.expect_apply().returning(move |_, _| {
            c.call("apply");
            Ok(())
        });
        let c = capture.clone();
        mock.expect_patch_status().returning(move |_, status| {
            c.call("patch_status");
            c.statuses.lock().unwrap().push(status.clone());
            Ok(())
        });
        mock
    }

    fn context(mock: MockWorkloadBackend) -> Context {
        Context::for_testing(Arc::new(mock))
    }

    /// Story: a new fragment set is validated, then rolled out
    #[tokio::test]
    async fn story_valid_config_is_applied_after_validation() {
        let capture = Capture::default();
        let candidate = config("/data/new");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(candidate.clone()),
            Ok(ValidationOutcome::Valid),
        ));

        let action = reconcile_workload(&snapshot(None), &ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));
        assert_eq!(
            capture.calls(),
            vec!["render", "patch_status", "validate", "apply", "patch_status"]
        );
        assert_eq!(
            capture.phases(),
            vec![WorkloadPhase::Validating, WorkloadPhase::Ready]
        );
        let status = capture.last_status().unwrap();
        assert_eq!(status.applied_hash.as_deref(), Some(candidate.content_hash()));
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.last_validated.is_some());
        assert!(status.message.is_none());
    }

    /// Story: two pipelines define the same component id (scenario B)
    #[tokio::test]
    async fn story_merge_conflict_marks_invalid_without_validation() {
        let capture = Capture::default();
        let ctx = context(backend(
            &capture,
            RenderOutcome::MergeConflict("component apps-ingest-out defined twice".to_string()),
            Ok(ValidationOutcome::Valid),
        ));

        let action = reconcile_workload(&snapshot(None), &ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));
        assert_eq!(capture.count("validate"), 0);
        assert_eq!(capture.count("apply"), 0);
        let status = capture.last_status().unwrap();
        assert_eq!(status.phase, WorkloadPhase::Invalid);
        assert!(!status.message.unwrap_or_default().is_empty());
        assert_eq!(status.conditions[0].reason, REASON_MERGE_ERROR);
    }

    /// Story: the runtime rejects an edit to a running aggregator (scenario C)
    ///
    /// The rejection text lands in status verbatim and the previously applied
    /// config keeps running.
    #[tokio::test]
    async fn story_rejected_config_keeps_previous_one_running() {
        let capture = Capture::default();
        let running = config("/data/old");
        let candidate = config("/data/new");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(candidate.clone()),
            Ok(ValidationOutcome::Invalid {
                detail: "error: unknown field: foo".to_string(),
            }),
        ));

        reconcile_workload(&snapshot(Some(ready_status(&running))), &ctx)
            .await
            .unwrap();

        assert_eq!(capture.count("apply"), 0);
        let status = capture.last_status().unwrap();
        assert_eq!(status.phase, WorkloadPhase::Invalid);
        assert!(status.message.unwrap().contains("unknown field: foo"));
        assert_eq!(status.applied_hash.as_deref(), Some(running.content_hash()));
        assert_eq!(status.invalid_hash.as_deref(), Some(candidate.content_hash()));
        let ready = &status.conditions[1];
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, REASON_PREVIOUS_CONFIG);
    }

    /// Story: resync finds the same rejected content again
    #[tokio::test]
    async fn story_known_bad_content_is_not_validated_again() {
        let capture = Capture::default();
        let candidate = config("/data/new");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(candidate.clone()),
            Ok(ValidationOutcome::Valid),
        ));
        let status = WorkloadStatus {
            phase: WorkloadPhase::Invalid,
            invalid_hash: Some(candidate.content_hash().to_string()),
            message: Some("unknown field: foo".to_string()),
            observed_generation: Some(3),
            ..Default::default()
        };

        let action = reconcile_workload(&snapshot(Some(status)), &ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_INTERVAL));
        assert_eq!(capture.calls(), vec!["render"]);
    }

    /// Story: an env edit on a rejected workload is validated again
    #[tokio::test]
    async fn story_runtime_edit_revalidates_rejected_content() {
        let capture = Capture::default();
        let candidate = config("/data/new");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(candidate.clone()),
            Ok(ValidationOutcome::Valid),
        ));
        let status = WorkloadStatus {
            phase: WorkloadPhase::Invalid,
            invalid_hash: Some(candidate.content_hash().to_string()),
            message: Some("missing environment variable SINK_TOKEN".to_string()),
            observed_generation: Some(2),
            ..Default::default()
        };

        reconcile_workload(&snapshot(Some(status)), &ctx)
            .await
            .unwrap();

        assert_eq!(capture.count("validate"), 1);
        let status = capture.last_status().unwrap();
        assert_eq!(status.phase, WorkloadPhase::Ready);
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.invalid_hash.is_none());
    }

    /// Story: an image bump on a running workload is validated before rollout
    #[tokio::test]
    async fn story_runtime_edit_on_ready_workload_validates_before_apply() {
        let capture = Capture::default();
        let running = config("/data/old");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(running.clone()),
            Ok(ValidationOutcome::Invalid {
                detail: "error: sink type not available in this image".to_string(),
            }),
        ));
        let status = WorkloadStatus {
            observed_generation: Some(2),
            ..ready_status(&running)
        };

        reconcile_workload(&snapshot(Some(status)), &ctx)
            .await
            .unwrap();

        assert_eq!(capture.calls(), vec!["render", "patch_status", "validate", "patch_status"]);
        let status = capture.last_status().unwrap();
        assert_eq!(status.phase, WorkloadPhase::Invalid);
        assert_eq!(status.applied_hash.as_deref(), Some(running.content_hash()));
    }

    /// Story: a rejection, then a merge conflict, then the rejected content again
    #[tokio::test]
    async fn story_rejection_resurfaces_after_merge_conflict_clears() {
        let rejected = config("/data/new");
        let status = WorkloadStatus {
            phase: WorkloadPhase::Invalid,
            invalid_hash: Some(rejected.content_hash().to_string()),
            message: Some("error: unknown field: foo".to_string()),
            observed_generation: Some(3),
            ..Default::default()
        };

        let conflict = Capture::default();
        let ctx = context(backend(
            &conflict,
            RenderOutcome::MergeConflict("component apps-ingest-out defined twice".to_string()),
            Ok(ValidationOutcome::Valid),
        ));
        reconcile_workload(&snapshot(Some(status)), &ctx)
            .await
            .unwrap();
        let after_conflict = conflict.last_status().unwrap();
        assert_eq!(after_conflict.conditions[0].reason, REASON_MERGE_ERROR);
        assert!(after_conflict.invalid_hash.is_none());

        let capture = Capture::default();
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(rejected.clone()),
            Ok(ValidationOutcome::Invalid {
                detail: "error: unknown field: foo".to_string(),
            }),
        ));
        reconcile_workload(&snapshot(Some(after_conflict)), &ctx)
            .await
            .unwrap();

        assert_eq!(capture.count("validate"), 1);
        let status = capture.last_status().unwrap();
        assert_eq!(status.conditions[0].reason, REASON_VALIDATION_FAILED);
        assert!(status.message.unwrap().contains("unknown field: foo"));
        assert_eq!(status.invalid_hash.as_deref(), Some(rejected.content_hash()));
    }

    /// Story: someone edits the live Deployment by hand
    #[tokio::test]
    async fn story_unchanged_config_is_reapplied_without_validation() {
        let capture = Capture::default();
        let running = config("/data/old");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(running.clone()),
            Ok(ValidationOutcome::Valid),
        ));

        reconcile_workload(&snapshot(Some(ready_status(&running))), &ctx)
            .await
            .unwrap();

        // Status already matches, so only the apply goes out
        assert_eq!(capture.calls(), vec!["render", "apply"]);
    }

    /// Story: a fixed config arrives after an invalid one
    #[tokio::test]
    async fn story_fixed_config_clears_invalid_state() {
        let capture = Capture::default();
        let fixed = config("/data/fixed");
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(fixed.clone()),
            Ok(ValidationOutcome::Valid),
        ));
        let status = WorkloadStatus {
            phase: WorkloadPhase::Invalid,
            invalid_hash: Some("0123456789abcdef".to_string()),
            message: Some("unknown field: foo".to_string()),
            ..Default::default()
        };

        reconcile_workload(&snapshot(Some(status)), &ctx)
            .await
            .unwrap();

        let status = capture.last_status().unwrap();
        assert_eq!(status.phase, WorkloadPhase::Ready);
        assert!(status.invalid_hash.is_none());
        assert!(status.message.is_none());
    }

    /// Story: validation cannot reach a verdict in time
    ///
    /// The content is not judged; the error goes to the error policy and no
    /// live object changes.
    #[tokio::test]
    async fn story_validation_timeout_is_retried_not_recorded_invalid() {
        let capture = Capture::default();
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(config("/data/new")),
            Err(Error::validation_timeout(
                "Aggregator/logging/default",
                Duration::from_secs(300),
            )),
        ));

        let err = reconcile_workload(&snapshot(None), &ctx)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(capture.count("apply"), 0);
        assert!(!capture.phases().contains(&WorkloadPhase::Invalid));
    }

    /// Story: the API server fails while rolling out a valid config
    #[tokio::test]
    async fn story_apply_failure_propagates_for_backoff() {
        let capture = Capture::default();
        let mut mock = MockWorkloadBackend::new();
        let candidate = config("/data/new");
        mock.expect_render()
            .returning(move |_| Ok(RenderOutcome::Rendered(candidate.clone())));
        mock.expect_validate()
            .returning(|_, _| Ok(ValidationOutcome::Valid));
        mock.expect_apply().returning(|_, _| Err(api_error(503)));
        let c = capture.clone();
        mock.expect_patch_status().returning(move |_, status| {
            c.statuses.lock().unwrap().push(status.clone());
            Ok(())
        });
        let ctx = context(mock);

        let err = reconcile_workload(&snapshot(None), &ctx).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(capture.phases(), vec![WorkloadPhase::Validating]);
    }

    /// Story: a freshly created workload gets its finalizer first
    #[tokio::test]
    async fn story_new_workload_gets_finalizer_and_pending_status() {
        let capture = Capture::default();
        let mut mock = MockWorkloadBackend::new();
        mock.expect_render().times(0);
        mock.expect_add_finalizer().times(1).returning(|_| Ok(()));
        let c = capture.clone();
        mock.expect_patch_status().returning(move |_, status| {
            c.statuses.lock().unwrap().push(status.clone());
            Ok(())
        });
        let ctx = context(mock);

        let mut workload = snapshot(None);
        workload.has_finalizer = false;
        let action = reconcile_workload(&workload, &ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert_eq!(capture.phases(), vec![WorkloadPhase::Pending]);
    }

    /// Story: a user deletes a running aggregator
    #[tokio::test]
    async fn story_deletion_cleans_up_then_drops_finalizer() {
        let capture = Capture::default();
        let mut mock = MockWorkloadBackend::new();
        mock.expect_render().times(0);
        let c = capture.clone();
        mock.expect_patch_status().returning(move |_, status| {
            c.call("patch_status");
            c.statuses.lock().unwrap().push(status.clone());
            Ok(())
        });
        let c = capture.clone();
        mock.expect_cleanup().returning(move |_| {
            c.call("cleanup");
            Ok(())
        });
        let c = capture.clone();
        mock.expect_remove_finalizer().returning(move |_| {
            c.call("remove_finalizer");
            Ok(())
        });
        let ctx = context(mock);

        let mut workload = snapshot(Some(ready_status(&config("/data/old"))));
        workload.deleting = true;
        let key = workload.identity.debounce_key();
        ctx.backoff.next_delay(&key);
        let action = reconcile_workload(&workload, &ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.backoff.failures(&key), 0);
        assert_eq!(
            capture.calls(),
            vec!["patch_status", "cleanup", "remove_finalizer"]
        );
        assert_eq!(capture.phases(), vec![WorkloadPhase::Terminating]);
    }

    /// Story: cleanup fails halfway, the finalizer must stay
    #[tokio::test]
    async fn story_failed_cleanup_keeps_finalizer() {
        let mut mock = MockWorkloadBackend::new();
        mock.expect_patch_status().returning(|_, _| Ok(()));
        mock.expect_cleanup().returning(|_| Err(api_error(500)));
        mock.expect_remove_finalizer().times(0);
        let ctx = context(mock);

        let mut workload = snapshot(None);
        workload.deleting = true;
        assert!(reconcile_workload(&workload, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn deleted_workload_without_finalizer_is_left_alone() {
        let ctx = context(MockWorkloadBackend::new());
        let mut workload = snapshot(None);
        workload.deleting = true;
        workload.has_finalizer = false;
        let action = reconcile_workload(&workload, &ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: three pipeline edits land within two seconds (scenario A)
    ///
    /// The debouncer collapses them and the aggregator goes through exactly
    /// one render, validate, apply cycle.
    #[tokio::test(start_paused = true)]
    async fn story_burst_of_edits_yields_one_cycle() {
        let capture = Capture::default();
        let ctx = context(backend(
            &capture,
            RenderOutcome::Rendered(config("/data/new")),
            Ok(ValidationOutcome::Valid),
        ));

        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let handle = Debouncer::new(
            "aggregators",
            Duration::from_secs(10),
            in_rx,
            out_tx,
            cancel.clone(),
        )
        .spawn();

        let id = WorkloadIdentity::aggregator("logging", "default");
        for _ in 0..3 {
            in_tx.send(id.clone()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(700)).await;
        }

        let emitted = out_rx.recv().await.unwrap();
        assert_eq!(emitted, id);
        reconcile_workload(&snapshot(None), &ctx).await.unwrap();

        // Nothing else arrives in the following windows
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(out_rx.try_recv().is_err());

        assert_eq!(capture.count("render"), 1);
        assert_eq!(capture.count("validate"), 1);
        assert_eq!(capture.count("apply"), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn status_update_is_skipped_when_only_timestamps_differ() {
        let base = WorkloadStatus::default();
        let current = invalid_status(&base, REASON_MERGE_ERROR, "x".to_string());
        let mut again = invalid_status(&base, REASON_MERGE_ERROR, "x".to_string());
        again.conditions[0].last_transition_time = Utc::now() + chrono::Duration::seconds(5);
        assert!(current.same_state(&again));
    }

    #[tokio::test]
    async fn unchanged_status_is_not_patched() {
        let mut mock = MockWorkloadBackend::new();
        mock.expect_patch_status().times(0);
        let ctx = context(mock);
        let status = ready_status(&config("/data/old"));
        let workload = snapshot(Some(status.clone()));
        assert!(!update_status(&ctx, &workload, status).await.unwrap());
    }

    #[test]
    fn error_policy_backs_off_transient_errors() {
        let ctx = Arc::new(context(MockWorkloadBackend::new()));
        let agg = Arc::new(fixtures::aggregator(None));
        let key = agg.identity().debounce_key();

        let first = error_policy(agg.clone(), &api_error(503), ctx.clone());
        let second = error_policy(agg.clone(), &api_error(503), ctx.clone());
        assert_ne!(first, Action::await_change());
        assert_ne!(second, Action::await_change());
        assert_eq!(ctx.backoff.failures(&key), 2);
    }

    #[test]
    fn error_policy_parks_permanent_errors_at_the_cap() {
        let ctx = Arc::new(context(MockWorkloadBackend::new()));
        let agg: Arc<VectorAggregator> = Arc::new(fixtures::aggregator(None));
        let action = error_policy(agg.clone(), &api_error(403), ctx.clone());
        assert_eq!(action, Action::requeue(ctx.backoff.max_delay()));
        assert_eq!(ctx.backoff.failures(&agg.identity().debounce_key()), 0);
    }

    #[tokio::test]
    async fn successful_reconcile_resets_backoff() {
        let capture = Capture::default();
        let ctx = Arc::new(context(backend(
            &capture,
            RenderOutcome::Rendered(config("/data/new")),
            Ok(ValidationOutcome::Valid),
        )));
        let agg = Arc::new(fixtures::aggregator(None));
        let key = agg.identity().debounce_key();
        ctx.backoff.next_delay(&key);

        reconcile(agg, ctx.clone()).await.unwrap();

        assert_eq!(ctx.backoff.failures(&key), 0);
    }
}
