//! VectorPipeline reconciler
//!
//! A pipeline never touches live objects. It checks its fragment on its own,
//! records which workloads it attaches to, and tells those workloads (and
//! any it detached from) to re-render.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use conduit_common::crd::{
    condition_types, preserve_transition_times, Condition, ConditionStatus, PipelinePhase,
    PipelineStatus, VectorPipeline,
};
use conduit_common::events::{actions, reasons, EventPublisher};
use conduit_common::kube_utils::{has_finalizer, FINALIZER};
use conduit_common::retry::BackoffTracker;
use conduit_common::{Error, WorkloadIdentity};
use conduit_fanout::{FanoutRouter, WorkloadInventory};
use conduit_render::{check_fragment, Fragment};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::PipelineBackend;

/// Requeue interval; dangling references are re-checked this often
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

const REASON_INVALID_FRAGMENT: &str = "InvalidFragment";
const REASON_FRAGMENT_VALID: &str = "FragmentValid";
const REASON_ROUTED: &str = "Routed";
const REASON_NO_TARGET: &str = "NoTarget";
const REASON_TARGET_MISSING: &str = "TargetMissing";
const REASON_TARGET_FOUND: &str = "TargetFound";

/// Controller context for the pipeline reconciler
pub struct Context {
    /// Status and finalizer writes
    pub backend: Arc<dyn PipelineBackend>,
    /// Workloads a pipeline may attach to
    pub inventory: Arc<dyn WorkloadInventory>,
    /// Fan-out to the workload reconcilers
    pub router: FanoutRouter,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Consecutive failures per pipeline, for the error policy
    pub backoff: BackoffTracker,
}

impl Context {
    /// Create a context
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        inventory: Arc<dyn WorkloadInventory>,
        router: FanoutRouter,
        events: Arc<dyn EventPublisher>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            backend,
            inventory,
            router,
            events,
            resync_interval,
            backoff: BackoffTracker::default(),
        }
    }
}

fn pipeline_key(pipeline: &VectorPipeline) -> String {
    format!(
        "VectorPipeline/{}/{}",
        pipeline.namespace().unwrap_or_default(),
        pipeline.name_any()
    )
}

/// Reconcile one VectorPipeline
#[instrument(
    skip(pipeline, ctx),
    fields(pipeline = %pipeline.name_any(), namespace = ?pipeline.namespace())
)]
pub async fn reconcile(pipeline: Arc<VectorPipeline>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = pipeline.namespace().ok_or_else(|| {
        Error::invalid_resource(pipeline_key(&pipeline), "VectorPipeline must be namespaced")
    })?;
    let name = pipeline.name_any();

    if pipeline.meta().deletion_timestamp.is_some() {
        return handle_deletion(&pipeline, &ctx, &namespace, &name).await;
    }

    if !has_finalizer(pipeline.as_ref(), FINALIZER) {
        info!("adding finalizer");
        ctx.backend.add_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let fragment = Fragment::from(pipeline.as_ref());
    let next = match check_fragment(&fragment) {
        Err(e) => {
            warn!(error = %e, "pipeline fragment is malformed");
            PipelineStatus {
                phase: PipelinePhase::Invalid,
                message: Some(e.to_string()),
                conditions: vec![Condition::new(
                    condition_types::CONFIG_VALID,
                    ConditionStatus::False,
                    REASON_INVALID_FRAGMENT,
                    e.to_string(),
                )],
                targets: Vec::new(),
                observed_generation: None,
            }
        }
        Ok(()) => {
            let outcome = ctx.router.route(&pipeline, ctx.inventory.as_ref()).await?;
            routed_status(outcome.targets, outcome.dangling)
        }
    };

    let previous = pipeline.status.clone();
    let patched = update_status(&ctx, &pipeline, &namespace, &name, next.clone()).await?;
    if patched {
        publish_transition(&ctx, &pipeline, previous.as_ref(), &next).await;
    }

    if needs_fanout(&pipeline, previous.as_ref(), &next) {
        let affected: BTreeSet<&WorkloadIdentity> =
            pipeline.previous_targets().iter().chain(&next.targets).collect();
        let sent = ctx.router.notify(affected).await?;
        debug!(workloads = sent, "notified dependent workloads");
    }

    ctx.backoff.reset(&pipeline_key(&pipeline));
    Ok(Action::requeue(ctx.resync_interval))
}

/// Requeue with per-object exponential backoff
pub fn error_policy(pipeline: Arc<VectorPipeline>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = pipeline_key(&pipeline);
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(&key)
    } else {
        ctx.backoff.max_delay()
    };
    error!(
        ?error,
        pipeline = %key,
        retry_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn handle_deletion(
    pipeline: &VectorPipeline,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    let key = pipeline_key(pipeline);
    if !has_finalizer(pipeline, FINALIZER) {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    info!("pipeline deleted, detaching from workloads");
    let terminating = PipelineStatus {
        phase: PipelinePhase::Terminating,
        message: None,
        ..pipeline.status.clone().unwrap_or_default()
    };
    if update_status(ctx, pipeline, namespace, name, terminating).await? {
        publish(
            ctx,
            pipeline,
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            "detaching from workloads".to_string(),
        )
        .await;
    }

    // A deleting pipeline is excluded from renders, so re-rendering its
    // targets drops its components
    let sent = ctx.router.notify(pipeline.previous_targets()).await?;
    debug!(workloads = sent, "notified detached workloads");

    ctx.backend.remove_finalizer(namespace, name).await?;
    ctx.backoff.reset(&key);
    Ok(Action::await_change())
}

fn routed_status(targets: BTreeSet<WorkloadIdentity>, dangling: Option<String>) -> PipelineStatus {
    let fragment_ok = Condition::new(
        condition_types::CONFIG_VALID,
        ConditionStatus::True,
        REASON_FRAGMENT_VALID,
        "fragment is well-formed",
    );
    let (routed, dangling_condition, message) = match dangling {
        Some(detail) => (
            Condition::new(
                condition_types::ROUTED,
                ConditionStatus::False,
                REASON_NO_TARGET,
                detail.clone(),
            ),
            Condition::new(
                condition_types::DANGLING_REFERENCE,
                ConditionStatus::True,
                REASON_TARGET_MISSING,
                detail.clone(),
            ),
            Some(detail),
        ),
        None => (
            Condition::new(
                condition_types::ROUTED,
                ConditionStatus::True,
                REASON_ROUTED,
                format!("attached to {} workload(s)", targets.len()),
            ),
            Condition::new(
                condition_types::DANGLING_REFERENCE,
                ConditionStatus::False,
                REASON_TARGET_FOUND,
                "every target exists",
            ),
            None,
        ),
    };
    PipelineStatus {
        phase: PipelinePhase::Ready,
        message,
        conditions: vec![fragment_ok, routed, dangling_condition],
        targets: targets.into_iter().collect(),
        observed_generation: None,
    }
}

/// Re-render dependents when anything they depend on may have changed
fn needs_fanout(
    pipeline: &VectorPipeline,
    previous: Option<&PipelineStatus>,
    next: &PipelineStatus,
) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            prev.observed_generation != pipeline.meta().generation
                || prev.phase != next.phase
                || prev.targets != next.targets
        }
    }
}

async fn publish_transition(
    ctx: &Context,
    pipeline: &VectorPipeline,
    previous: Option<&PipelineStatus>,
    next: &PipelineStatus,
) {
    let was_dangling =
        previous.is_some_and(|p| p.phase == PipelinePhase::Ready && p.message.is_some());
    match (next.phase, next.message.as_ref()) {
        (PipelinePhase::Invalid, Some(detail)) => {
            publish(
                ctx,
                pipeline,
                EventType::Warning,
                reasons::PIPELINE_INVALID,
                actions::RECONCILE,
                detail.clone(),
            )
            .await;
        }
        (PipelinePhase::Ready, Some(detail)) if !was_dangling => {
            publish(
                ctx,
                pipeline,
                EventType::Warning,
                reasons::DANGLING_REFERENCE,
                actions::ROUTE,
                detail.clone(),
            )
            .await;
        }
        _ => {}
    }
}

/// Patch status unless only timestamps would change; returns whether it patched
async fn update_status(
    ctx: &Context,
    pipeline: &VectorPipeline,
    namespace: &str,
    name: &str,
    mut next: PipelineStatus,
) -> Result<bool, Error> {
    next.observed_generation = pipeline.meta().generation;
    if let Some(current) = &pipeline.status {
        preserve_transition_times(&current.conditions, &mut next.conditions);
        if current.same_state(&next) {
            debug!(phase = ?next.phase, "status unchanged, skipping update");
            return Ok(false);
        }
    }
    ctx.backend.patch_status(namespace, name, &next).await?;
    Ok(true)
}

async fn publish(
    ctx: &Context,
    pipeline: &VectorPipeline,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&pipeline.object_ref(&()), type_, reason, action, Some(note))
        .await;
}
