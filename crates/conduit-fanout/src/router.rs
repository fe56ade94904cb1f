//! Dependency fan-out router
//!
//! Maps a pipeline's target declaration to the workloads whose merged config
//! depends on it, and pushes one event per workload into the channel of that
//! workload's consumer class.

use std::collections::BTreeSet;

use conduit_common::crd::{PipelineTarget, TargetKind, VectorPipeline, DEFAULT_AGGREGATOR_NAME};
use conduit_common::{Error, WorkloadIdentity, WorkloadKind};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::inventory::WorkloadInventory;

/// Buffer of each consumer-class channel
pub const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Result of routing one pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Workloads the pipeline attaches to
    pub targets: BTreeSet<WorkloadIdentity>,
    /// Why nothing matched, when nothing did
    pub dangling: Option<String>,
}

/// Whether a pipeline in `pipeline_namespace` with `target` attaches to `workload`
pub fn target_matches(
    target: &PipelineTarget,
    pipeline_namespace: &str,
    workload: &WorkloadIdentity,
) -> bool {
    let name_matches = |default: Option<&str>| match target.name.as_deref().or(default) {
        Some(name) => workload.name() == name,
        None => true,
    };
    match target.kind {
        TargetKind::Agent => workload.kind() == WorkloadKind::Agent && name_matches(None),
        TargetKind::Aggregator => {
            workload.kind() == WorkloadKind::Aggregator
                && workload.namespace() == pipeline_namespace
                && name_matches(Some(DEFAULT_AGGREGATOR_NAME))
        }
        TargetKind::Cluster => {
            workload.kind() == WorkloadKind::ClusterAggregator && name_matches(None)
        }
    }
}

/// Resolve `target` against a snapshot of known workloads
pub fn resolve(
    target: &PipelineTarget,
    pipeline_namespace: &str,
    candidates: &[WorkloadIdentity],
) -> RouteOutcome {
    let targets: BTreeSet<WorkloadIdentity> = candidates
        .iter()
        .filter(|w| target_matches(target, pipeline_namespace, w))
        .cloned()
        .collect();

    let dangling = targets.is_empty().then(|| match (target.kind, target.name.as_deref()) {
        (TargetKind::Agent, None) => "no VectorAgent exists in the cluster".to_string(),
        (TargetKind::Agent, Some(name)) => format!("no VectorAgent named {name} exists"),
        (TargetKind::Aggregator, name) => format!(
            "VectorAggregator {}/{} does not exist",
            pipeline_namespace,
            name.unwrap_or(DEFAULT_AGGREGATOR_NAME)
        ),
        (TargetKind::Cluster, None) => "no ClusterVectorAggregator exists".to_string(),
        (TargetKind::Cluster, Some(name)) => {
            format!("ClusterVectorAggregator {name} does not exist")
        }
    });

    RouteOutcome { targets, dangling }
}

/// Receiving ends of the three consumer-class channels
pub struct ClassReceivers {
    /// VectorAgent events
    pub agents: mpsc::Receiver<WorkloadIdentity>,
    /// VectorAggregator events
    pub aggregators: mpsc::Receiver<WorkloadIdentity>,
    /// ClusterVectorAggregator events
    pub cluster_aggregators: mpsc::Receiver<WorkloadIdentity>,
}

/// Build a router and the receivers its events arrive on
pub fn class_channels() -> (FanoutRouter, ClassReceivers) {
    let (agents_tx, agents) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (aggregators_tx, aggregators) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (cluster_tx, cluster_aggregators) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (
        FanoutRouter {
            agents: agents_tx,
            aggregators: aggregators_tx,
            cluster_aggregators: cluster_tx,
        },
        ClassReceivers {
            agents,
            aggregators,
            cluster_aggregators,
        },
    )
}

/// Routes pipelines to workloads and notifies the per-class channels
#[derive(Clone)]
pub struct FanoutRouter {
    agents: mpsc::Sender<WorkloadIdentity>,
    aggregators: mpsc::Sender<WorkloadIdentity>,
    cluster_aggregators: mpsc::Sender<WorkloadIdentity>,
}

impl FanoutRouter {
    /// Workloads `pipeline` currently attaches to
    #[instrument(skip(self, pipeline, inventory), fields(pipeline = %pipeline.name_any()))]
    pub async fn route(
        &self,
        pipeline: &VectorPipeline,
        inventory: &dyn WorkloadInventory,
    ) -> Result<RouteOutcome, Error> {
        let namespace = pipeline.namespace().unwrap_or_default();
        let target = &pipeline.spec.target;
        let candidates = match target.kind {
            TargetKind::Agent => inventory.agents().await?,
            TargetKind::Aggregator => inventory.aggregators(&namespace).await?,
            TargetKind::Cluster => inventory.cluster_aggregators().await?,
        };
        let outcome = resolve(target, &namespace, &candidates);
        debug!(
            targets = outcome.targets.len(),
            dangling = outcome.dangling.is_some(),
            "routed pipeline"
        );
        Ok(outcome)
    }

    /// Push one event per workload into its class channel; returns how many were sent
    pub async fn notify<'a, I>(&self, targets: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = &'a WorkloadIdentity>,
    {
        let mut sent = 0;
        for target in targets {
            let channel = match target.kind() {
                WorkloadKind::Agent => &self.agents,
                WorkloadKind::Aggregator => &self.aggregators,
                WorkloadKind::ClusterAggregator => &self.cluster_aggregators,
            };
            channel.send(target.clone()).await.map_err(|_| {
                Error::internal_with_context(
                    "fanout",
                    format!("{} event channel closed", target.kind()),
                )
            })?;
            sent += 1;
        }
        Ok(sent)
    }
}
