//! Controller wiring
//!
//! Builds one kube-runtime `Controller` per CRD. Workload controllers get a
//! second trigger source: the debounced fan-out events the pipeline
//! reconciler emits for that consumer class.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use conduit_common::crd::{ClusterVectorAggregator, VectorAgent, VectorAggregator, VectorPipeline};
use conduit_common::events::KubeEventPublisher;
use conduit_common::WorkloadIdentity;
use conduit_fanout::{
    class_channels, ClassReceivers, Debouncer, FanoutRouter, KubeWorkloadInventory,
    EVENT_CHANNEL_CAPACITY,
};
use conduit_pipeline::KubePipelineBackend;
use conduit_validation::{KubeValidationStore, RunnerConfig, ValidationRunner};
use conduit_workload::{KubeWorkloadBackend, ManagedWorkload};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Tunables shared by every controller
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Debounce window for fan-out events
    pub debounce_window: Duration,
    /// Periodic requeue interval
    pub resync_interval: Duration,
    /// Validation runner tunables
    pub runner: RunnerConfig,
}

/// Everything `main` needs to drive and then stop the operator
pub struct Controllers {
    /// Controller futures, one per CRD
    pub futures: Vec<ControllerFuture>,
    /// Debouncer tasks, stopped through the cancellation token
    pub debouncers: Vec<JoinHandle<()>>,
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build every controller and spawn the per-class debouncers
pub fn build_controllers(
    client: Client,
    settings: &ControllerSettings,
    cancel: CancellationToken,
) -> Controllers {
    let (router, raw) = class_channels();
    let (triggers, debouncers) = spawn_debouncers(raw, settings.debounce_window, &cancel);

    let mut futures = build_workload_controllers(client.clone(), settings, cancel, triggers);
    futures.push(build_pipeline_controller(client, settings, router));

    Controllers {
        futures,
        debouncers,
    }
}

/// Debounced trigger receivers, one per consumer class
struct ClassTriggers {
    agents: mpsc::Receiver<WorkloadIdentity>,
    aggregators: mpsc::Receiver<WorkloadIdentity>,
    cluster_aggregators: mpsc::Receiver<WorkloadIdentity>,
}

fn spawn_debouncers(
    raw: ClassReceivers,
    window: Duration,
    cancel: &CancellationToken,
) -> (ClassTriggers, Vec<JoinHandle<()>>) {
    let spawn = |name: &'static str, input: mpsc::Receiver<WorkloadIdentity>| {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Debouncer::new(name, window, input, tx, cancel.clone()).spawn();
        (rx, handle)
    };
    let (agents, agents_task) = spawn("agents", raw.agents);
    let (aggregators, aggregators_task) = spawn("aggregators", raw.aggregators);
    let (cluster_aggregators, cluster_task) = spawn("cluster-aggregators", raw.cluster_aggregators);
    (
        ClassTriggers {
            agents,
            aggregators,
            cluster_aggregators,
        },
        vec![agents_task, aggregators_task, cluster_task],
    )
}

/// Map debounced identities to object references of `K`
fn trigger_stream<K: ManagedWorkload>(
    rx: mpsc::Receiver<WorkloadIdentity>,
) -> impl futures::Stream<Item = ObjectRef<K>> + Send + 'static {
    ReceiverStream::new(rx).map(|id: WorkloadIdentity| {
        let obj = ObjectRef::<K>::new(id.name());
        match id.namespace_opt() {
            Some(ns) => obj.within(ns),
            None => obj,
        }
    })
}

fn build_workload_controllers(
    client: Client,
    settings: &ControllerSettings,
    cancel: CancellationToken,
    triggers: ClassTriggers,
) -> Vec<ControllerFuture> {
    let store = Arc::new(KubeValidationStore::new(client.clone()));
    let runner = ValidationRunner::new(store, settings.runner.clone(), cancel);
    let backend = Arc::new(KubeWorkloadBackend::new(client.clone(), runner));
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        "conduit-workload-controller",
    ));
    let ctx = Arc::new(conduit_workload::Context::new(
        backend,
        events,
        settings.resync_interval,
    ));

    tracing::info!("- VectorAgent controller");
    let agents: Api<VectorAgent> = Api::all(client.clone());
    let agent_ctrl = Controller::new(agents, watcher_config())
        .owns(Api::<DaemonSet>::all(client.clone()), watcher_config())
        .reconcile_on(trigger_stream(triggers.agents))
        .shutdown_on_signal()
        .run(
            conduit_workload::reconcile::<VectorAgent>,
            conduit_workload::error_policy::<VectorAgent>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("VectorAgent"));

    tracing::info!("- VectorAggregator controller");
    let aggregators: Api<VectorAggregator> = Api::all(client.clone());
    let aggregator_ctrl = Controller::new(aggregators, watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config())
        .reconcile_on(trigger_stream(triggers.aggregators))
        .shutdown_on_signal()
        .run(
            conduit_workload::reconcile::<VectorAggregator>,
            conduit_workload::error_policy::<VectorAggregator>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("VectorAggregator"));

    // Owned Deployments live in a namespace while the owner is cluster-scoped,
    // which `owns` cannot map back; drift is repaired at resync instead
    tracing::info!("- ClusterVectorAggregator controller");
    let cluster_aggregators: Api<ClusterVectorAggregator> = Api::all(client);
    let cluster_ctrl = Controller::new(cluster_aggregators, watcher_config())
        .reconcile_on(trigger_stream(triggers.cluster_aggregators))
        .shutdown_on_signal()
        .run(
            conduit_workload::reconcile::<ClusterVectorAggregator>,
            conduit_workload::error_policy::<ClusterVectorAggregator>,
            ctx,
        )
        .for_each(log_reconcile_result("ClusterVectorAggregator"));

    vec![
        Box::pin(agent_ctrl),
        Box::pin(aggregator_ctrl),
        Box::pin(cluster_ctrl),
    ]
}

fn build_pipeline_controller(
    client: Client,
    settings: &ControllerSettings,
    router: FanoutRouter,
) -> ControllerFuture {
    let ctx = Arc::new(conduit_pipeline::Context::new(
        Arc::new(KubePipelineBackend::new(client.clone())),
        Arc::new(KubeWorkloadInventory::new(client.clone())),
        router,
        Arc::new(KubeEventPublisher::new(
            client.clone(),
            "conduit-pipeline-controller",
        )),
        settings.resync_interval,
    ));

    tracing::info!("- VectorPipeline controller");
    let pipelines: Api<VectorPipeline> = Api::all(client);
    Box::pin(
        Controller::new(pipelines, watcher_config())
            .shutdown_on_signal()
            .run(
                conduit_pipeline::reconcile,
                conduit_pipeline::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("VectorPipeline")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn triggers_map_identities_to_object_refs() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(WorkloadIdentity::aggregator("logging", "default"))
            .await
            .unwrap();
        drop(tx);

        let refs: Vec<ObjectRef<VectorAggregator>> = trigger_stream(rx).collect().await;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "default");
        assert_eq!(refs[0].namespace.as_deref(), Some("logging"));
    }

    #[tokio::test]
    async fn cluster_triggers_have_no_namespace() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(WorkloadIdentity::cluster_aggregator("central"))
            .await
            .unwrap();
        drop(tx);

        let refs: Vec<ObjectRef<ClusterVectorAggregator>> = trigger_stream(rx).collect().await;
        assert_eq!(refs[0].name, "central");
        assert!(refs[0].namespace.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debouncers_stop_on_cancel() {
        let (_router, raw) = class_channels();
        let cancel = CancellationToken::new();
        let (_triggers, handles) = spawn_debouncers(raw, Duration::from_secs(10), &cancel);
        assert_eq!(handles.len(), 3);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
