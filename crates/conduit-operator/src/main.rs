//! Conduit Operator - validated rollout of Vector log pipelines

use clap::Parser;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use conduit_common::kube_utils::create_client;
use conduit_common::telemetry::{init_telemetry, TelemetryConfig};
use conduit_operator::crds::{crd_yaml, install_crds};
use conduit_operator::shutdown::cancel_on_signal;
use conduit_operator::{build_controllers, Cli, ControllerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "conduit-operator".to_string(),
        format: cli.log_format,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if cli.no_install_crds {
        tracing::info!("Skipping CRD installation");
    } else {
        install_crds(&client).await?;
    }

    let settings = ControllerSettings {
        debounce_window: cli.debounce_window(),
        resync_interval: cli.resync_interval(),
        runner: cli.runner_config(),
    };
    tracing::info!(
        debounce_window = ?settings.debounce_window,
        resync_interval = ?settings.resync_interval,
        config_check_timeout = ?settings.runner.deadline,
        "Starting controllers"
    );

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone())
        .map_err(|e| anyhow::anyhow!("failed to register signal handlers: {}", e))?;

    let controllers = build_controllers(client, &settings, cancel.clone());
    join_all(controllers.futures).await;

    // Controllers have drained; stop debouncers and in-flight validation polls
    cancel.cancel();
    for handle in controllers.debouncers.into_iter().chain([signals]) {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task failed");
        }
    }

    tracing::info!("Conduit operator stopped");
    Ok(())
}
