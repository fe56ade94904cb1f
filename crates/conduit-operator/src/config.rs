//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use conduit_common::retry::RetryConfig;
use conduit_common::telemetry::LogFormat;
use conduit_validation::RunnerConfig;

/// Conduit - validates and rolls out Vector log pipelines on Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(name = "conduit-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Do not install or update CRDs at startup
    #[arg(long, env = "CONDUIT_NO_INSTALL_CRDS")]
    pub no_install_crds: bool,

    /// Kubeconfig to use instead of in-cluster or default discovery
    #[arg(long, env = "CONDUIT_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Quiet period before coalesced dependency events are delivered
    #[arg(
        long,
        env = "CONDUIT_DEBOUNCE_WINDOW_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub debounce_window_secs: u64,

    /// Outer deadline for one config validation attempt
    #[arg(
        long,
        env = "CONDUIT_CONFIG_CHECK_TIMEOUT_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub config_check_timeout_secs: u64,

    /// Periodic requeue of every managed object
    #[arg(
        long,
        env = "CONDUIT_RESYNC_INTERVAL_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub resync_interval_secs: u64,

    /// Time between validation pod phase checks
    #[arg(
        long,
        env = "CONDUIT_POLL_INTERVAL_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_secs: u64,

    /// Log output format (json or text)
    #[arg(long, env = "CONDUIT_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Debounce window
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_window_secs)
    }

    /// Resync interval
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Validation runner tunables
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            deadline: Duration::from_secs(self.config_check_timeout_secs),
            get_retry: RetryConfig::with_max_attempts(3),
        }
    }
}
