use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use dozlab_operator::client::KubeClusterClient;
use dozlab_operator::config::{BuilderDefaults, OperatorConfig, CONTROLLER_NAME};
use dozlab_operator::controllers::events::KubeEventPublisher;
use dozlab_operator::controllers::retry::RetryTracker;
use dozlab_operator::controllers::ControllerContext;
use dozlab_operator::health::{self, HealthState};
use dozlab_operator::{reaper, LabSession};

const DEFAULT_LOG_FILTER: &str = "info,dozlab_operator=debug";

#[derive(Debug, Parser)]
#[command(name = "dozlab-operator", version, about = "Kubernetes operator for Dozlab lab sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the LabSession CustomResourceDefinition as YAML
    Crd,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "DOZLAB_NAMESPACE")]
    namespace: Option<String>,

    /// Sessions reconciled concurrently
    #[arg(long, env = "DOZLAB_WORKERS", default_value_t = 8)]
    workers: u16,

    #[arg(long, env = "DOZLAB_RESYNC_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    resync_interval: Duration,

    #[arg(long, env = "DOZLAB_REAPER_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    reaper_interval: Duration,

    /// Failed -> Creating recoveries per session
    #[arg(long, env = "DOZLAB_MAX_SESSION_RETRIES", default_value_t = 3)]
    max_session_retries: u32,

    /// Consecutive API errors before a session is marked Failed
    #[arg(long, env = "DOZLAB_MAX_TRANSIENT_ATTEMPTS", default_value_t = 5)]
    max_transient_attempts: u32,

    /// Cleanup passes before termination is reported as stuck
    #[arg(long, env = "DOZLAB_GC_MAX_ATTEMPTS", default_value_t = 12)]
    gc_max_attempts: u32,

    /// Container restarts tolerated before a session is Failed
    #[arg(long, env = "DOZLAB_RESTART_BUDGET", default_value_t = 3)]
    restart_budget: i32,

    #[arg(long, env = "DOZLAB_HEALTH_PORT", default_value_t = health::DEFAULT_HEALTH_PORT)]
    health_port: u16,

    /// YAML file overriding images and size limits
    #[arg(long, env = "DOZLAB_DEFAULTS_FILE")]
    defaults_file: Option<PathBuf>,
}

impl RunArgs {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let defaults = match &self.defaults_file {
            Some(path) => BuilderDefaults::from_file(path)?,
            None => BuilderDefaults::default(),
        };
        let config = OperatorConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            resync_interval: self.resync_interval,
            reaper_interval: self.reaper_interval,
            max_session_retries: self.max_session_retries,
            max_transient_attempts: self.max_transient_attempts,
            gc_max_attempts: self.gc_max_attempts,
            container_restart_budget: self.restart_budget,
            health_port: self.health_port,
            defaults,
            ..OperatorConfig::default()
        };
        config.validate().context("Invalid operator configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Crd) = cli.command {
        print!("{}", serde_yaml::to_string(&LabSession::crd())?);
        return Ok(());
    }

    // JSON logs for production; RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("dozlab-operator starting");

    let config = cli.run.operator_config()?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        workers = config.workers,
        resync_secs = config.resync_interval.as_secs(),
        reaper_secs = config.reaper_interval.as_secs(),
        "Loaded configuration"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let cluster = Arc::new(KubeClusterClient::new(
        kube_client.clone(),
        config.namespace.clone(),
    ));
    let health_port = config.health_port;

    let ctx = Arc::new(ControllerContext {
        client: cluster.clone(),
        config: Arc::new(config),
        retry_tracker: Arc::new(RetryTracker::new()),
        events: Arc::new(KubeEventPublisher::new(kube_client.clone(), CONTROLLER_NAME)),
    });
    let health_state = Arc::new(HealthState::new(cluster));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let controller = tokio::spawn(dozlab_operator::controllers::labsession::run(
        kube_client,
        ctx.clone(),
    ));

    select! {
        result = controller => {
            // Returns once shutdown_on_signal has drained the controller
            return handle_controller_exit("LabSession", result);
        }
        _ = reaper::run(ctx.clone()) => {
            bail!("Reaper loop exited unexpectedly");
        }
        result = health::run_health_server(health_state, health_port) => {
            return Err(match result {
                Ok(()) => anyhow::anyhow!("Health server exited unexpectedly"),
                Err(e) => anyhow::Error::new(e).context("Health server failed"),
            });
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Map the controller task's exit to the process result
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            info!(controller = name, "Controller stopped");
            Ok(())
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}
