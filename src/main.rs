// ABOUTME: Entry point for the switchboard gateway — CLI, logging, and the run/restart loop.
// ABOUTME: Full restarts tear the core down and rebuild it from disk; SIGUSR1 forces one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard::agent::{AgentRuntime, ScriptedAgent};
use switchboard::gateway::GatewayState;
use switchboard::reload::SubsystemSet;
use switchboard::{GatewayCore, RestartReason};
use switchboard_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hard cap on graceful teardown before the process force-exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version, about = "Gateway control plane brokering chat networks and AI agent runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway until stopped.
    Start {
        /// Path to the TOML config file.
        #[arg(long, default_value = "switchboard.toml")]
        config: PathBuf,
        /// Validate configuration and exit without serving.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! Gateway crashed with the following error:        ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    dotenvy::dotenv().ok();

    let Cli { command } = Cli::parse();
    match command {
        Command::Start { config, dry_run } => start(&config, dry_run).await,
    }
}

async fn start(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_logging(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        bind = %config.gateway.bind,
        port = config.gateway.port,
        auth_mode = ?config.gateway.auth.mode,
        "Starting switchboard gateway"
    );

    if dry_run {
        tracing::info!(
            cron_jobs = config.cron.jobs.len(),
            heartbeat = config.heartbeat.enabled,
            gmail_hook = config.hooks.gmail.enabled,
            browser = config.browser.enabled,
            "Configuration OK"
        );
        return Ok(());
    }

    // The recorder is process-global; install it once, outside the
    // restart loop.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let agent: Arc<dyn AgentRuntime> = Arc::new(ScriptedAgent::new());

    let mut pass = 0u32;
    loop {
        let config = if pass == 0 {
            config.clone()
        } else {
            Config::load(config_path)
                .with_context(|| format!("Failed to reload {}", config_path.display()))?
        };
        pass += 1;

        match run_once(config, config_path, agent.clone(), metrics_handle.clone()).await? {
            Some(reason) => {
                tracing::info!(reason = ?reason, "Restarting gateway");
            }
            None => {
                tracing::info!("Gateway stopped");
                return Ok(());
            }
        }
    }
}

/// One pass of the gateway: build the core, serve until a restart request or
/// a shutdown signal, then tear everything down. Returns the restart reason,
/// or `None` on shutdown.
async fn run_once(
    config: Config,
    config_path: &Path,
    agent: Arc<dyn AgentRuntime>,
    metrics_handle: PrometheusHandle,
) -> Result<Option<RestartReason>> {
    let (restart_tx, mut restart_rx) = mpsc::channel(4);
    let core = GatewayCore::initialize(config, agent, restart_tx)?;
    let shutdown = CancellationToken::new();

    core.providers.start_all().await?;

    let maintenance = tokio::spawn(core.clone().maintenance_loop(shutdown.clone()));

    let subsystems = SubsystemSet::start(core.clone());
    let reload = tokio::spawn(switchboard::reload::run(
        core.clone(),
        config_path.to_path_buf(),
        subsystems,
        shutdown.clone(),
    ));

    let state = GatewayState {
        core: core.clone(),
        metrics: Some(metrics_handle),
    };
    let mut server = tokio::spawn(switchboard::gateway::run(state, shutdown.clone()));

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    let mut server_done = false;
    let outcome = tokio::select! {
        reason = restart_rx.recv() => {
            // A closed channel means the core is gone; treat it as shutdown.
            Ok(reason)
        }
        _ = sigusr1.recv() => {
            tracing::info!("SIGUSR1 received");
            Ok(Some(RestartReason::Signal))
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
            Ok(None)
        }
        _ = sigint.recv() => {
            tracing::info!("SIGINT received");
            Ok(None)
        }
        served = &mut server => {
            server_done = true;
            match served {
                Ok(Ok(())) => Ok(None),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("gateway task failed: {}", e)),
            }
        }
    };

    shutdown.cancel();
    core.providers.stop_all().await;

    // Bounded teardown: hung tasks must not block the restart loop.
    let drain = async {
        let _ = maintenance.await;
        let _ = reload.await;
        if !server_done {
            let _ = (&mut server).await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        server.abort();
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Teardown exceeded grace period, abandoning background tasks"
        );
    }

    outcome
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if let Some(directory) = &config.logging.directory {
        let appender = tracing_appender::rolling::daily(directory, "switchboard.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}
