// ABOUTME: Config reload driver — watch, debounce, load, diff, plan, apply.
// ABOUTME: Hot paths restart only the flagged subsystems; gateway paths bounce the process loop.

use crate::server::{GatewayCore, RestartReason};
use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::reload::{build_reload_plan, diff_config_paths, ReloadPlan};
use switchboard_core::Config;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEBOUNCE: Duration = Duration::from_millis(300);

/// One running background subsystem and the token that stops it.
struct Subsystem {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subsystem {
    fn start(core: &Arc<GatewayCore>, spawn: fn(Arc<GatewayCore>, CancellationToken) -> JoinHandle<()>) -> Self {
        let cancel = CancellationToken::new();
        let handle = spawn(Arc::clone(core), cancel.clone());
        Self { cancel, handle }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Subsystem task panicked during stop");
            }
        }
    }
}

/// The restartable background subsystems, owned by the reload driver so a
/// hot apply can bounce them individually.
pub struct SubsystemSet {
    core: Arc<GatewayCore>,
    cron: Subsystem,
    heartbeat: Subsystem,
    gmail: Subsystem,
    browser: Subsystem,
}

impl SubsystemSet {
    pub fn start(core: Arc<GatewayCore>) -> Self {
        let cron = Subsystem::start(&core, crate::cron::spawn);
        let heartbeat = Subsystem::start(&core, crate::heartbeat::spawn);
        let gmail = Subsystem::start(&core, crate::hooks::spawn);
        let browser = Subsystem::start(&core, crate::browser::spawn);
        Self {
            core,
            cron,
            heartbeat,
            gmail,
            browser,
        }
    }

    async fn restart_cron(&mut self) {
        tracing::info!("Restarting cron subsystem");
        let next = Subsystem::start(&self.core, crate::cron::spawn);
        std::mem::replace(&mut self.cron, next).stop().await;
    }

    async fn restart_heartbeat(&mut self) {
        tracing::info!("Restarting heartbeat subsystem");
        let next = Subsystem::start(&self.core, crate::heartbeat::spawn);
        std::mem::replace(&mut self.heartbeat, next).stop().await;
    }

    async fn restart_gmail(&mut self) {
        tracing::info!("Restarting gmail hook watcher");
        let next = Subsystem::start(&self.core, crate::hooks::spawn);
        std::mem::replace(&mut self.gmail, next).stop().await;
    }

    async fn restart_browser(&mut self) {
        tracing::info!("Restarting browser control");
        let next = Subsystem::start(&self.core, crate::browser::spawn);
        std::mem::replace(&mut self.browser, next).stop().await;
    }

    pub async fn shutdown(self) {
        self.cron.stop().await;
        self.heartbeat.stop().await;
        self.gmail.stop().await;
        self.browser.stop().await;
    }
}

/// Run the reload driver until cancelled. Watches the config file, debounces
/// bursts of filesystem events, and reconciles the live gateway against the
/// parsed result.
pub async fn run(
    core: Arc<GatewayCore>,
    config_path: PathBuf,
    mut subsystems: SubsystemSet,
    cancel: CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<()>(8);
    spawn_watcher(config_path.clone(), event_tx);

    let mut last_hash = hash_file(&config_path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = event_rx.recv() => {
                if received.is_none() {
                    tracing::warn!("Config watcher channel closed");
                    break;
                }
            }
        }

        // Editors fire several events per save; coalesce the burst.
        tokio::time::sleep(DEBOUNCE).await;
        while event_rx.try_recv().is_ok() {}

        let hash = hash_file(&config_path);
        if hash == last_hash {
            tracing::debug!("Config file touched but content unchanged");
            continue;
        }
        last_hash = hash;

        match reload_once(&core, &config_path, &mut subsystems).await {
            Ok(plan) => plan.log_summary(),
            Err(e) => {
                tracing::error!(error = %e, "Config reload failed, keeping previous config");
            }
        }
    }

    subsystems.shutdown().await;
}

/// One reconcile cycle: load the file, diff against the live config, apply.
pub async fn reload_once(
    core: &Arc<GatewayCore>,
    config_path: &Path,
    subsystems: &mut SubsystemSet,
) -> Result<ReloadPlan> {
    let next = Config::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let prev_value = core.config().to_value()?;
    let next_value = next.to_value()?;
    let changed = diff_config_paths(&prev_value, &next_value);
    if changed.is_empty() {
        return Ok(ReloadPlan::default());
    }

    let plan = build_reload_plan(&changed);
    switchboard_core::metrics::record_reload(if plan.restart_gateway {
        "restart"
    } else {
        "hot"
    });

    if plan.restart_gateway {
        // The entrypoint tears the gateway down and rebuilds it from disk;
        // the new config is picked up there, not swapped here.
        core.request_restart(RestartReason::ConfigChange);
        return Ok(plan);
    }

    core.swap_config(Arc::new(next));

    for provider in &plan.restart_providers {
        match crate::providers::ProviderId::parse(provider) {
            Some(id) => {
                if let Err(e) = core.providers.restart_provider(id).await {
                    tracing::error!(provider = %id, error = %e, "Provider restart failed");
                }
            }
            None => tracing::warn!(provider = %provider, "Reload plan names unknown provider"),
        }
    }
    if plan.restart_cron {
        subsystems.restart_cron().await;
    }
    if plan.restart_heartbeat {
        subsystems.restart_heartbeat().await;
    }
    if plan.restart_gmail_watcher {
        subsystems.restart_gmail().await;
    }
    if plan.restart_browser_control {
        subsystems.restart_browser().await;
    }

    Ok(plan)
}

/// The notify watcher runs on its own thread; its sync callback forwards a
/// unit ping into the async driver.
fn spawn_watcher(config_path: PathBuf, event_tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, path = %config_path.display(), "Failed to create config watcher");
                return;
            }
        };

        // Watch the parent directory: editors that write-and-rename replace
        // the inode, which a file-level watch loses track of.
        let target = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_path.clone());
        if let Err(e) = watcher.watch(&target, RecursiveMode::NonRecursive) {
            tracing::error!(error = %e, path = %target.display(), "Failed to watch config path");
            return;
        }
        tracing::info!(path = %config_path.display(), "Config watcher started");

        let file_name = config_path.file_name().map(|n| n.to_os_string());
        for event in rx {
            match event {
                Ok(event) => {
                    let relevant = event.paths.iter().any(|p| p.file_name() == file_name.as_deref())
                        && matches!(
                            event.kind,
                            notify::EventKind::Modify(_)
                                | notify::EventKind::Create(_)
                                | notify::EventKind::Remove(_)
                        );
                    if relevant && event_tx.blocking_send(()).is_err() {
                        // Driver gone; stop watching.
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Config watcher error"),
            }
        }
    });
}

fn hash_file(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    match std::fs::read(path) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(_) => 0u64.hash(&mut hasher),
    }
    hasher.finish()
}
