// ABOUTME: GatewayCore — the single shared state object constructed at process start.
// ABOUTME: Owns chat service, provider manager, bridge directory, config snapshot, and restart signal.

use crate::agent::AgentRuntime;
use crate::chat::{ChatService, EventHub};
use crate::providers::manager::ProviderManager;
use crate::providers::plugins::{self, BridgeDirectory, BridgeLink};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use switchboard_core::{Config, SessionStore};
use tokio::sync::mpsc;

/// Why the entrypoint should tear down and relaunch the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ConfigChange,
    Signal,
}

/// Shared server state. Constructed once per server generation and threaded
/// through every handler; no ambient globals.
pub struct GatewayCore {
    config: RwLock<Arc<Config>>,
    pub chat: Arc<ChatService>,
    pub providers: Arc<ProviderManager>,
    pub bridges: Arc<BridgeDirectory>,
    pub events: EventHub,
    pub sessions: SessionStore,
    restart_tx: mpsc::Sender<RestartReason>,
    started_at: Instant,
    active_connections: AtomicU64,
    next_connection_id: AtomicU64,
}

impl GatewayCore {
    /// Wire up every component from a validated config snapshot.
    pub fn initialize(
        config: Config,
        agent: Arc<dyn AgentRuntime>,
        restart_tx: mpsc::Sender<RestartReason>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let sessions = SessionStore::new(&config.session.db_path)
            .with_context(|| format!("Failed to open session store at {}", config.session.db_path))?;
        tracing::info!(db_path = %config.session.db_path, "Session store initialized");

        let events = EventHub::new();
        let bridges = Arc::new(BridgeDirectory::new());
        let link = BridgeLink::new(Arc::clone(&bridges), events.clone());
        let providers = Arc::new(ProviderManager::new(
            Arc::clone(&config),
            plugins::all(link),
            events.clone(),
        ));

        let chat = Arc::new(ChatService::new(
            agent,
            sessions.clone(),
            events.clone(),
            Duration::from_secs(config.agent.timeout_secs),
            config.agent.stop_commands.clone(),
        ));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            chat,
            providers,
            bridges,
            events,
            sessions,
            restart_tx,
            started_at: Instant::now(),
            active_connections: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
        }))
    }

    /// Current config snapshot. Handlers hold the Arc for the duration of
    /// one operation; a reload swaps the pointer, never mutates in place.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn swap_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&config);
        self.providers.update_config(config);
    }

    /// Ask the entrypoint for a full teardown-and-relaunch.
    pub fn request_restart(&self, reason: RestartReason) {
        if self.restart_tx.try_send(reason).is_err() {
            tracing::warn!("Restart already requested, ignoring duplicate");
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_opened(&self) -> u64 {
        let live = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        switchboard_core::metrics::record_connection_opened();
        switchboard_core::metrics::set_active_connections(live);
        live
    }

    pub fn connection_closed(&self) {
        let live = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        switchboard_core::metrics::record_connection_closed();
        switchboard_core::metrics::set_active_connections(live);
    }

    /// Payload for the `status` RPC.
    pub fn status(&self) -> Value {
        json!({
            "server": "switchboard",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "connections": self.active_connections.load(Ordering::Relaxed),
            "liveRuns": self.chat.live_run_count(),
            "providersRunning": self.providers.running_count(),
        })
    }

    /// Periodic maintenance loop: run sweeps until cancelled.
    pub async fn maintenance_loop(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.chat.sweep(),
            }
        }
    }
}
