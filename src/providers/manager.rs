// ABOUTME: Provider lifecycle manager — one supervised task per (provider, account).
// ABOUTME: Idempotent start, graceful stop, merged runtime snapshots, crash isolation.

use crate::chat::EventHub;
use crate::providers::{AccountSnapshot, ProviderId, ProviderPlugin, SendReceipt, SnapshotStore, StatusHandle};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use switchboard_core::metrics;
use switchboard_core::protocol::Frame;
use switchboard_core::Config;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TaskEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<(ProviderId, String), TaskEntry>>>;

/// Owns provider supervision. Config is swapped wholesale on reload; each
/// operation reads a fresh snapshot (copy-on-read).
pub struct ProviderManager {
    config: RwLock<Arc<Config>>,
    plugins: Vec<Arc<dyn ProviderPlugin>>,
    snapshots: SnapshotStore,
    tasks: TaskMap,
    events: EventHub,
}

impl ProviderManager {
    pub fn new(config: Arc<Config>, plugins: Vec<Arc<dyn ProviderPlugin>>, events: EventHub) -> Self {
        Self {
            config: RwLock::new(config),
            plugins,
            snapshots: Default::default(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn update_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn plugin(&self, id: ProviderId) -> Option<&Arc<dyn ProviderPlugin>> {
        self.plugins.iter().find(|p| p.id() == id)
    }

    fn status_handle(&self, provider: ProviderId, account_id: &str) -> StatusHandle {
        StatusHandle::new(Arc::clone(&self.snapshots), provider, account_id.to_string())
    }

    fn task_running(&self, provider: ProviderId, account_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(provider, account_id.to_string()))
    }

    fn publish_status(&self, provider: ProviderId, account_id: &str) {
        let snapshot = self.status_handle(provider, account_id).get();
        self.events.broadcast(Frame::event(
            "provider.status",
            json!({
                "provider": provider,
                "accountId": account_id,
                "snapshot": snapshot,
            }),
        ));
    }

    /// Resolve one account id or every configured account for the provider.
    fn target_accounts(
        &self,
        plugin: &Arc<dyn ProviderPlugin>,
        config: &Config,
        account_id: Option<&str>,
    ) -> Vec<String> {
        match account_id {
            Some(id) => vec![id.to_string()],
            None => plugin.account_ids(config),
        }
    }

    /// Start supervised tasks for the provider. Already-running accounts are
    /// skipped; disabled or unconfigured accounts get a non-running snapshot
    /// with a descriptive error instead of a task.
    pub async fn start_provider(&self, id: ProviderId, account_id: Option<&str>) -> Result<()> {
        let plugin = self
            .plugin(id)
            .with_context(|| format!("unknown provider: {}", id))?
            .clone();
        let config = self.config();
        let accounts = self.target_accounts(&plugin, &config, account_id);

        for account in accounts {
            if self.task_running(id, &account) {
                tracing::debug!(provider = %id, account = %account, "Provider already running, skipping start");
                continue;
            }

            let enabled = plugin.enabled(&config);
            let configured = plugin.configured(&config, &account);
            let status = self.status_handle(id, &account);

            if !enabled || !configured {
                let reason = if !enabled { "disabled" } else { "not configured" };
                status.patch(|s| {
                    s.enabled = enabled;
                    s.configured = configured;
                    s.running = false;
                    s.connected = false;
                    s.last_error = Some(reason.to_string());
                });
                self.publish_status(id, &account);
                continue;
            }

            let cancel = CancellationToken::new();
            status.patch(|s| {
                s.enabled = true;
                s.configured = true;
                s.running = true;
                s.last_error = None;
                s.last_start_at = Some(chrono::Utc::now().to_rfc3339());
            });
            metrics::record_provider_start(id.as_str().to_string());
            tracing::info!(provider = %id, account = %account, "Starting provider task");

            let task_plugin = Arc::clone(&plugin);
            let task_cancel = cancel.clone();
            let task_status = status.clone();
            let task_config = Arc::clone(&config);
            let task_account = account.clone();
            let handle = tokio::spawn(async move {
                let result = task_plugin
                    .run(task_account, task_config, task_cancel, task_status)
                    .await;
                if let Err(e) = &result {
                    tracing::error!(provider = %task_plugin.id(), error = %e, "Provider task failed");
                }
                result.err()
            });

            // Settlement wrapper: capture the outcome, clear the running
            // flag, drop the bookkeeping entry. A panic in the inner task
            // surfaces as a JoinError here and never touches any other
            // provider's task.
            let snapshots = Arc::clone(&self.snapshots);
            let tasks = Arc::clone(&self.tasks);
            let events = self.events.clone();
            let settle_account = account.clone();
            let settle = tokio::spawn(async move {
                let error = match handle.await {
                    Ok(err) => err.map(|e| e.to_string()),
                    Err(join_err) => {
                        metrics::record_provider_crash(id.as_str().to_string());
                        Some(format!("provider task panicked: {}", join_err))
                    }
                };
                tasks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(id, settle_account.clone()));
                let handle = StatusHandle::new(snapshots, id, settle_account.clone());
                handle.patch(|s| {
                    s.running = false;
                    s.connected = false;
                    s.last_stop_at = Some(chrono::Utc::now().to_rfc3339());
                    if let Some(error) = error {
                        s.last_error = Some(error);
                    }
                });
                events.broadcast(Frame::event(
                    "provider.status",
                    json!({
                        "provider": id,
                        "accountId": settle_account,
                        "snapshot": handle.get(),
                    }),
                ));
            });

            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.insert(
                (id, account.clone()),
                TaskEntry {
                    cancel,
                    handle: settle,
                },
            );
            // The settle wrapper may have already finished and missed its
            // own entry; re-check so a finished task never lingers.
            if let Some(entry) = tasks.get(&(id, account.clone())) {
                if entry.handle.is_finished() {
                    tasks.remove(&(id, account.clone()));
                }
            }
            drop(tasks);
            self.publish_status(id, &account);
        }

        metrics::set_providers_running(self.running_count() as u64);
        Ok(())
    }

    /// Stop the matching account task(s): cancel, run the plugin's stop hook,
    /// await settlement swallowing failures, publish a non-running snapshot.
    pub async fn stop_provider(&self, id: ProviderId, account_id: Option<&str>) -> Result<()> {
        let plugin = self
            .plugin(id)
            .with_context(|| format!("unknown provider: {}", id))?
            .clone();
        let config = self.config();

        // Target both live bookkeeping and the configured account list so a
        // stop reaches tasks whose account was removed from config.
        let mut accounts = self.target_accounts(&plugin, &config, account_id);
        if account_id.is_none() {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for (provider, account) in tasks.keys() {
                if *provider == id && !accounts.contains(account) {
                    accounts.push(account.clone());
                }
            }
        }

        for account in accounts {
            let entry = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(id, account.clone()));

            let Some(entry) = entry else {
                self.status_handle(id, &account).patch(|s| {
                    s.running = false;
                    s.connected = false;
                });
                continue;
            };

            tracing::info!(provider = %id, account = %account, "Stopping provider task");
            entry.cancel.cancel();
            let status = self.status_handle(id, &account);
            if let Err(e) = plugin.stop_hook(&account, &status).await {
                tracing::warn!(provider = %id, error = %e, "Provider stop hook failed");
            }
            if let Err(e) = entry.handle.await {
                tracing::warn!(provider = %id, error = %e, "Provider task settlement failed");
            }
            self.publish_status(id, &account);
        }

        metrics::set_providers_running(self.running_count() as u64);
        Ok(())
    }

    pub async fn restart_provider(&self, id: ProviderId) -> Result<()> {
        self.stop_provider(id, None).await?;
        self.start_provider(id, None).await
    }

    /// Start every enabled provider.
    pub async fn start_all(&self) -> Result<()> {
        let config = self.config();
        for plugin in &self.plugins {
            if plugin.enabled(&config) {
                self.start_provider(plugin.id(), None).await?;
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = self.stop_provider(plugin.id(), None).await {
                tracing::warn!(provider = %plugin.id(), error = %e, "Failed to stop provider");
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stamp inbound activity reported by a connector.
    pub fn note_inbound(&self, id: ProviderId, account_id: &str) {
        self.status_handle(id, account_id).mark_inbound();
    }

    /// Flip a snapshot to logged-out without touching task bookkeeping. Used
    /// when a credential invalidation is detected out of band.
    pub fn mark_logged_out(&self, id: ProviderId, account_id: &str) {
        self.status_handle(id, account_id).patch(|s| {
            s.connected = false;
            s.last_error = Some("logged out".to_string());
        });
        self.publish_status(id, account_id);
    }

    pub async fn logout(&self, id: ProviderId, account_id: &str) -> Result<Value> {
        let plugin = self
            .plugin(id)
            .with_context(|| format!("unknown provider: {}", id))?
            .clone();
        let cleared = plugin.logout(account_id).await.unwrap_or(false);
        self.mark_logged_out(id, account_id);
        Ok(json!({
            "provider": id,
            "accountId": account_id,
            "cleared": cleared,
            "loggedOut": true,
        }))
    }

    /// Deliver one outbound message. Provider defaults to the only enabled
    /// one; account defaults to the provider's default account.
    pub async fn send(
        &self,
        provider: Option<ProviderId>,
        account_id: Option<&str>,
        to: &str,
        message: &str,
    ) -> Result<SendReceipt> {
        let config = self.config();
        let plugin = match provider {
            Some(id) => self
                .plugin(id)
                .with_context(|| format!("unknown provider: {}", id))?
                .clone(),
            None => {
                let mut enabled = self.plugins.iter().filter(|p| p.enabled(&config));
                let first = enabled
                    .next()
                    .context("no provider is enabled")?
                    .clone();
                if enabled.next().is_some() {
                    anyhow::bail!("multiple providers enabled; specify one");
                }
                first
            }
        };
        let account = account_id
            .map(|a| a.to_string())
            .unwrap_or_else(|| plugin.default_account(&config));
        let status = self.status_handle(plugin.id(), &account);
        plugin.send(&account, to, message, &status).await
    }

    /// Actively probe every enabled provider account, bounded by `budget`
    /// overall, then return the refreshed snapshot. Accounts whose probe
    /// fails or times out keep a non-connected snapshot with the reason.
    pub async fn probe_all(&self, budget: Duration) -> Value {
        let config = self.config();
        let deadline = std::time::Instant::now() + budget;

        for plugin in &self.plugins {
            if !plugin.enabled(&config) {
                continue;
            }
            for account in plugin.account_ids(&config) {
                let status = self.status_handle(plugin.id(), &account);
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                match tokio::time::timeout(remaining, plugin.probe(&account, &status)).await {
                    Ok(Ok(connected)) => {
                        tracing::debug!(provider = %plugin.id(), account = %account, connected, "Provider probed");
                    }
                    Ok(Err(e)) => {
                        status.patch(|s| {
                            s.connected = false;
                            s.last_error = Some(format!("probe failed: {}", e));
                        });
                    }
                    Err(_) => {
                        status.patch(|s| {
                            s.connected = false;
                            s.last_error = Some("probe timed out".to_string());
                        });
                    }
                }
            }
        }

        self.runtime_snapshot()
    }

    /// Merged status view over every known provider and configured account.
    /// Pure read; tolerates providers that have never started.
    pub fn runtime_snapshot(&self) -> Value {
        let config = self.config();
        let mut order = Vec::new();
        let mut labels = serde_json::Map::new();
        let mut providers = serde_json::Map::new();
        let mut provider_accounts = serde_json::Map::new();
        let mut default_accounts = serde_json::Map::new();

        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());

        for plugin in &self.plugins {
            let id = plugin.id();
            order.push(id.as_str().to_string());
            labels.insert(id.as_str().to_string(), json!(id.label()));

            let mut account_ids = plugin.account_ids(&config);
            // Accounts known only from runtime state still show up.
            for (provider, account) in snapshots.keys() {
                if *provider == id && !account_ids.contains(account) {
                    account_ids.push(account.clone());
                }
            }
            account_ids.sort();

            let mut accounts = serde_json::Map::new();
            for account in &account_ids {
                let mut snapshot = snapshots
                    .get(&(id, account.clone()))
                    .cloned()
                    .unwrap_or_else(AccountSnapshot::default);
                snapshot.enabled = plugin.enabled(&config);
                snapshot.configured = plugin.configured(&config, account);
                accounts.insert(account.clone(), json!(snapshot));
            }

            providers.insert(
                id.as_str().to_string(),
                json!({
                    "enabled": plugin.enabled(&config),
                    "accounts": accounts,
                }),
            );
            provider_accounts.insert(id.as_str().to_string(), json!(account_ids));
            default_accounts.insert(id.as_str().to_string(), json!(plugin.default_account(&config)));
        }

        json!({
            "providerOrder": order,
            "providerLabels": labels,
            "providers": providers,
            "providerAccounts": provider_accounts,
            "providerDefaultAccountId": default_accounts,
        })
    }
}
