// ABOUTME: Provider abstraction — closed provider id set, runtime snapshots, plugin contract.
// ABOUTME: Each network connector implements ProviderPlugin and runs under the lifecycle manager.

pub mod manager;
pub mod plugins;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use switchboard_core::Config;
use tokio_util::sync::CancellationToken;

/// The fixed set of chat networks this gateway brokers. Dispatch is a match
/// on this enum rather than a runtime-registered plugin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Telegram,
    Whatsapp,
    Discord,
    Slack,
    Signal,
    Imessage,
    Teams,
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::Telegram,
        ProviderId::Whatsapp,
        ProviderId::Discord,
        ProviderId::Slack,
        ProviderId::Signal,
        ProviderId::Imessage,
        ProviderId::Teams,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Signal => "signal",
            Self::Imessage => "imessage",
            Self::Teams => "teams",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Telegram => "Telegram",
            Self::Whatsapp => "WhatsApp",
            Self::Discord => "Discord",
            Self::Slack => "Slack",
            Self::Signal => "Signal",
            Self::Imessage => "iMessage",
            Self::Teams => "Microsoft Teams",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime state for one (provider, account) pair. Created lazily on first
/// reference, updated on every lifecycle transition, never deleted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub enabled: bool,
    pub configured: bool,
    pub running: bool,
    pub connected: bool,
    pub last_start_at: Option<String>,
    pub last_stop_at: Option<String>,
    pub last_error: Option<String>,
    pub last_inbound_at: Option<String>,
    pub last_outbound_at: Option<String>,
    /// Provider-specific extension fields published by the running task.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

pub(crate) type SnapshotStore = Arc<Mutex<HashMap<(ProviderId, String), AccountSnapshot>>>;

/// Handle a supervised task uses to read and publish its own snapshot entry.
/// Patches are applied under the store lock; the task never holds a reference
/// into the shared map.
#[derive(Clone)]
pub struct StatusHandle {
    store: SnapshotStore,
    provider: ProviderId,
    account_id: String,
}

impl StatusHandle {
    pub(crate) fn new(store: SnapshotStore, provider: ProviderId, account_id: String) -> Self {
        Self {
            store,
            provider,
            account_id,
        }
    }

    pub fn get(&self) -> AccountSnapshot {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(self.provider, self.account_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn patch(&self, apply: impl FnOnce(&mut AccountSnapshot)) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = store
            .entry((self.provider, self.account_id.clone()))
            .or_default();
        apply(snapshot);
    }

    pub fn mark_connected(&self) {
        self.patch(|s| {
            s.connected = true;
            s.last_error = None;
        });
    }

    pub fn mark_inbound(&self) {
        self.patch(|s| s.last_inbound_at = Some(chrono::Utc::now().to_rfc3339()));
    }

    pub fn mark_outbound(&self) {
        self.patch(|s| s.last_outbound_at = Some(chrono::Utc::now().to_rfc3339()));
    }
}

/// Outbound delivery receipt returned by a provider send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub provider: ProviderId,
    pub account_id: String,
    pub to: String,
}

/// Contract each network connector implements. Config resolution is pure;
/// `run` is the supervised task body and must observe its cancel token.
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Is this provider section present and enabled in config?
    fn enabled(&self, config: &Config) -> bool;

    /// Does this account carry the credentials the provider needs?
    fn configured(&self, config: &Config, account_id: &str) -> bool;

    /// All configured account ids, sorted. Empty when the section is absent.
    fn account_ids(&self, config: &Config) -> Vec<String>;

    fn default_account(&self, config: &Config) -> String;

    /// Supervised task body. Runs until cancelled or until the connection
    /// fails; a returned error is captured as the account's lastError.
    async fn run(
        &self,
        account_id: String,
        config: Arc<Config>,
        cancel: CancellationToken,
        status: StatusHandle,
    ) -> anyhow::Result<()>;

    /// Optional graceful close for protocols that need a handshake-close
    /// before the task is cancelled.
    async fn stop_hook(&self, _account_id: &str, _status: &StatusHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Actively verify the account's transport and refresh the snapshot.
    /// The default reports the last known connection state untouched.
    async fn probe(&self, _account_id: &str, status: &StatusHandle) -> anyhow::Result<bool> {
        Ok(status.get().connected)
    }

    /// Deliver one outbound message through this provider.
    async fn send(
        &self,
        account_id: &str,
        to: &str,
        message: &str,
        status: &StatusHandle,
    ) -> anyhow::Result<SendReceipt>;

    /// Clear persisted credentials. Returns true when something was cleared.
    async fn logout(&self, _account_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}
