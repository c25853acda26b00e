// ABOUTME: Concrete provider plugins, one per supported chat network.
// ABOUTME: Connectors attach as bridge-mode clients; plugins track attachment and route outbound sends.

use crate::chat::EventHub;
use crate::providers::{ProviderId, ProviderPlugin, SendReceipt, StatusHandle};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::config::ProviderSection;
use switchboard_core::protocol::Frame;
use switchboard_core::Config;
use tokio_util::sync::CancellationToken;

/// Tracks which (provider, account) pairs currently have a live bridge
/// connection. The gateway attaches on a bridge-mode handshake and detaches
/// on disconnect; provider tasks watch for changes.
pub struct BridgeDirectory {
    attached: Mutex<HashMap<(ProviderId, String), u32>>,
    changed: tokio::sync::Notify,
}

impl BridgeDirectory {
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(HashMap::new()),
            changed: tokio::sync::Notify::new(),
        }
    }

    pub fn attach(&self, provider: ProviderId, account_id: &str) {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        *attached
            .entry((provider, account_id.to_string()))
            .or_insert(0) += 1;
        drop(attached);
        self.changed.notify_waiters();
    }

    pub fn detach(&self, provider: ProviderId, account_id: &str) {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        let key = (provider, account_id.to_string());
        if let Some(count) = attached.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                attached.remove(&key);
            }
        }
        drop(attached);
        self.changed.notify_waiters();
    }

    pub fn is_attached(&self, provider: ProviderId, account_id: &str) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(provider, account_id.to_string()))
    }

    async fn wait_change(&self) {
        self.changed.notified().await;
    }
}

impl Default for BridgeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared mechanics for bridge-backed providers: supervise connector
/// attachment and deliver outbound messages as targeted events.
#[derive(Clone)]
pub struct BridgeLink {
    directory: Arc<BridgeDirectory>,
    events: EventHub,
}

impl BridgeLink {
    pub fn new(directory: Arc<BridgeDirectory>, events: EventHub) -> Self {
        Self { directory, events }
    }

    pub fn directory(&self) -> &Arc<BridgeDirectory> {
        &self.directory
    }

    /// Supervised task body: mirror connector attachment into the snapshot
    /// until cancelled. The periodic tick re-checks state even if a notify
    /// was missed between polls.
    async fn supervise(
        &self,
        provider: ProviderId,
        account_id: String,
        cancel: CancellationToken,
        status: StatusHandle,
    ) -> Result<()> {
        loop {
            let attached = self.directory.is_attached(provider, &account_id);
            status.patch(|s| {
                s.connected = attached;
                if !attached {
                    s.last_error = Some("no connector attached".to_string());
                } else {
                    s.last_error = None;
                }
            });

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.directory.wait_change() => {}
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }
    }

    async fn deliver(
        &self,
        provider: ProviderId,
        account_id: &str,
        to: &str,
        message: &str,
        status: &StatusHandle,
    ) -> Result<SendReceipt> {
        if !self.directory.is_attached(provider, account_id) {
            anyhow::bail!(
                "no {} connector attached for account {}",
                provider,
                account_id
            );
        }
        let message_id = uuid::Uuid::new_v4().to_string();
        self.events.broadcast(Frame::event(
            "provider.outbound",
            json!({
                "provider": provider,
                "accountId": account_id,
                "to": to,
                "message": message,
                "messageId": message_id,
            }),
        ));
        status.mark_outbound();
        Ok(SendReceipt {
            message_id,
            provider,
            account_id: account_id.to_string(),
            to: to.to_string(),
        })
    }

    /// Active check: re-read the attachment table and refresh the snapshot,
    /// without waiting for the supervise loop's next wakeup.
    fn probe(&self, provider: ProviderId, account_id: &str, status: &StatusHandle) -> bool {
        let attached = self.directory.is_attached(provider, account_id);
        status.patch(|s| {
            s.connected = attached;
            if attached {
                s.last_error = None;
            } else {
                s.last_error = Some("no connector attached".to_string());
            }
        });
        attached
    }

    fn close_connector(&self, provider: ProviderId, account_id: &str) {
        // Graceful close request for connectors whose protocol needs one.
        self.events.broadcast(Frame::event(
            "provider.close",
            json!({ "provider": provider, "accountId": account_id }),
        ));
    }
}

fn account_enabled(flag: Option<bool>) -> bool {
    flag.unwrap_or(true)
}

fn section_enabled<A>(section: Option<&ProviderSection<A>>) -> bool {
    section.map(|s| s.enabled).unwrap_or(false)
}

fn section_accounts<A>(section: Option<&ProviderSection<A>>) -> Vec<String> {
    section.map(|s| s.account_ids()).unwrap_or_default()
}

fn section_default<A>(section: Option<&ProviderSection<A>>) -> String {
    section
        .map(|s| s.default_account.clone())
        .unwrap_or_else(|| "default".to_string())
}

macro_rules! bridge_plugin {
    ($name:ident, $id:expr, $section:ident, $configured:expr) => {
        pub struct $name {
            link: BridgeLink,
        }

        impl $name {
            pub fn new(link: BridgeLink) -> Self {
                Self { link }
            }
        }

        #[async_trait]
        impl ProviderPlugin for $name {
            fn id(&self) -> ProviderId {
                $id
            }

            fn enabled(&self, config: &Config) -> bool {
                section_enabled(config.providers.$section.as_ref())
            }

            fn configured(&self, config: &Config, account_id: &str) -> bool {
                config
                    .providers
                    .$section
                    .as_ref()
                    .and_then(|s| s.accounts.get(account_id))
                    .map($configured)
                    .unwrap_or(false)
            }

            fn account_ids(&self, config: &Config) -> Vec<String> {
                section_accounts(config.providers.$section.as_ref())
            }

            fn default_account(&self, config: &Config) -> String {
                section_default(config.providers.$section.as_ref())
            }

            async fn run(
                &self,
                account_id: String,
                _config: Arc<Config>,
                cancel: CancellationToken,
                status: StatusHandle,
            ) -> Result<()> {
                self.link.supervise($id, account_id, cancel, status).await
            }

            async fn probe(&self, account_id: &str, status: &StatusHandle) -> Result<bool> {
                Ok(self.link.probe($id, account_id, status))
            }

            async fn send(
                &self,
                account_id: &str,
                to: &str,
                message: &str,
                status: &StatusHandle,
            ) -> Result<SendReceipt> {
                self.link.deliver($id, account_id, to, message, status).await
            }
        }
    };
}

bridge_plugin!(TelegramPlugin, ProviderId::Telegram, telegram, |a| {
    account_enabled(a.enabled) && !a.bot_token.is_empty()
});

bridge_plugin!(DiscordPlugin, ProviderId::Discord, discord, |a| {
    account_enabled(a.enabled) && !a.bot_token.is_empty()
});

bridge_plugin!(SignalPlugin, ProviderId::Signal, signal, |a| {
    account_enabled(a.enabled) && !a.socket_path.is_empty()
});

bridge_plugin!(IMessagePlugin, ProviderId::Imessage, imessage, |a| {
    account_enabled(a.enabled) && !a.db_path.is_empty()
});

bridge_plugin!(TeamsPlugin, ProviderId::Teams, teams, |a| {
    account_enabled(a.enabled) && !a.app_id.is_empty() && !a.app_password.is_empty()
});

// WhatsApp and Slack carry explicit stop hooks: their connectors hold
// long-lived authenticated sessions that want a clean close frame before
// the supervising task is cancelled.

pub struct WhatsAppPlugin {
    link: BridgeLink,
}

impl WhatsAppPlugin {
    pub fn new(link: BridgeLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl ProviderPlugin for WhatsAppPlugin {
    fn id(&self) -> ProviderId {
        ProviderId::Whatsapp
    }

    fn enabled(&self, config: &Config) -> bool {
        section_enabled(config.providers.whatsapp.as_ref())
    }

    fn configured(&self, config: &Config, account_id: &str) -> bool {
        config
            .providers
            .whatsapp
            .as_ref()
            .and_then(|s| s.accounts.get(account_id))
            .map(|a| account_enabled(a.enabled) && !a.session_path.is_empty())
            .unwrap_or(false)
    }

    fn account_ids(&self, config: &Config) -> Vec<String> {
        section_accounts(config.providers.whatsapp.as_ref())
    }

    fn default_account(&self, config: &Config) -> String {
        section_default(config.providers.whatsapp.as_ref())
    }

    async fn run(
        &self,
        account_id: String,
        _config: Arc<Config>,
        cancel: CancellationToken,
        status: StatusHandle,
    ) -> Result<()> {
        self.link
            .supervise(ProviderId::Whatsapp, account_id, cancel, status)
            .await
    }

    async fn stop_hook(&self, account_id: &str, _status: &StatusHandle) -> Result<()> {
        self.link.close_connector(ProviderId::Whatsapp, account_id);
        Ok(())
    }

    async fn probe(&self, account_id: &str, status: &StatusHandle) -> Result<bool> {
        Ok(self.link.probe(ProviderId::Whatsapp, account_id, status))
    }

    async fn send(
        &self,
        account_id: &str,
        to: &str,
        message: &str,
        status: &StatusHandle,
    ) -> Result<SendReceipt> {
        self.link
            .deliver(ProviderId::Whatsapp, account_id, to, message, status)
            .await
    }

    async fn logout(&self, account_id: &str) -> Result<bool> {
        // Session files live under the configured session path; the connector
        // clears them on the close event it receives.
        self.link.close_connector(ProviderId::Whatsapp, account_id);
        Ok(true)
    }
}

pub struct SlackPlugin {
    link: BridgeLink,
}

impl SlackPlugin {
    pub fn new(link: BridgeLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl ProviderPlugin for SlackPlugin {
    fn id(&self) -> ProviderId {
        ProviderId::Slack
    }

    fn enabled(&self, config: &Config) -> bool {
        section_enabled(config.providers.slack.as_ref())
    }

    fn configured(&self, config: &Config, account_id: &str) -> bool {
        config
            .providers
            .slack
            .as_ref()
            .and_then(|s| s.accounts.get(account_id))
            .map(|a| account_enabled(a.enabled) && !a.app_token.is_empty() && !a.bot_token.is_empty())
            .unwrap_or(false)
    }

    fn account_ids(&self, config: &Config) -> Vec<String> {
        section_accounts(config.providers.slack.as_ref())
    }

    fn default_account(&self, config: &Config) -> String {
        section_default(config.providers.slack.as_ref())
    }

    async fn run(
        &self,
        account_id: String,
        _config: Arc<Config>,
        cancel: CancellationToken,
        status: StatusHandle,
    ) -> Result<()> {
        self.link
            .supervise(ProviderId::Slack, account_id, cancel, status)
            .await
    }

    async fn stop_hook(&self, account_id: &str, _status: &StatusHandle) -> Result<()> {
        self.link.close_connector(ProviderId::Slack, account_id);
        Ok(())
    }

    async fn probe(&self, account_id: &str, status: &StatusHandle) -> Result<bool> {
        Ok(self.link.probe(ProviderId::Slack, account_id, status))
    }

    async fn send(
        &self,
        account_id: &str,
        to: &str,
        message: &str,
        status: &StatusHandle,
    ) -> Result<SendReceipt> {
        self.link
            .deliver(ProviderId::Slack, account_id, to, message, status)
            .await
    }
}

/// All plugins in display order.
pub fn all(link: BridgeLink) -> Vec<Arc<dyn ProviderPlugin>> {
    vec![
        Arc::new(TelegramPlugin::new(link.clone())),
        Arc::new(WhatsAppPlugin::new(link.clone())),
        Arc::new(DiscordPlugin::new(link.clone())),
        Arc::new(SlackPlugin::new(link.clone())),
        Arc::new(SignalPlugin::new(link.clone())),
        Arc::new(IMessagePlugin::new(link.clone())),
        Arc::new(TeamsPlugin::new(link)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::config::TelegramAccount;

    fn telegram_config(token: &str) -> Config {
        let toml = format!(
            r#"
[providers.telegram]
enabled = true
default_account = "main"

[providers.telegram.accounts.main]
bot_token = "{}"
"#,
            token
        );
        Config::from_toml(&toml).unwrap()
    }

    fn link() -> BridgeLink {
        BridgeLink::new(Arc::new(BridgeDirectory::new()), EventHub::new())
    }

    #[test]
    fn test_telegram_configured_requires_token() {
        let plugin = TelegramPlugin::new(link());
        assert!(plugin.configured(&telegram_config("123:abc"), "main"));
        assert!(!plugin.configured(&telegram_config(""), "main"));
        assert!(!plugin.configured(&telegram_config("123:abc"), "missing"));
    }

    #[test]
    fn test_disabled_account_not_configured() {
        let plugin = TelegramPlugin::new(link());
        let mut config = telegram_config("123:abc");
        if let Some(section) = config.providers.telegram.as_mut() {
            section.accounts.insert(
                "main".to_string(),
                TelegramAccount {
                    bot_token: "123:abc".to_string(),
                    enabled: Some(false),
                },
            );
        }
        assert!(!plugin.configured(&config, "main"));
    }

    #[test]
    fn test_enabled_defaults_false_without_section() {
        let plugin = SlackPlugin::new(link());
        let config = Config::from_toml("").unwrap();
        assert!(!plugin.enabled(&config));
        assert!(plugin.account_ids(&config).is_empty());
        assert_eq!(plugin.default_account(&config), "default");
    }

    #[test]
    fn test_directory_attach_detach() {
        let directory = BridgeDirectory::new();
        assert!(!directory.is_attached(ProviderId::Telegram, "main"));

        directory.attach(ProviderId::Telegram, "main");
        directory.attach(ProviderId::Telegram, "main");
        assert!(directory.is_attached(ProviderId::Telegram, "main"));

        directory.detach(ProviderId::Telegram, "main");
        assert!(directory.is_attached(ProviderId::Telegram, "main"));
        directory.detach(ProviderId::Telegram, "main");
        assert!(!directory.is_attached(ProviderId::Telegram, "main"));
    }

    #[tokio::test]
    async fn test_deliver_requires_attached_connector() {
        let directory = Arc::new(BridgeDirectory::new());
        let events = EventHub::new();
        let link = BridgeLink::new(Arc::clone(&directory), events.clone());
        let store: crate::providers::SnapshotStore = Default::default();
        let status = StatusHandle::new(store, ProviderId::Telegram, "main".to_string());

        let err = link
            .deliver(ProviderId::Telegram, "main", "chat-1", "hi", &status)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no telegram connector"));

        directory.attach(ProviderId::Telegram, "main");
        let mut rx = events.subscribe();
        let receipt = link
            .deliver(ProviderId::Telegram, "main", "chat-1", "hi", &status)
            .await
            .unwrap();
        assert_eq!(receipt.provider, ProviderId::Telegram);

        match rx.recv().await.unwrap() {
            Frame::Event { event, data } => {
                assert_eq!(event, "provider.outbound");
                assert_eq!(data["to"], "chat-1");
                assert_eq!(data["messageId"], receipt.message_id.as_str());
            }
            other => panic!("expected event, got {:?}", other),
        }
    }
}
