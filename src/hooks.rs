// ABOUTME: Gmail hook watcher — prompts the attached connector to poll a label
// ABOUTME: and injects reported messages as chat runs keyed by Gmail message id.

use crate::chat::ChatSendRequest;
use crate::server::GatewayCore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::protocol::Frame;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Inbound hook notification shape, reported by a connector as the
/// `hook.gmail.inbound` client event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailInbound {
    message_id: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    body: String,
}

/// Spawn the Gmail watcher. The Gmail client itself is a connector; this
/// task only drives its polling cadence. Exits immediately when disabled.
pub fn spawn(core: Arc<GatewayCore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = core.config();
        let gmail = &config.hooks.gmail;
        if !gmail.enabled {
            tracing::debug!("Gmail hook watcher disabled");
            return;
        }

        let period = Duration::from_secs(gmail.poll_interval_secs.max(5));
        let account = gmail.account.clone();
        let label = gmail.label.clone();
        tracing::info!(
            account = %account,
            label = %label,
            interval_secs = period.as_secs(),
            "Gmail hook watcher started"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Gmail hook watcher stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            core.events.broadcast(Frame::event(
                "hook.gmail.poll",
                json!({ "account": account, "label": label }),
            ));
        }
    })
}

/// Route one reported Gmail message into the chat service. The Gmail message
/// id doubles as the idempotency key, so connectors may re-report a message
/// after a reconnect without double-running it.
pub fn handle_inbound(core: &Arc<GatewayCore>, data: Value) {
    let inbound: GmailInbound = match serde_json::from_value(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed gmail inbound event");
            return;
        }
    };

    let account = inbound
        .account
        .unwrap_or_else(|| core.config().hooks.gmail.account.clone());
    let session_key = format!("hook:gmail:{}", account);
    let mut message = String::new();
    if let Some(from) = &inbound.from {
        message.push_str(&format!("From: {}\n", from));
    }
    if let Some(subject) = &inbound.subject {
        message.push_str(&format!("Subject: {}\n", subject));
    }
    message.push_str(&inbound.body);

    let result = core.chat.chat_send(ChatSendRequest {
        session_key: session_key.clone(),
        message,
        thinking: None,
        deliver: true,
        timeout_ms: None,
        idempotency_key: format!("gmail-{}", inbound.message_id),
    });
    match result {
        Ok(ack) => {
            tracing::info!(
                session_key = %session_key,
                message_id = %inbound.message_id,
                status = %ack["status"],
                "Gmail hook message routed"
            );
        }
        Err(e) => {
            tracing::warn!(
                message_id = %inbound.message_id,
                code = %e.code,
                error = %e.message,
                "Gmail hook message rejected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use switchboard_core::Config;
    use tokio::sync::mpsc;

    fn core_with(toml: &str) -> Arc<GatewayCore> {
        let dir = tempfile::tempdir().unwrap();
        let full = format!(
            "[session]\ndb_path = \"{}\"\n{}",
            dir.path().join("test.db").display(),
            toml
        );
        std::mem::forget(dir);
        let config = Config::from_toml(&full).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        GatewayCore::initialize(config, Arc::new(ScriptedAgent::new()), tx).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_watcher_exits() {
        let core = core_with("");
        spawn(core, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_emits_poll_events() {
        let core = core_with(
            "[hooks.gmail]\nenabled = true\naccount = \"ops@example.com\"\npoll_interval_secs = 60\n",
        );
        let mut events = core.events.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn(core, cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        let frame = events.recv().await.unwrap();
        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, "hook.gmail.poll");
                assert_eq!(data["account"], "ops@example.com");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_reuses_message_id_as_run_key() {
        let core = core_with("[hooks.gmail]\nenabled = true\naccount = \"ops@example.com\"\n");
        let data = json!({
            "messageId": "m-123",
            "from": "alice@example.com",
            "subject": "hi",
            "body": "hello there",
        });
        handle_inbound(&core, data.clone());
        assert!(core
            .chat
            .session_runs("hook:gmail:ops@example.com")
            .contains(&"gmail-m-123".to_string()));

        // Re-reporting the same message does not start a second run.
        handle_inbound(&core, data);
        assert_eq!(core.chat.live_run_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_inbound_is_dropped() {
        let core = core_with("");
        handle_inbound(&core, json!({ "body": 42 }));
        assert_eq!(core.chat.live_run_count(), 0);
    }
}
