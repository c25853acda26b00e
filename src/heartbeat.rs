// ABOUTME: Heartbeat runner — periodic agent prompt on a dedicated session.
// ABOUTME: Each beat gets its own idempotency key so slow runs are never stacked.

use crate::chat::ChatSendRequest;
use crate::server::GatewayCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn the heartbeat runner. Exits immediately when disabled; the reload
/// driver respawns it with fresh config.
pub fn spawn(core: Arc<GatewayCore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = core.config();
        if !config.heartbeat.enabled {
            tracing::debug!("Heartbeat subsystem disabled");
            return;
        }

        let period = Duration::from_secs(config.heartbeat.interval_secs.max(1));
        let session_key = config.heartbeat.session_key.clone();
        let message = config.heartbeat.message.clone();
        tracing::info!(
            interval_secs = period.as_secs(),
            session_key = %session_key,
            "Heartbeat subsystem started"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; a beat at
        // startup would race provider bring-up, so consume it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Heartbeat subsystem stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let idempotency_key = format!("heartbeat-{}", chrono::Utc::now().timestamp());
            tracing::debug!(run_id = %idempotency_key, "Heartbeat firing");
            let result = core.chat.chat_send(ChatSendRequest {
                session_key: session_key.clone(),
                message: message.clone(),
                thinking: None,
                // Beats are internal liveness prompts; connectors should not
                // relay the reply anywhere.
                deliver: false,
                timeout_ms: None,
                idempotency_key,
            });
            match result {
                Ok(ack) => {
                    // An in-flight ack means the previous beat is still
                    // running; skip rather than queue.
                    if ack["status"] == "in_flight" {
                        tracing::debug!("Previous heartbeat still in flight, skipped");
                    }
                }
                Err(e) => {
                    tracing::warn!(code = %e.code, error = %e.message, "Heartbeat rejected");
                }
            }
        }
    })
}
