// ABOUTME: RPC method handlers — params validation, dedupe funnel, result serialization.
// ABOUTME: Validation failures short-circuit as INVALID_REQUEST before any side effect.

use crate::chat::ChatSendRequest;
use crate::providers::ProviderId;
use crate::server::GatewayCore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::dedupe::CachedOutcome;
use switchboard_core::metrics;
use switchboard_core::protocol::{ErrorCode, ErrorShape, Frame};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    session_key: String,
    message: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    deliver: Option<bool>,
    #[serde(default)]
    attachments: Option<Vec<Value>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    idempotency_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoryParams {
    session_key: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatAbortParams {
    session_key: String,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendParams {
    to: String,
    message: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    idempotency_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvidersStatusParams {
    #[serde(default)]
    probe: Option<bool>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutParams {
    provider: String,
    #[serde(default)]
    account_id: Option<String>,
}

fn invalid(message: impl Into<String>) -> ErrorShape {
    ErrorShape {
        code: ErrorCode::InvalidRequest,
        message: message.into(),
    }
}

fn unavailable(message: impl Into<String>) -> ErrorShape {
    ErrorShape {
        code: ErrorCode::Unavailable,
        message: message.into(),
    }
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, ErrorShape> {
    serde_json::from_value(params)
        .map_err(|e| invalid(format!("invalid {} params: {}", method, e)))
}

fn parse_provider(name: &str) -> Result<ProviderId, ErrorShape> {
    ProviderId::parse(name).ok_or_else(|| invalid(format!("unknown provider: {}", name)))
}

/// Route one authenticated request. Handler failures surface as typed
/// errors, never as a dropped connection.
pub async fn dispatch(
    core: &Arc<GatewayCore>,
    method: &str,
    params: Value,
) -> Result<Value, ErrorShape> {
    match method {
        "ping" => Ok(json!({ "pong": true, "ts": chrono::Utc::now().to_rfc3339() })),
        "status" => Ok(core.status()),
        "chat.send" => {
            let params: ChatSendParams = parse(method, params)?;
            // Attachment content has no path to the agent boundary.
            if params.attachments.as_ref().is_some_and(|a| !a.is_empty()) {
                return Err(invalid("attachments are not supported"));
            }
            core.chat.chat_send(ChatSendRequest {
                session_key: params.session_key,
                message: params.message,
                thinking: params.thinking,
                deliver: params.deliver.unwrap_or(true),
                timeout_ms: params.timeout_ms,
                idempotency_key: params.idempotency_key,
            })
        }
        "chat.history" => {
            let params: ChatHistoryParams = parse(method, params)?;
            core.chat
                .chat_history(&params.session_key, params.limit.unwrap_or(50))
        }
        "chat.abort" => {
            let params: ChatAbortParams = parse(method, params)?;
            core.chat
                .chat_abort(&params.session_key, params.run_id.as_deref())
        }
        "send" => {
            let params: SendParams = parse(method, params)?;
            outbound(core, "send", params).await
        }
        "poll" => {
            let params: SendParams = parse(method, params)?;
            outbound(core, "poll", params).await
        }
        "providers.status" => {
            let params: ProvidersStatusParams = if params.is_null() {
                ProvidersStatusParams::default()
            } else {
                parse(method, params)?
            };
            if params.probe.unwrap_or(false) {
                let budget = Duration::from_millis(params.timeout_ms.unwrap_or(2_000));
                Ok(core.providers.probe_all(budget).await)
            } else {
                Ok(core.providers.runtime_snapshot())
            }
        }
        "providers.logout" => {
            let params: LogoutParams = parse(method, params)?;
            let provider = parse_provider(&params.provider)?;
            let config = core.config();
            let account = params.account_id.unwrap_or_else(|| {
                core.providers
                    .plugin(provider)
                    .map(|p| p.default_account(&config))
                    .unwrap_or_else(|| "default".to_string())
            });
            core.providers
                .logout(provider, &account)
                .await
                .map_err(|e| unavailable(e.to_string()))
        }
        other => Err(ErrorShape {
            code: ErrorCode::NotFound,
            message: format!("unknown method: {}", other),
        }),
    }
}

/// Outbound delivery funnel shared by `send` and `poll`. Both are
/// side-effecting and replay through the dedupe cache.
async fn outbound(
    core: &Arc<GatewayCore>,
    method: &str,
    params: SendParams,
) -> Result<Value, ErrorShape> {
    if let Some(cached) = core.chat.dedupe_get(method, &params.idempotency_key) {
        metrics::record_dedupe_hit();
        return replay(cached);
    }

    let provider = params
        .provider
        .as_deref()
        .map(parse_provider)
        .transpose()?;

    let result = core
        .providers
        .send(provider, params.account_id.as_deref(), &params.to, &params.message)
        .await;

    match result {
        Ok(receipt) => {
            if method == "poll" {
                // Polls additionally notify the receiving connector to expect
                // a response window.
                core.events.broadcast(Frame::event(
                    "provider.poll",
                    json!({
                        "provider": receipt.provider,
                        "accountId": receipt.account_id,
                        "to": receipt.to,
                        "messageId": receipt.message_id,
                    }),
                ));
            }
            let payload = json!({
                "runId": params.idempotency_key,
                "messageId": receipt.message_id,
                "provider": receipt.provider,
                "accountId": receipt.account_id,
                "to": receipt.to,
                "status": "ok",
            });
            core.chat.dedupe_record(
                method,
                &params.idempotency_key,
                CachedOutcome::success(payload.clone()),
            );
            Ok(payload)
        }
        Err(e) => {
            let error = unavailable(e.to_string());
            core.chat.dedupe_record(
                method,
                &params.idempotency_key,
                CachedOutcome::failure(error.clone()),
            );
            Err(error)
        }
    }
}

fn replay(cached: CachedOutcome) -> Result<Value, ErrorShape> {
    if cached.ok {
        let mut payload = cached.payload.unwrap_or_else(|| json!({}));
        if let Some(map) = payload.as_object_mut() {
            map.insert("cached".to_string(), json!(true));
        }
        Ok(payload)
    } else {
        Err(cached
            .error
            .unwrap_or_else(|| unavailable("cached failure")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use switchboard_core::Config;
    use tokio::sync::mpsc;

    fn core_with(extra: &str) -> Arc<GatewayCore> {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[session]\ndb_path = \"{}\"\n{}",
            dir.path().join("test.db").display(),
            extra
        );
        std::mem::forget(dir);
        let config = Config::from_toml(&toml).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        GatewayCore::initialize(config, Arc::new(ScriptedAgent::new()), tx).unwrap()
    }

    fn core() -> Arc<GatewayCore> {
        core_with("")
    }

    #[tokio::test]
    async fn test_ping() {
        let core = core();
        let payload = dispatch(&core, "ping", json!({})).await.unwrap();
        assert_eq!(payload["pong"], true);
    }

    #[tokio::test]
    async fn test_unknown_method_not_found() {
        let core = core();
        let err = dispatch(&core, "no.such.method", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_chat_send_missing_params_invalid() {
        let core = core();
        let err = dispatch(&core, "chat.send", json!({ "message": "hi" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert!(err.message.contains("chat.send"));
        // Validation failed before any side effect.
        assert_eq!(core.chat.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_send_starts_run() {
        let core = core();
        let payload = dispatch(
            &core,
            "chat.send",
            json!({
                "sessionKey": "main",
                "message": "hello",
                "idempotencyKey": "run-1",
            }),
        )
        .await
        .unwrap();
        assert_eq!(payload["status"], "started");
    }

    #[tokio::test]
    async fn test_chat_abort_unknown_run_noop() {
        let core = core();
        let payload = dispatch(
            &core,
            "chat.abort",
            json!({ "sessionKey": "main", "runId": "ghost" }),
        )
        .await
        .unwrap();
        assert_eq!(payload["aborted"], false);
    }

    #[tokio::test]
    async fn test_send_unknown_provider_invalid() {
        let core = core();
        let err = dispatch(
            &core,
            "send",
            json!({
                "to": "chat-1",
                "message": "hi",
                "provider": "irc",
                "idempotencyKey": "s-1",
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_send_without_connector_fails_and_caches() {
        let core = core();
        let params = json!({
            "to": "chat-1",
            "message": "hi",
            "provider": "telegram",
            "idempotencyKey": "s-1",
        });
        let err = dispatch(&core, "send", params.clone()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);

        // Replay observes the same cached failure.
        let replayed = dispatch(&core, "send", params).await.unwrap_err();
        assert_eq!(replayed, err);
    }

    #[tokio::test]
    async fn test_send_with_connector_succeeds_and_replays() {
        let core = core();
        core.bridges.attach(ProviderId::Telegram, "default");

        let params = json!({
            "to": "chat-1",
            "message": "hi",
            "provider": "telegram",
            "accountId": "default",
            "idempotencyKey": "s-2",
        });
        let first = dispatch(&core, "send", params.clone()).await.unwrap();
        assert_eq!(first["status"], "ok");
        assert!(first["messageId"].is_string());

        let replay = dispatch(&core, "send", params).await.unwrap();
        assert_eq!(replay["cached"], true);
        assert_eq!(replay["messageId"], first["messageId"]);
    }

    #[tokio::test]
    async fn test_providers_status_shape() {
        let core = core();
        let payload = dispatch(&core, "providers.status", json!({})).await.unwrap();
        assert_eq!(payload["providerOrder"].as_array().unwrap().len(), 7);
        // Clients that predate the probe params send null.
        let payload = dispatch(&core, "providers.status", Value::Null).await.unwrap();
        assert_eq!(payload["providerOrder"].as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_providers_status_probe_reflects_attachment() {
        let core = core_with(
            "[providers.telegram]\nenabled = true\n[providers.telegram.accounts.default]\nbot_token = \"123:abc\"\n",
        );

        let payload = dispatch(
            &core,
            "providers.status",
            json!({ "probe": true, "timeoutMs": 500 }),
        )
        .await
        .unwrap();
        let account = &payload["providers"]["telegram"]["accounts"]["default"];
        assert_eq!(account["connected"], false);
        assert_eq!(account["lastError"], "no connector attached");

        core.bridges.attach(ProviderId::Telegram, "default");
        let payload = dispatch(&core, "providers.status", json!({ "probe": true }))
            .await
            .unwrap();
        let account = &payload["providers"]["telegram"]["accounts"]["default"];
        assert_eq!(account["connected"], true);
        assert!(account["lastError"].is_null());
    }

    #[tokio::test]
    async fn test_chat_send_rejects_attachments() {
        let core = core();
        let err = dispatch(
            &core,
            "chat.send",
            json!({
                "sessionKey": "main",
                "message": "hello",
                "attachments": [{ "path": "/tmp/pic.png" }],
                "idempotencyKey": "run-att",
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert!(err.message.contains("attachments"));
        assert_eq!(core.chat.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_send_deliver_flag_reaches_final_event() {
        let core = core();
        let mut events = core.events.subscribe();
        dispatch(
            &core,
            "chat.send",
            json!({
                "sessionKey": "main",
                "message": "hello",
                "deliver": false,
                "idempotencyKey": "run-quiet",
            }),
        )
        .await
        .unwrap();

        loop {
            match events.recv().await.unwrap() {
                Frame::Event { event, data } if event == "chat.final" => {
                    assert_eq!(data["deliver"], false);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_providers_logout() {
        let core = core();
        let payload = dispatch(
            &core,
            "providers.logout",
            json!({ "provider": "whatsapp", "accountId": "main" }),
        )
        .await
        .unwrap();
        assert_eq!(payload["provider"], "whatsapp");
        assert_eq!(payload["loggedOut"], true);
    }
}
