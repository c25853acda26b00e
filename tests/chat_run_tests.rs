// ABOUTME: Integration tests for the chat run lifecycle through the RPC dispatch layer.
// ABOUTME: Covers idempotent replay, in-flight dedup, abort scoping, and stop-word semantics.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard::agent::ScriptedAgent;
use switchboard::gateway::methods::dispatch;
use switchboard::GatewayCore;
use switchboard_core::protocol::{ErrorCode, Frame};
use switchboard_core::Config;
use tokio::sync::mpsc;

fn test_core() -> (Arc<GatewayCore>, Arc<ScriptedAgent>) {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        "[session]\ndb_path = \"{}\"\n",
        dir.path().join("test.db").display()
    );
    std::mem::forget(dir);
    let config = Config::from_toml(&toml).unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    let (tx, _rx) = mpsc::channel(4);
    let core = GatewayCore::initialize(config, agent.clone(), tx).unwrap();
    (core, agent)
}

/// Poll until the run has left the registry.
async fn wait_settled(core: &Arc<GatewayCore>, run_id: &str) {
    for _ in 0..200 {
        if core.chat.dedupe_get("chat.send", run_id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {} never settled", run_id);
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn test_completed_run_replays_cached_payload() {
    let (core, agent) = test_core();
    agent.push_reply("the answer");

    let params = json!({
        "sessionKey": "main",
        "message": "question",
        "idempotencyKey": "run-1",
    });
    let ack = dispatch(&core, "chat.send", params.clone()).await.unwrap();
    assert_eq!(ack["status"], "started");
    wait_settled(&core, "run-1").await;

    let replay = dispatch(&core, "chat.send", params).await.unwrap();
    assert_eq!(replay["status"], "ok");
    assert_eq!(replay["text"], "the answer");
    assert_eq!(replay["cached"], true);
    // The scripted queue is empty, so a second invocation would have
    // produced the fallback reply instead of this text.
    assert_eq!(core.chat.live_run_count(), 0);
}

#[tokio::test]
async fn test_failed_run_replays_cached_error() {
    let (core, agent) = test_core();
    agent.push_failure("backend exploded");

    let params = json!({
        "sessionKey": "main",
        "message": "question",
        "idempotencyKey": "run-err",
    });
    dispatch(&core, "chat.send", params.clone()).await.unwrap();
    wait_settled(&core, "run-err").await;

    let err = dispatch(&core, "chat.send", params).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert!(err.message.contains("backend exploded"));
}

// =============================================================================
// In-flight dedup
// =============================================================================

#[tokio::test]
async fn test_duplicate_key_while_running_reports_in_flight() {
    let (core, agent) = test_core();
    agent.push_delayed_reply("slow", Duration::from_secs(60));

    let params = json!({
        "sessionKey": "main",
        "message": "slow question",
        "idempotencyKey": "run-slow",
    });
    let first = dispatch(&core, "chat.send", params.clone()).await.unwrap();
    assert_eq!(first["status"], "started");

    let dup = dispatch(&core, "chat.send", params).await.unwrap();
    assert_eq!(dup["status"], "in_flight");
    assert_eq!(core.chat.live_run_count(), 1);

    core.chat.chat_abort("main", None).unwrap();
}

// =============================================================================
// Abort scoping
// =============================================================================

#[tokio::test]
async fn test_abort_rejects_cross_session_run_id() {
    let (core, agent) = test_core();
    agent.push_delayed_reply("slow", Duration::from_secs(60));

    dispatch(
        &core,
        "chat.send",
        json!({
            "sessionKey": "session-b",
            "message": "working",
            "idempotencyKey": "run-b",
        }),
    )
    .await
    .unwrap();

    let err = dispatch(
        &core,
        "chat.abort",
        json!({ "sessionKey": "session-a", "runId": "run-b" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    // The run is still live; the cross-session abort touched nothing.
    assert_eq!(core.chat.live_run_count(), 1);

    core.chat.chat_abort("session-b", None).unwrap();
}

#[tokio::test]
async fn test_abort_broadcasts_chat_aborted_event() {
    let (core, agent) = test_core();
    agent.push_delayed_reply("slow", Duration::from_secs(60));

    let mut events = core.events.subscribe();
    dispatch(
        &core,
        "chat.send",
        json!({
            "sessionKey": "main",
            "message": "working",
            "idempotencyKey": "run-x",
        }),
    )
    .await
    .unwrap();

    let payload = dispatch(
        &core,
        "chat.abort",
        json!({ "sessionKey": "main", "runId": "run-x" }),
    )
    .await
    .unwrap();
    assert_eq!(payload["aborted"], true);
    wait_settled(&core, "run-x").await;

    let mut saw_aborted = false;
    while let Ok(frame) = events.try_recv() {
        if let Frame::Event { event, data } = frame {
            if event == "chat.aborted" && data["runId"] == "run-x" {
                saw_aborted = true;
            }
        }
    }
    assert!(saw_aborted);
}

// =============================================================================
// Stop-word semantics
// =============================================================================

#[tokio::test]
async fn test_stop_command_aborts_every_session_run() {
    let (core, agent) = test_core();
    agent.push_delayed_reply("slow one", Duration::from_secs(60));
    agent.push_delayed_reply("slow two", Duration::from_secs(60));

    for key in ["run-1", "run-2"] {
        dispatch(
            &core,
            "chat.send",
            json!({
                "sessionKey": "main",
                "message": "work",
                "idempotencyKey": key,
            }),
        )
        .await
        .unwrap();
    }
    assert_eq!(core.chat.live_run_count(), 2);

    let ack = dispatch(
        &core,
        "chat.send",
        json!({
            "sessionKey": "main",
            "message": "  STOP  ",
            "idempotencyKey": "stop-1",
        }),
    )
    .await
    .unwrap();
    assert_eq!(ack["aborted"], true);
    assert_eq!(ack["runIds"].as_array().unwrap().len(), 2);

    wait_settled(&core, "run-1").await;
    wait_settled(&core, "run-2").await;
    // No third run was started for the stop message itself.
    assert_eq!(core.chat.live_run_count(), 0);
    assert!(core.chat.dedupe_get("chat.send", "stop-1").is_some());
}

// =============================================================================
// History
// =============================================================================

#[tokio::test]
async fn test_history_returns_transcript_after_run() {
    let (core, agent) = test_core();
    agent.push_reply("42");

    dispatch(
        &core,
        "chat.send",
        json!({
            "sessionKey": "main",
            "message": "meaning of life?",
            "thinking": "high",
            "idempotencyKey": "run-h",
        }),
    )
    .await
    .unwrap();
    wait_settled(&core, "run-h").await;

    let payload = dispatch(&core, "chat.history", json!({ "sessionKey": "main" }))
        .await
        .unwrap();
    let messages = payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "agent");
    assert_eq!(messages[1]["text"], "42");
    assert_eq!(payload["thinkingLevel"], "high");
}
