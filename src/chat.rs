// ABOUTME: Chat run orchestration — accept, dedupe, abort, and settle agent invocations.
// ABOUTME: Owns the run registry and idempotency cache; publishes chat events to the hub.

use crate::agent::{AgentError, AgentInvocation, AgentRuntime};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::dedupe::CachedOutcome;
use switchboard_core::metrics;
use switchboard_core::protocol::{ErrorCode, ErrorShape, Frame};
use switchboard_core::runs::AbortOutcome;
use switchboard_core::{ChatRunRegistry, DedupeCache, SessionStore};
use tokio::sync::broadcast;

/// Hub for broadcasting server events to every connected client.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<Frame>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Broadcast to all connections. Errors mean no receivers; ignored.
    pub fn broadcast(&self, frame: Frame) {
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `chat.send` request. The idempotency key doubles as the run id.
#[derive(Debug, Clone)]
pub struct ChatSendRequest {
    pub session_key: String,
    pub message: String,
    pub thinking: Option<String>,
    /// Whether the final reply should be delivered back out by connectors.
    /// Carried on the run's events; the gateway itself never formats output.
    pub deliver: bool,
    pub timeout_ms: Option<u64>,
    pub idempotency_key: String,
}

/// Orchestrates chat runs end to end. Cheap to clone; the registry and
/// dedupe cache are mutex-guarded and never locked across a suspension point.
#[derive(Clone)]
pub struct ChatService {
    agent: Arc<dyn AgentRuntime>,
    sessions: SessionStore,
    runs: Arc<Mutex<ChatRunRegistry>>,
    dedupe: Arc<Mutex<DedupeCache>>,
    events: EventHub,
    run_timeout: Duration,
    stop_commands: Arc<Vec<String>>,
}

impl ChatService {
    pub fn new(
        agent: Arc<dyn AgentRuntime>,
        sessions: SessionStore,
        events: EventHub,
        run_timeout: Duration,
        stop_commands: Vec<String>,
    ) -> Self {
        Self {
            agent,
            sessions,
            runs: Arc::new(Mutex::new(ChatRunRegistry::new())),
            dedupe: Arc::new(Mutex::new(DedupeCache::new())),
            events,
            run_timeout,
            stop_commands: Arc::new(stop_commands),
        }
    }

    /// Accept a chat request. Returns an immediate acknowledgement; the agent
    /// invocation proceeds as a spawned task and settles via the dedupe cache
    /// and the event hub.
    pub fn chat_send(&self, req: ChatSendRequest) -> Result<Value, ErrorShape> {
        let run_id = req.idempotency_key.clone();

        if let Some(cached) = self.dedupe_get("chat.send", &run_id) {
            metrics::record_dedupe_hit();
            return cached_to_result(cached);
        }

        if self.runs.lock().unwrap_or_else(|e| e.into_inner()).is_running(&run_id) {
            return Ok(json!({ "runId": run_id, "status": "in_flight" }));
        }

        if self.is_stop_command(&req.message) {
            let aborted = self.abort_all(&req.session_key);
            let payload = json!({
                "runId": run_id,
                "status": "ok",
                "aborted": !aborted.is_empty(),
                "runIds": aborted,
            });
            self.dedupe_record("chat.send", &run_id, CachedOutcome::success(payload.clone()));
            return Ok(payload);
        }

        let session = self.sessions.get_or_create(&req.session_key).map_err(|e| {
            tracing::error!(error = %e, session_key = %req.session_key, "Session store failure");
            ErrorShape {
                code: ErrorCode::Unavailable,
                message: "session store unavailable".to_string(),
            }
        })?;

        if session.send_policy == switchboard_core::SendPolicy::Deny {
            return Err(ErrorShape {
                code: ErrorCode::Unavailable,
                message: format!("sends are disabled for session {}", req.session_key),
            });
        }

        if let Some(level) = &req.thinking {
            if let Err(e) = self.sessions.set_thinking_level(&req.session_key, Some(level)) {
                tracing::warn!(error = %e, "Failed to persist thinking level");
            }
        }

        let timeout = req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.run_timeout);

        let cancel = {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            match runs.register(
                &run_id,
                &req.session_key,
                chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(600)),
            ) {
                Some(token) => token,
                // Lost a race with a duplicate; report it as in flight.
                None => return Ok(json!({ "runId": run_id, "status": "in_flight" })),
            }
        };

        if let Err(e) = self.sessions.append_message(&req.session_key, "user", &req.message) {
            tracing::warn!(error = %e, "Failed to record user message");
        }

        metrics::record_run_started();
        self.events.broadcast(Frame::event(
            "chat.started",
            json!({ "sessionKey": req.session_key, "runId": run_id, "deliver": req.deliver }),
        ));

        let service = self.clone();
        let session_id = session.session_id;
        let session_key = req.session_key;
        let message = req.message;
        let deliver = req.deliver;
        let spawned_run_id = run_id.clone();
        tokio::spawn(async move {
            service
                .drive_run(
                    spawned_run_id,
                    session_key,
                    session_id,
                    message,
                    deliver,
                    timeout,
                    cancel,
                )
                .await;
        });

        Ok(json!({ "runId": run_id, "status": "started" }))
    }

    /// Run the agent invocation to settlement. Every exit path removes the
    /// registry record and writes the terminal outcome to the dedupe cache.
    #[allow(clippy::too_many_arguments)]
    async fn drive_run(
        &self,
        run_id: String,
        session_key: String,
        session_id: String,
        message: String,
        deliver: bool,
        timeout: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let started = std::time::Instant::now();
        let invocation = AgentInvocation {
            session_key: session_key.clone(),
            session_id,
            message,
            deadline: timeout,
            cancel: cancel.clone(),
        };

        // Outer timeout backstops a runtime that ignores its deadline.
        let outcome = match tokio::time::timeout(timeout, self.agent.invoke(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout),
        };

        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
        metrics::record_run_duration(started.elapsed().as_secs_f64());

        match outcome {
            Ok(reply) => {
                if let Err(e) = self.sessions.append_message(&session_key, "agent", &reply.text) {
                    tracing::warn!(error = %e, "Failed to record agent reply");
                }
                if let Err(e) =
                    self.sessions
                        .record_usage(&session_key, reply.input_tokens, reply.output_tokens)
                {
                    tracing::warn!(error = %e, "Failed to record token usage");
                }
                metrics::record_token_usage(reply.input_tokens, reply.output_tokens);
                metrics::record_run_settled("ok");

                let payload = json!({ "runId": run_id, "status": "ok", "text": reply.text });
                self.dedupe_record("chat.send", &run_id, CachedOutcome::success(payload));
                self.events.broadcast(Frame::event(
                    "chat.final",
                    json!({
                        "sessionKey": session_key,
                        "runId": run_id,
                        "ok": true,
                        "deliver": deliver,
                        "text": reply.text,
                    }),
                ));
            }
            Err(AgentError::Aborted) => {
                metrics::record_run_settled("aborted");
                let payload = json!({ "runId": run_id, "status": "aborted" });
                self.dedupe_record("chat.send", &run_id, CachedOutcome::success(payload));
                self.events.broadcast(Frame::event(
                    "chat.aborted",
                    json!({ "sessionKey": session_key, "runId": run_id, "reason": "abort" }),
                ));
            }
            Err(AgentError::Timeout) => {
                tracing::warn!(run_id = %run_id, session_key = %session_key, "Run timed out");
                metrics::record_run_settled("timeout");
                self.dedupe_record(
                    "chat.send",
                    &run_id,
                    CachedOutcome::failure(ErrorShape {
                        code: ErrorCode::Unavailable,
                        message: "run exceeded its deadline".to_string(),
                    }),
                );
                self.events.broadcast(Frame::event(
                    "chat.aborted",
                    json!({ "sessionKey": session_key, "runId": run_id, "reason": "timeout" }),
                ));
            }
            Err(AgentError::Failed(e)) => {
                tracing::error!(error = %e, run_id = %run_id, "Agent invocation failed");
                metrics::record_run_settled("error");
                metrics::record_error("agent");
                self.dedupe_record(
                    "chat.send",
                    &run_id,
                    CachedOutcome::failure(ErrorShape {
                        code: ErrorCode::Unavailable,
                        message: e.to_string(),
                    }),
                );
                self.events.broadcast(Frame::event(
                    "chat.final",
                    json!({
                        "sessionKey": session_key,
                        "runId": run_id,
                        "ok": false,
                        "error": e.to_string(),
                    }),
                ));
            }
        }

        let live = self.runs.lock().unwrap_or_else(|e| e.into_inner()).len();
        metrics::set_active_runs(live as u64);
    }

    /// Abort one run (validated against the caller's session key) or every
    /// live run for the session when no run id is given.
    pub fn chat_abort(
        &self,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<Value, ErrorShape> {
        match run_id {
            Some(run_id) => {
                let outcome = self
                    .runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .abort_run(session_key, run_id);
                match outcome {
                    AbortOutcome::Aborted => Ok(json!({
                        "ok": true,
                        "aborted": true,
                        "runIds": [run_id],
                    })),
                    AbortOutcome::NotFound => Ok(json!({
                        "ok": true,
                        "aborted": false,
                        "runIds": [],
                    })),
                    AbortOutcome::WrongSession => Err(ErrorShape {
                        code: ErrorCode::InvalidRequest,
                        message: format!("run {} does not belong to session {}", run_id, session_key),
                    }),
                }
            }
            None => {
                let aborted = self.abort_all(session_key);
                Ok(json!({
                    "ok": true,
                    "aborted": !aborted.is_empty(),
                    "runIds": aborted,
                }))
            }
        }
    }

    pub fn chat_history(&self, session_key: &str, limit: usize) -> Result<Value, ErrorShape> {
        let messages = self.sessions.history(session_key, limit).map_err(|e| {
            tracing::error!(error = %e, "Failed to read history");
            ErrorShape {
                code: ErrorCode::Unavailable,
                message: "session store unavailable".to_string(),
            }
        })?;
        let thinking = self
            .sessions
            .get(session_key)
            .ok()
            .flatten()
            .and_then(|r| r.thinking_level);
        Ok(json!({ "messages": messages, "thinkingLevel": thinking }))
    }

    fn abort_all(&self, session_key: &str) -> Vec<String> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_session(session_key)
    }

    fn is_stop_command(&self, message: &str) -> bool {
        let normalized = message.trim().to_lowercase();
        self.stop_commands.iter().any(|c| c == &normalized)
    }

    pub fn dedupe_get(&self, method: &str, key: &str) -> Option<CachedOutcome> {
        self.dedupe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(method, key)
            .cloned()
    }

    pub fn dedupe_record(&self, method: &str, key: &str, outcome: CachedOutcome) {
        self.dedupe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(method, key, outcome);
    }

    pub fn live_run_count(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn session_runs(&self, session_key: &str) -> Vec<String> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_runs(session_key)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Periodic maintenance: cancel expired runs and drop stale dedupe
    /// entries. Expired run records stay registered until their task settles;
    /// the cancel signal is what unblocks a hung invocation.
    pub fn sweep(&self) {
        let now = chrono::Utc::now();
        let expired = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sweep_expired(now);
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), run_ids = ?expired, "Cancelled expired runs");
        }
        let evicted = self
            .dedupe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .evict_expired(now);
        if evicted > 0 {
            tracing::debug!(count = evicted, "Evicted expired dedupe entries");
        }
        let live = self.runs.lock().unwrap_or_else(|e| e.into_inner()).len();
        metrics::set_active_runs(live as u64);
    }
}

/// Replay a cached terminal outcome, tagged for observability.
fn cached_to_result(cached: CachedOutcome) -> Result<Value, ErrorShape> {
    if cached.ok {
        let mut payload = cached.payload.unwrap_or_else(|| json!({}));
        if let Some(map) = payload.as_object_mut() {
            map.insert("cached".to_string(), json!(true));
        }
        Ok(payload)
    } else {
        Err(cached.error.unwrap_or(ErrorShape {
            code: ErrorCode::Unavailable,
            message: "cached failure".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;

    fn service_with(agent: ScriptedAgent) -> Arc<ChatService> {
        Arc::new(ChatService::new(
            Arc::new(agent),
            SessionStore::in_memory().unwrap(),
            EventHub::new(),
            Duration::from_secs(5),
            vec!["stop".to_string(), "/stop".to_string()],
        ))
    }

    fn send_req(key: &str, message: &str) -> ChatSendRequest {
        ChatSendRequest {
            session_key: "main".to_string(),
            message: message.to_string(),
            thinking: None,
            deliver: true,
            timeout_ms: None,
            idempotency_key: key.to_string(),
        }
    }

    async fn wait_settled(service: &Arc<ChatService>, key: &str) {
        for _ in 0..100 {
            if service.dedupe_get("chat.send", key).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never settled", key);
    }

    #[tokio::test]
    async fn test_send_starts_and_settles() {
        let agent = ScriptedAgent::new();
        agent.push_reply("hello back");
        let service = service_with(agent);

        let ack = service.chat_send(send_req("run-1", "hi")).unwrap();
        assert_eq!(ack["status"], "started");
        assert_eq!(ack["runId"], "run-1");

        wait_settled(&service, "run-1").await;
        let cached = service.dedupe_get("chat.send", "run-1").unwrap();
        assert!(cached.ok);
        assert_eq!(cached.payload.unwrap()["text"], "hello back");
        assert_eq!(service.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_settle_replays_cached() {
        let agent = ScriptedAgent::new();
        agent.push_reply("only once");
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "hi")).unwrap();
        wait_settled(&service, "run-1").await;

        let replay = service.chat_send(send_req("run-1", "hi")).unwrap();
        assert_eq!(replay["status"], "ok");
        assert_eq!(replay["text"], "only once");
        assert_eq!(replay["cached"], true);
    }

    #[tokio::test]
    async fn test_duplicate_while_running_is_in_flight() {
        let agent = ScriptedAgent::new();
        agent.push_delayed_reply("slow", Duration::from_secs(30));
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "hi")).unwrap();
        let dup = service.chat_send(send_req("run-1", "hi")).unwrap();
        assert_eq!(dup["status"], "in_flight");
        assert_eq!(service.live_run_count(), 1);

        service.chat_abort("main", Some("run-1")).unwrap();
        wait_settled(&service, "run-1").await;
    }

    #[tokio::test]
    async fn test_abort_settles_as_aborted() {
        let agent = ScriptedAgent::new();
        agent.push_delayed_reply("slow", Duration::from_secs(30));
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "hi")).unwrap();
        let result = service.chat_abort("main", Some("run-1")).unwrap();
        assert_eq!(result["aborted"], true);

        wait_settled(&service, "run-1").await;
        let cached = service.dedupe_get("chat.send", "run-1").unwrap();
        assert_eq!(cached.payload.unwrap()["status"], "aborted");
        assert_eq!(service.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_cross_session_abort_rejected() {
        let agent = ScriptedAgent::new();
        agent.push_delayed_reply("slow", Duration::from_secs(30));
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "hi")).unwrap();
        let err = service.chat_abort("other", Some("run-1")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(service.live_run_count(), 1);

        service.chat_abort("main", None).unwrap();
        wait_settled(&service, "run-1").await;
    }

    #[tokio::test]
    async fn test_stop_command_aborts_all_session_runs() {
        let agent = ScriptedAgent::new();
        agent.push_delayed_reply("slow-a", Duration::from_secs(30));
        agent.push_delayed_reply("slow-b", Duration::from_secs(30));
        let service = service_with(agent);

        service.chat_send(send_req("run-a", "first")).unwrap();
        service.chat_send(send_req("run-b", "second")).unwrap();
        assert_eq!(service.live_run_count(), 2);

        let ack = service.chat_send(send_req("stop-1", "  STOP ")).unwrap();
        assert_eq!(ack["aborted"], true);
        let ids = ack["runIds"].as_array().unwrap();
        assert_eq!(ids.len(), 2);
        // No third run was started for the stop message itself.
        assert!(!service.session_runs("main").contains(&"stop-1".to_string()));

        wait_settled(&service, "run-a").await;
        wait_settled(&service, "run-b").await;
    }

    #[tokio::test]
    async fn test_send_denied_by_policy() {
        let agent = ScriptedAgent::new();
        let service = service_with(agent);
        service.sessions().get_or_create("main").unwrap();
        service
            .sessions()
            .set_send_policy("main", switchboard_core::SendPolicy::Deny)
            .unwrap();

        let err = service.chat_send(send_req("run-1", "hi")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(service.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_cached_as_error() {
        let agent = ScriptedAgent::new();
        agent.push_failure("backend exploded");
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "hi")).unwrap();
        wait_settled(&service, "run-1").await;

        let err = service.chat_send(send_req("run-1", "hi")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert!(err.message.contains("backend exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_settles_run() {
        let agent = ScriptedAgent::new();
        agent.push_delayed_reply("never", Duration::from_secs(3600));
        let service = service_with(agent);

        let mut req = send_req("run-1", "hi");
        req.timeout_ms = Some(1000);
        service.chat_send(req).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        let cached = service.dedupe_get("chat.send", "run-1").unwrap();
        assert!(!cached.ok);
        assert_eq!(service.live_run_count(), 0);
    }

    #[tokio::test]
    async fn test_history_records_both_sides() {
        let agent = ScriptedAgent::new();
        agent.push_reply("pong");
        let service = service_with(agent);

        service.chat_send(send_req("run-1", "ping")).unwrap();
        wait_settled(&service, "run-1").await;

        let history = service.chat_history("main", 10).unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "agent");
    }

    #[tokio::test]
    async fn test_chat_started_event_broadcast() {
        let agent = ScriptedAgent::new();
        agent.push_reply("ok");
        let service = service_with(agent);
        let mut rx = service.events().subscribe();

        service.chat_send(send_req("run-1", "hi")).unwrap();
        let frame = rx.recv().await.unwrap();
        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, "chat.started");
                assert_eq!(data["runId"], "run-1");
            }
            other => panic!("expected event frame, got {:?}", other),
        }
    }
}
