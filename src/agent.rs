// ABOUTME: Agent runtime seam between the control plane and the AI-agent layer.
// ABOUTME: Defines the invocation contract plus a scripted runtime for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One prompt dispatched to the agent layer on behalf of a chat run.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub session_key: String,
    pub session_id: String,
    pub message: String,
    /// Wall-clock budget for this run. The runtime must give up by then.
    pub deadline: Duration,
    /// Cancelled when the run is aborted. The runtime must stop promptly.
    pub cancel: CancellationToken,
}

/// Final agent output for a completed run.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("run aborted")]
    Aborted,
    #[error("run exceeded its deadline")]
    Timeout,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Backend contract. Implementations may stream internally; the control
/// plane only consumes the settled reply.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Runtime name for logging and metrics
    fn name(&self) -> &'static str;

    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, AgentError>;
}

/// Deterministic runtime that replays queued replies in order.
///
/// Used by integration tests and `--dry-run` startup checks. Honors the
/// invocation's cancel token and deadline so abort paths are exercised
/// the same way a real backend would exercise them.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<ScriptedReply>>,
}

enum ScriptedReply {
    Reply { text: String, delay: Duration },
    Failure(String),
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        self.push_delayed_reply(text, Duration::ZERO);
    }

    /// Queue a reply that settles only after `delay`, for abort and
    /// timeout tests.
    pub fn push_delayed_reply(&self, text: impl Into<String>, delay: Duration) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedReply::Reply {
                text: text.into(),
                delay,
            });
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedReply::Failure(message.into()));
    }

    fn next(&self) -> Option<ScriptedReply> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedAgent {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, AgentError> {
        let scripted = self
            .next()
            .unwrap_or(ScriptedReply::Reply {
                text: "ok".to_string(),
                delay: Duration::ZERO,
            });

        match scripted {
            ScriptedReply::Failure(message) => Err(AgentError::Failed(anyhow::anyhow!(message))),
            ScriptedReply::Reply { text, delay } => {
                tokio::select! {
                    _ = invocation.cancel.cancelled() => Err(AgentError::Aborted),
                    _ = tokio::time::sleep(invocation.deadline) => Err(AgentError::Timeout),
                    _ = tokio::time::sleep(delay) => {
                        let input_tokens = (invocation.message.len() / 4) as u64;
                        let output_tokens = (text.len() / 4) as u64;
                        Ok(AgentReply {
                            text,
                            input_tokens,
                            output_tokens,
                        })
                    }
                }
            }
        }
    }
}
