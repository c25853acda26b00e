// ABOUTME: Registry of in-flight chat runs with cooperative cancellation handles.
// ABOUTME: Enforces one live record per run id, session-scoped aborts, and expiry sweeps.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One in-flight agent invocation. Registered when `chat.send` accepts a
/// request and removed when the invocation settles, on every exit path.
#[derive(Debug, Clone)]
pub struct ChatRunRecord {
    pub session_key: String,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a targeted abort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The run was live and its cancellation handle fired.
    Aborted,
    /// No live run with this id.
    NotFound,
    /// The run exists but belongs to a different session key.
    WrongSession,
}

/// Bookkeeping for live runs, keyed by the client-supplied run id. The run id
/// doubles as the idempotency key for `chat.send`.
pub struct ChatRunRegistry {
    runs: HashMap<String, ChatRunRecord>,
}

impl ChatRunRegistry {
    pub fn new() -> Self {
        Self {
            runs: HashMap::new(),
        }
    }

    /// Register a new run. Returns the cancellation token handed to the
    /// downstream invocation, or None if a run with this id is already live.
    pub fn register(
        &mut self,
        run_id: &str,
        session_key: &str,
        timeout: Duration,
    ) -> Option<CancellationToken> {
        if self.runs.contains_key(run_id) {
            return None;
        }
        let now = Utc::now();
        let cancel = CancellationToken::new();
        self.runs.insert(
            run_id.to_string(),
            ChatRunRecord {
                session_key: session_key.to_string(),
                cancel: cancel.clone(),
                started_at: now,
                expires_at: now + timeout,
            },
        );
        Some(cancel)
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Remove a settled run. Called from the guaranteed cleanup path; a run
    /// that never reaches this is a leak.
    pub fn remove(&mut self, run_id: &str) -> Option<ChatRunRecord> {
        self.runs.remove(run_id)
    }

    /// Abort one run, validating that it belongs to the calling session.
    /// Cross-session aborts are rejected without touching the run.
    pub fn abort_run(&mut self, session_key: &str, run_id: &str) -> AbortOutcome {
        match self.runs.get(run_id) {
            None => AbortOutcome::NotFound,
            Some(record) if record.session_key != session_key => AbortOutcome::WrongSession,
            Some(record) => {
                record.cancel.cancel();
                AbortOutcome::Aborted
            }
        }
    }

    /// Abort every live run for a session. Returns the run ids whose
    /// cancellation handles fired.
    pub fn abort_session(&mut self, session_key: &str) -> Vec<String> {
        let mut aborted = Vec::new();
        for (run_id, record) in &self.runs {
            if record.session_key == session_key {
                record.cancel.cancel();
                aborted.push(run_id.clone());
            }
        }
        aborted.sort();
        aborted
    }

    /// Live run ids for a session, oldest first.
    pub fn session_runs(&self, session_key: &str) -> Vec<String> {
        let mut runs: Vec<_> = self
            .runs
            .iter()
            .filter(|(_, r)| r.session_key == session_key)
            .collect();
        runs.sort_by_key(|(_, r)| r.started_at);
        runs.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Cancel and collect runs whose expiry has passed. Defends against a
    /// hung downstream call whose future never settles: the normal cleanup
    /// path still removes the record once the invocation observes the token.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for (run_id, record) in &self.runs {
            if record.expires_at <= now {
                record.cancel.cancel();
                expired.push(run_id.clone());
            }
        }
        expired.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl Default for ChatRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
