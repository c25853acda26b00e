// ABOUTME: Cron subsystem — fires configured jobs into the chat service on schedule.
// ABOUTME: Each firing carries a synthetic idempotency key so a restart never double-fires.

use crate::server::GatewayCore;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatSendRequest;

struct ParsedJob {
    id: String,
    schedule: Schedule,
    session_key: String,
    message: String,
}

/// Spawn the cron runner. Exits immediately when the subsystem is disabled
/// or no job parses; the reload driver respawns it with fresh config.
pub fn spawn(core: Arc<GatewayCore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = core.config();
        if !config.cron.enabled {
            tracing::debug!("Cron subsystem disabled");
            return;
        }

        let tz: chrono_tz::Tz = match config.cron.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(
                    timezone = %config.cron.timezone,
                    "Invalid cron timezone, falling back to UTC"
                );
                chrono_tz::Tz::UTC
            }
        };

        let mut jobs = Vec::new();
        for job in &config.cron.jobs {
            match Schedule::from_str(&job.schedule) {
                Ok(schedule) => jobs.push(ParsedJob {
                    id: job.id.clone(),
                    schedule,
                    session_key: job.session_key.clone(),
                    message: job.message.clone(),
                }),
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        schedule = %job.schedule,
                        error = %e,
                        "Skipping job with invalid cron expression"
                    );
                }
            }
        }

        if jobs.is_empty() {
            tracing::debug!("Cron subsystem has no runnable jobs");
            return;
        }

        tracing::info!(jobs = jobs.len(), timezone = %tz, "Cron subsystem started");
        run_jobs(core, jobs, tz, cancel).await;
    })
}

async fn run_jobs(
    core: Arc<GatewayCore>,
    jobs: Vec<ParsedJob>,
    tz: chrono_tz::Tz,
    cancel: CancellationToken,
) {
    loop {
        // Snapshot each job's next tick before sleeping; after the wakeup
        // `upcoming()` would already report the tick after this one.
        let dues: Vec<Option<DateTime<Utc>>> = jobs.iter().map(|j| job_next(j, tz)).collect();
        let Some(next_at) = dues.iter().flatten().min().copied() else {
            tracing::info!("All cron jobs exhausted their schedules");
            return;
        };

        let wait = (next_at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Cron subsystem stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        // Fire every job due at the wakeup instant. The key is derived from
        // the tick, not the wall clock, so a respawned runner that fires the
        // same tick again is deduped downstream.
        for (job, due) in jobs.iter().zip(&dues) {
            if *due == Some(next_at) {
                fire(&core, job, next_at);
            }
        }
    }
}

fn job_next(job: &ParsedJob, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    job.schedule
        .upcoming(tz)
        .next()
        .map(|at| at.with_timezone(&Utc))
}

fn fire(core: &Arc<GatewayCore>, job: &ParsedJob, tick: DateTime<Utc>) {
    let idempotency_key = format!("cron-{}-{}", job.id, tick.timestamp());
    tracing::info!(
        job_id = %job.id,
        session_key = %job.session_key,
        run_id = %idempotency_key,
        "Cron job firing"
    );

    let result = core.chat.chat_send(ChatSendRequest {
        session_key: job.session_key.clone(),
        message: job.message.clone(),
        thinking: None,
        deliver: true,
        timeout_ms: None,
        idempotency_key,
    });
    if let Err(e) = result {
        tracing::error!(job_id = %job.id, code = %e.code, error = %e.message, "Cron job rejected");
    }
}
