// ABOUTME: Pure reload reconciliation: diff two config trees into dot paths,
// ABOUTME: then classify the paths into a restart/hot-apply plan. No side effects here.

use serde_json::Value;
use std::collections::BTreeSet;

/// Provider ids recognized by the path classifier. The provider set is
/// closed; a `providers.<id>` path outside this list falls through to the
/// safe full-restart default.
pub const PROVIDER_IDS: &[&str] = &[
    "telegram", "whatsapp", "discord", "slack", "signal", "imessage", "teams",
];

/// The computed decision for one reload cycle. Immutable once built; the
/// driver consumes it exactly once. Every changed path lands in exactly one
/// of the audit lists, so nothing is silently dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    pub restart_gateway: bool,
    pub restart_reasons: Vec<String>,
    pub hot_reasons: Vec<String>,
    pub noop_paths: Vec<String>,
    pub reload_hooks: bool,
    pub restart_gmail_watcher: bool,
    pub restart_browser_control: bool,
    pub restart_cron: bool,
    pub restart_heartbeat: bool,
    pub restart_providers: BTreeSet<String>,
}

impl ReloadPlan {
    /// True when the plan requires no action at all.
    pub fn is_noop(&self) -> bool {
        !self.restart_gateway
            && !self.reload_hooks
            && !self.restart_gmail_watcher
            && !self.restart_browser_control
            && !self.restart_cron
            && !self.restart_heartbeat
            && self.restart_providers.is_empty()
            && self.hot_reasons.is_empty()
    }

    pub fn log_summary(&self) {
        if self.restart_gateway {
            tracing::info!(reasons = ?self.restart_reasons, "Reload plan: full gateway restart");
            return;
        }
        tracing::info!(
            hot = ?self.hot_reasons,
            noop = ?self.noop_paths,
            providers = ?self.restart_providers,
            cron = self.restart_cron,
            heartbeat = self.restart_heartbeat,
            gmail = self.restart_gmail_watcher,
            browser = self.restart_browser_control,
            "Reload plan: hot apply"
        );
    }
}

/// Deep-compare two config trees and return the dot paths whose leaf values
/// differ. Arrays are compared by value as a single leaf at the array's own
/// path: replacing a list is one change, not one change per element.
pub fn diff_config_paths(prev: &Value, next: &Value) -> Vec<String> {
    let mut changed = Vec::new();
    diff_into(prev, next, String::new(), &mut changed);
    changed.sort();
    changed
}

fn diff_into(prev: &Value, next: &Value, path: String, out: &mut Vec<String>) {
    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: BTreeSet<&String> = a.keys().collect();
            keys.extend(b.keys());
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                let left = a.get(key).unwrap_or(&Value::Null);
                let right = b.get(key).unwrap_or(&Value::Null);
                diff_into(left, right, child, out);
            }
        }
        // Everything else, arrays included, is a leaf compared wholesale.
        (a, b) => {
            if a != b {
                out.push(path);
            }
        }
    }
}

/// Classify changed dot paths into a reload plan using the static
/// prefix-to-effect table. Paths matching no rule default to a full gateway
/// restart: an unknown change is assumed unsafe to hot-apply.
pub fn build_reload_plan(changed_paths: &[String]) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    for path in changed_paths {
        if path == "gateway.remote" || path.starts_with("gateway.remote.") {
            // Only affects outbound CLI calls, never this process.
            plan.noop_paths.push(path.clone());
        } else if path == "gateway" || path.starts_with("gateway.") {
            plan.restart_gateway = true;
            plan.restart_reasons.push(path.clone());
        } else if path.starts_with("hooks.gmail") {
            plan.restart_gmail_watcher = true;
            plan.reload_hooks = true;
            plan.hot_reasons.push(path.clone());
        } else if path.starts_with("hooks.") {
            plan.reload_hooks = true;
            plan.hot_reasons.push(path.clone());
        } else if let Some(provider) = provider_for_path(path) {
            plan.restart_providers.insert(provider.to_string());
            plan.hot_reasons.push(path.clone());
        } else if path == "cron" || path.starts_with("cron.") {
            plan.restart_cron = true;
            plan.hot_reasons.push(path.clone());
        } else if path == "heartbeat" || path.starts_with("heartbeat.") {
            plan.restart_heartbeat = true;
            plan.hot_reasons.push(path.clone());
        } else if path == "browser" || path.starts_with("browser.") {
            plan.restart_browser_control = true;
            plan.hot_reasons.push(path.clone());
        } else if path == "agent" || path.starts_with("agent.") {
            // Handlers read config copy-on-read; swapping the snapshot is enough.
            plan.hot_reasons.push(path.clone());
        } else {
            plan.restart_gateway = true;
            plan.restart_reasons.push(path.clone());
        }
    }

    plan
}

fn provider_for_path(path: &str) -> Option<&'static str> {
    let rest = path.strip_prefix("providers.")?;
    let id = rest.split('.').next().unwrap_or(rest);
    PROVIDER_IDS.iter().copied().find(|known| *known == id)
}
