// ABOUTME: Browser-control subsystem handle. The CDP client runs as a connector;
// ABOUTME: this task only advertises the control channel and reports liveness.

use crate::server::GatewayCore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::protocol::Frame;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ANNOUNCE_PERIOD: Duration = Duration::from_secs(30);

/// Spawn the browser-control handle. Announces the control port to connected
/// clients on a slow cadence so late joiners discover it. Exits immediately
/// when disabled.
pub fn spawn(core: Arc<GatewayCore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = core.config();
        if !config.browser.enabled {
            tracing::debug!("Browser control disabled");
            return;
        }
        let control_port = config.browser.control_port;
        tracing::info!(control_port, "Browser control started");

        let mut ticker = tokio::time::interval(ANNOUNCE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Browser control stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            core.events.broadcast(Frame::event(
                "browser.control",
                json!({ "controlPort": control_port, "available": true }),
            ));
        }
    })
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
    async fn test_disabled_browser_exits() {
        let core = core_with("");
        spawn(core, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_carries_control_port() {
        let core = core_with("[browser]\nenabled = true\ncontrol_port = 9321\n");
        let mut events = core.events.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn(core, cancel.clone());

        // First interval tick completes immediately.
        let frame = events.recv().await.unwrap();
        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, "browser.control");
                assert_eq!(data["controlPort"], 9321);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
