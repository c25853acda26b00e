// ABOUTME: Per-connection state machine — handshake, auth, frame dispatch, event fanout.
// ABOUTME: connecting → hello-pending → authenticated → closed; malformed frames never kill the connection.

use crate::providers::ProviderId;
use crate::server::GatewayCore;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::metrics;
use switchboard_core::protocol::{
    negotiate_protocol, AuthParams, ClientMode, ConnectParams, ErrorCode, Frame, HelloOk,
};
use switchboard_core::AuthMode;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge attachments declared in the connect caps, e.g.
/// "provider:telegram:default". Detached when the connection drops.
struct BridgeAttachments {
    core: Arc<GatewayCore>,
    attached: Vec<(ProviderId, String)>,
}

impl BridgeAttachments {
    fn attach(core: &Arc<GatewayCore>, caps: &[String]) -> Self {
        let mut attached = Vec::new();
        for cap in caps {
            let mut parts = cap.splitn(3, ':');
            if parts.next() != Some("provider") {
                continue;
            }
            let Some(provider) = parts.next().and_then(ProviderId::parse) else {
                tracing::warn!(cap = %cap, "Ignoring unknown provider capability");
                continue;
            };
            let account = parts.next().unwrap_or("default").to_string();
            core.bridges.attach(provider, &account);
            attached.push((provider, account));
        }
        Self {
            core: Arc::clone(core),
            attached,
        }
    }
}

impl Drop for BridgeAttachments {
    fn drop(&mut self) {
        for (provider, account) in &self.attached {
            self.core.bridges.detach(*provider, account);
        }
    }
}

pub async fn handle_socket(socket: WebSocket, core: Arc<GatewayCore>) {
    let conn_id = core.next_connection_id();
    core.connection_opened();
    tracing::debug!(conn_id, "Connection accepted");

    if let Err(e) = drive(socket, &core, conn_id).await {
        tracing::debug!(conn_id, error = %e, "Connection ended with error");
    }

    core.connection_closed();
    tracing::debug!(conn_id, "Connection closed");
}

async fn drive(socket: WebSocket, core: &Arc<GatewayCore>, conn_id: u64) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();

    // Hello-pending: the first frame must be a connect request, within the
    // handshake window.
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, next_text(&mut stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(()),
        Err(_) => {
            tracing::debug!(conn_id, "Handshake timed out");
            return Ok(());
        }
    };

    let (hello, params) = match handshake(core, &first) {
        Ok(accepted) => accepted,
        Err(rejection) => {
            send_frame(&mut sink, &rejection).await?;
            return Ok(());
        }
    };

    send_frame(&mut sink, &hello).await?;
    metrics::record_handshake("ok");
    tracing::info!(
        conn_id,
        client = %params.client.id,
        mode = ?params.client.mode,
        "Client authenticated"
    );

    // Bridge-mode clients declare which connector accounts they serve.
    let _attachments = match params.client.mode {
        ClientMode::Bridge => Some(BridgeAttachments::attach(core, &params.caps)),
        _ => None,
    };

    // Authenticated: dispatch requests and fan out server events.
    let mut events_rx = core.events.subscribe();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "Transport error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_text(core, conn_id, &text).await {
                            send_frame(&mut sink, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(frame) => send_frame(&mut sink, &frame).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(conn_id, skipped = n, "Event fanout lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

/// Validate the connect request. Returns the hello-ok response or the
/// rejection frame to send before closing.
fn handshake(core: &Arc<GatewayCore>, text: &str) -> Result<(Frame, ConnectParams), Frame> {
    let frame: Frame = serde_json::from_str(text).map_err(|e| {
        metrics::record_handshake("malformed");
        Frame::error("", ErrorCode::InvalidRequest, format!("malformed frame: {}", e))
    })?;

    let (id, method, params) = match frame {
        Frame::Req { id, method, params } => (id, method, params),
        _ => {
            metrics::record_handshake("malformed");
            return Err(Frame::error(
                "",
                ErrorCode::InvalidRequest,
                "expected a connect request",
            ));
        }
    };

    if method != "connect" {
        metrics::record_handshake("malformed");
        return Err(Frame::error(
            id,
            ErrorCode::InvalidRequest,
            "first request must be connect",
        ));
    }

    let params: ConnectParams = serde_json::from_value(params).map_err(|e| {
        metrics::record_handshake("malformed");
        Frame::error(
            id.clone(),
            ErrorCode::InvalidRequest,
            format!("invalid connect params: {}", e),
        )
    })?;

    let Some(version) = negotiate_protocol(params.min_protocol, params.max_protocol) else {
        metrics::record_handshake("protocol_mismatch");
        return Err(Frame::error(
            id,
            ErrorCode::ProtocolMismatch,
            format!(
                "no protocol overlap: client supports {}..={}",
                params.min_protocol, params.max_protocol
            ),
        ));
    };

    let config = core.config();
    if let Err(code) = check_auth(&config.gateway.auth.mode, &config, params.auth.as_ref()) {
        metrics::record_handshake("auth_failed");
        // No detail beyond "invalid": don't leak whether the credential exists.
        let message = match code {
            ErrorCode::AuthRequired => "authentication required",
            _ => "invalid credentials",
        };
        return Err(Frame::error(id, code, message));
    }

    let payload = serde_json::to_value(HelloOk::new(version)).map_err(|e| {
        Frame::error(id.clone(), ErrorCode::Unavailable, e.to_string())
    })?;
    Ok((Frame::ok(id, payload), params))
}

fn check_auth(
    mode: &AuthMode,
    config: &switchboard_core::Config,
    auth: Option<&AuthParams>,
) -> Result<(), ErrorCode> {
    match mode {
        AuthMode::None => Ok(()),
        AuthMode::Token => {
            let expected = config.gateway.auth.token.as_deref().unwrap_or_default();
            let supplied = auth.and_then(|a| a.token.as_deref());
            match supplied {
                None => Err(ErrorCode::AuthRequired),
                Some(token) if token == expected && !expected.is_empty() => Ok(()),
                Some(_) => Err(ErrorCode::AuthFailed),
            }
        }
        AuthMode::Password => {
            let expected = config.gateway.auth.password.as_deref().unwrap_or_default();
            let supplied = auth.and_then(|a| a.password.as_deref());
            match supplied {
                None => Err(ErrorCode::AuthRequired),
                Some(password) if password == expected && !expected.is_empty() => Ok(()),
                Some(_) => Err(ErrorCode::AuthFailed),
            }
        }
    }
}

/// Handle one post-handshake frame. Returns the frame to send back, if any.
async fn handle_text(core: &Arc<GatewayCore>, conn_id: u64, text: &str) -> Option<Frame> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Malformed frame");
            return Some(Frame::error(
                "",
                ErrorCode::InvalidRequest,
                format!("malformed frame: {}", e),
            ));
        }
    };

    match frame {
        Frame::Req { id, method, params } => {
            if method == "connect" {
                return Some(Frame::error(
                    id,
                    ErrorCode::InvalidRequest,
                    "already connected",
                ));
            }
            let result = super::methods::dispatch(core, &method, params).await;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics::record_rpc_request(method.clone(), outcome);
            Some(match result {
                Ok(payload) => Frame::ok(id, payload),
                Err(error) => {
                    Frame::error(id, error.code, error.message)
                }
            })
        }
        Frame::Event { event, data } => {
            handle_client_event(core, conn_id, &event, data);
            None
        }
        Frame::Res { .. } => {
            tracing::debug!(conn_id, "Ignoring unsolicited response frame");
            None
        }
    }
}

/// Fire-and-forget notifications from clients. Bridges report inbound
/// traffic this way.
fn handle_client_event(core: &Arc<GatewayCore>, conn_id: u64, event: &str, data: Value) {
    match event {
        "provider.inbound" => {
            let provider = data
                .get("provider")
                .and_then(|v| v.as_str())
                .and_then(ProviderId::parse);
            let account = data
                .get("accountId")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            if let Some(provider) = provider {
                core.providers.note_inbound(provider, account);
            }
        }
        "hook.gmail.inbound" => {
            crate::hooks::handle_inbound(core, data);
        }
        other => {
            tracing::debug!(conn_id, event = %other, "Ignoring unknown client event");
        }
    }
}

async fn next_text(stream: &mut futures_util::stream::SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => return Some(text.to_string()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}
