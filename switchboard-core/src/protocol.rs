// ABOUTME: Wire protocol types for the gateway control plane.
// ABOUTME: Defines req/res/event frames, the connect handshake, and the error taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single protocol version this gateway speaks. Clients advertise a
/// supported range in `connect`; the handshake fails unless this version
/// falls inside it.
pub const PROTOCOL_VERSION: u32 = 1;

/// One frame on the wire. Requests expect a matching `res`; events are
/// fire-and-forget in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            event: event.into(),
            data,
        }
    }
}

/// Structured error carried in a failed `res` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
}

/// Fixed error taxonomy. Validation failures and cross-session aborts are
/// INVALID_REQUEST; downstream agent/provider failures are UNAVAILABLE;
/// handshake failures get their own codes so clients can distinguish a bad
/// credential from a malformed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "AUTH_REQUIRED")]
    AuthRequired,
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "PROTOCOL_MISMATCH")]
    ProtocolMismatch,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unavailable => "UNAVAILABLE",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::ProtocolMismatch => "PROTOCOL_MISMATCH",
            Self::NotFound => "NOT_FOUND",
        };
        write!(f, "{}", s)
    }
}

/// Parameters of the `connect` handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

/// Client self-description sent during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: ClientMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    Cli,
    Tui,
    Webchat,
    Bridge,
    Test,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Credentials never appear in logs.
impl std::fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthParams")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Successful handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol_version: u32,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl HelloOk {
    pub fn new(protocol_version: u32) -> Self {
        Self {
            typ: "hello-ok".to_string(),
            protocol_version,
            server: ServerInfo {
                name: "switchboard".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Compute the protocol version to use for a client range, if the server's
/// version falls inside it.
pub fn negotiate_protocol(min: u32, max: u32) -> Option<u32> {
    if min <= PROTOCOL_VERSION && PROTOCOL_VERSION <= max {
        Some(PROTOCOL_VERSION)
    } else {
        None
    }
}
