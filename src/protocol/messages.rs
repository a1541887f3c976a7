//! Frame types exchanged between client and server.
//!
//! Every frame is one JSON object tagged by `type`. Commands and replies are
//! closed enums tagged by `name`; anything else fails to decode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::Policy;

/// Version sent in the handshake; the server refuses any other.
pub const PROTOCOL_VERSION: u32 = 1;

/// A command the server executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Command {
    Limit { ip: String, groups: Vec<Policy> },
    Reset { group: String },
    ResetAll,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Limit { .. } => "limit",
            Command::Reset { .. } => "reset",
            Command::ResetAll => "reset_all",
        }
    }
}

/// The server's answer to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Reply {
    /// `response` is `None` when allowed, the unix-ms reset instant when denied
    Limit { response: Option<i64> },
    Reset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ResetAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { key: String, version: u32 },
    Request { id: Uuid, command: Command },
    Ping { nonce: u64 },
}

/// Why the server could not answer a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Protocol,
    Store,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome,
    Rejected {
        reason: String,
    },
    Response {
        id: Uuid,
        reply: Reply,
    },
    Failed {
        #[serde(default)]
        id: Option<Uuid>,
        kind: FailureKind,
        message: String,
    },
    Pong {
        nonce: u64,
    },
}

impl ServerFrame {
    /// Build the failure frame for an error raised while serving `id`.
    pub fn failure(id: Option<Uuid>, error: &FloodgateError) -> Self {
        let (kind, message) = match error {
            FloodgateError::TransientStore(message) => (FailureKind::Store, message.clone()),
            FloodgateError::Protocol(message) => (FailureKind::Protocol, message.clone()),
            other => (FailureKind::Protocol, other.to_string()),
        };
        ServerFrame::Failed { id, kind, message }
    }

    /// Rebuild the error a `failed` frame describes.
    pub fn failure_error(kind: FailureKind, message: String) -> FloodgateError {
        match kind {
            FailureKind::Store => FloodgateError::TransientStore(message),
            FailureKind::Protocol => FloodgateError::Protocol(message),
        }
    }
}

/// Decode a client frame.
///
/// On failure the request id is salvaged when the frame carried a readable
/// one, so the error can be routed back to the caller that sent it.
pub fn decode_client_frame(line: &str) -> std::result::Result<ClientFrame, (Option<Uuid>, FloodgateError)> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| (None, FloodgateError::Protocol(format!("invalid JSON: {}", e))))?;

    let id = value
        .get("id")
        .and_then(|id| id.as_str())
        .and_then(|id| Uuid::parse_str(id).ok());

    serde_json::from_value(value)
        .map_err(|e| (id, FloodgateError::Protocol(format!("unrecognized frame: {}", e))))
}

/// Decode a server frame.
pub fn decode_server_frame(line: &str) -> Result<ServerFrame> {
    serde_json::from_str(line)
        .map_err(|e| FloodgateError::Protocol(format!("unrecognized server frame: {}", e)))
}
