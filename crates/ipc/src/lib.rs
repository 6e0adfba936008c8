//! Backtick++ IPC Protocol
//!
//! Shared types for helper-client communication over a Unix domain socket.
//!
//! One request and one reply per connection:
//! - Request: `command` or `command:payload` (payload is a JSON object)
//! - Reply: `OK:` plus an optional JSON payload, or `ERROR:` plus a message

use backtick_core_order::{ActivationMode, NewWindowPosition, WindowId, WindowSnapshot};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known socket path for IPC communication.
pub const SOCKET_PATH: &str = "/tmp/backtick-plus-plus-helper.sock";

/// Maximum request size in bytes. Longer requests are truncated and will fail to parse.
pub const MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix of a successful reply.
pub const OK_PREFIX: &str = "OK:";

/// Prefix of an error reply.
pub const ERROR_PREFIX: &str = "ERROR:";

/// Errors produced while parsing a request.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty request")]
    EmptyRequest,

    #[error("Request is not valid UTF-8")]
    InvalidEncoding,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing payload for {0}")]
    MissingPayload(&'static str),

    #[error("Malformed {command} payload: {source}")]
    MalformedPayload {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while decoding a reply on the client side.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("Unrecognized reply: {0}")]
    UnrecognizedReply(String),

    #[error("Helper returned an error: {0}")]
    Server(String),

    #[error("Invalid reply payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Payload of the `getWindows` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetWindowsRequest {
    /// Where newly discovered windows are placed.
    pub new_window_position: NewWindowPosition,
    /// Whether the focused window is promoted on this query.
    pub activation_mode: ActivationMode,
}

/// Payload of the `activateWindow` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateWindowRequest {
    /// Window to activate.
    pub id: WindowId,
}

/// Commands that can be sent from a client to the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    /// Report whether accessibility permission is granted.
    GetStatus,
    /// Trigger the OS permission prompt.
    RequestPermission,
    /// Enumerate windows in the persisted order.
    GetWindows(GetWindowsRequest),
    /// Activate a window and promote it to the front.
    ActivateWindow(ActivateWindowRequest),
    /// Stop the helper after replying.
    Shutdown,
}

impl IpcCommand {
    /// Parse a raw request.
    ///
    /// Only the first colon separates the command from its payload. A single
    /// trailing newline is ignored. Commands that take no payload ignore any
    /// payload supplied.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw
            .strip_suffix("\r\n")
            .or_else(|| raw.strip_suffix('\n'))
            .unwrap_or(raw);
        if raw.is_empty() {
            return Err(ProtocolError::EmptyRequest);
        }

        let (name, payload) = match raw.split_once(':') {
            Some((name, payload)) => (name, payload),
            None => (raw, ""),
        };

        match name {
            "getStatus" => Ok(Self::GetStatus),
            "requestPermission" => Ok(Self::RequestPermission),
            "getWindows" => parse_payload("getWindows", payload).map(Self::GetWindows),
            "activateWindow" => parse_payload("activateWindow", payload).map(Self::ActivateWindow),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Parse a raw request read from the socket.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidEncoding)?;
        Self::parse(text)
    }

    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetStatus => "getStatus",
            Self::RequestPermission => "requestPermission",
            Self::GetWindows(_) => "getWindows",
            Self::ActivateWindow(_) => "activateWindow",
            Self::Shutdown => "shutdown",
        }
    }

    /// Encode this command as a wire request.
    pub fn encode(&self) -> String {
        let payload = match self {
            Self::GetWindows(req) => serde_json::to_string(req).ok(),
            Self::ActivateWindow(req) => serde_json::to_string(req).ok(),
            Self::GetStatus | Self::RequestPermission | Self::Shutdown => None,
        };
        match payload {
            Some(json) => format!("{}:{}", self.name(), json),
            None => self.name().to_string(),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(
    command: &'static str,
    payload: &str,
) -> Result<T, ProtocolError> {
    if payload.trim().is_empty() {
        return Err(ProtocolError::MissingPayload(command));
    }
    serde_json::from_str(payload).map_err(|source| ProtocolError::MalformedPayload { command, source })
}

/// Payload of a `getStatus` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Whether the helper may control other applications.
    pub has_accessibility_permission: bool,
}

/// One window in a `getWindows` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    /// Window identifier.
    pub id: WindowId,
    /// Window title.
    pub title: String,
    /// Whether the OS currently has this window focused.
    pub is_currently_active: bool,
}

impl From<WindowSnapshot> for WindowInfo {
    fn from(window: WindowSnapshot) -> Self {
        Self {
            id: window.id,
            title: window.title,
            is_currently_active: window.is_active,
        }
    }
}

/// Responses from the helper to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcResponse {
    /// Command executed successfully, no payload.
    Ok,
    /// Permission status.
    Status(StatusResponse),
    /// Windows in the persisted order.
    Windows(Vec<WindowInfo>),
    /// Command failed.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl IpcResponse {
    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Encode this response as a wire reply.
    pub fn encode(&self) -> String {
        let payload = match self {
            Self::Ok => return OK_PREFIX.to_string(),
            Self::Error { message } => return format!("{}{}", ERROR_PREFIX, message),
            Self::Status(status) => serde_json::to_string(status),
            Self::Windows(windows) => serde_json::to_string(windows),
        };
        match payload {
            Ok(json) => format!("{}{}", OK_PREFIX, json),
            Err(e) => format!("{}Failed to encode response: {}", ERROR_PREFIX, e),
        }
    }
}

/// A reply as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK:` with the (possibly empty) payload text.
    Ok(String),
    /// `ERROR:` with the message text.
    Error(String),
}

impl Reply {
    /// Split a raw reply into its status and payload.
    pub fn parse(raw: &str) -> Result<Self, ReplyError> {
        if let Some(payload) = raw.strip_prefix(OK_PREFIX) {
            Ok(Self::Ok(payload.to_string()))
        } else if let Some(message) = raw.strip_prefix(ERROR_PREFIX) {
            Ok(Self::Error(message.to_string()))
        } else {
            Err(ReplyError::UnrecognizedReply(raw.to_string()))
        }
    }

    /// Return the payload of a successful reply, or the server's message as an error.
    pub fn into_payload(self) -> Result<String, ReplyError> {
        match self {
            Self::Ok(payload) => Ok(payload),
            Self::Error(message) => Err(ReplyError::Server(message)),
        }
    }

    /// Decode the JSON payload of a successful reply.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ReplyError> {
        let payload = self.into_payload()?;
        Ok(serde_json::from_str(&payload)?)
    }
}
