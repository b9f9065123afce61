use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a messaging-account instance, supplied by the backend.
pub type InstanceId = String;

/// Longest instance id accepted; the id is embedded in a directory name.
pub const MAX_INSTANCE_ID_LEN: usize = 64;

/// Addressing suffix for one-to-one chats on the chat protocol.
pub const CHAT_ID_SUFFIX: &str = "@c.us";

/// Maximum size of a JSON-lines frame exchanged with a bridge process (256 KiB).
pub const MAX_BRIDGE_LINE_BYTES: usize = 256 * 1024;

/// Check that an instance id is usable as a registry key and a credential
/// directory name: non-empty, bounded, ASCII alphanumerics, `-` and `_` only.
pub fn validate_instance_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("instance_id must not be empty".to_string());
    }
    if id.len() > MAX_INSTANCE_ID_LEN {
        return Err(format!(
            "instance_id too long: {} > {MAX_INSTANCE_ID_LEN}",
            id.len()
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("instance_id contains invalid character {bad:?}"));
    }
    Ok(())
}

/// Turn a bare number into a chat id; ids already in chat form pass through.
pub fn normalize_recipient(recipient: &str) -> String {
    let recipient = recipient.trim();
    if recipient.contains(CHAT_ID_SUFFIX) {
        recipient.to_string()
    } else {
        format!("{recipient}{CHAT_ID_SUFFIX}")
    }
}

/// Lifecycle state of one instance's session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    AwaitingPairing,
    Connected,
    Disconnected,
}

impl SessionState {
    /// True while a protocol client exists for the session.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::AwaitingPairing | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::AwaitingPairing => "awaiting_pairing",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Read-only view of a session, as returned by the status query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub instance_id: InstanceId,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_identifier: Option<String>,
}

/// Body of `POST /connect`. Fields are optional so that a missing field is
/// reported as a validation error rather than a deserialization failure.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectRequest {
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
}

/// Body of `POST /send-message`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status returned by a connect request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Initializing,
    AlreadyConnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
}

/// Generic `{status, message}` reply used by the send and error paths.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiReply {
    Success { message: String },
    Error { message: String },
}

/// Connection status carried by backend reports and ready events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportStatus::Connected => write!(f, "connected"),
            ReportStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events pushed to viewers subscribed to one instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    /// A fresh pairing code, rendered as an image data URL.
    PairingCode { image: String },
    /// The account finished pairing.
    Ready { status: ReportStatus, phone: String },
}

/// Body of the status report sent to the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackendReport {
    pub instance_id: InstanceId,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl BackendReport {
    pub fn connected(instance_id: &str, phone: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status: ReportStatus::Connected,
            phone: Some(phone.to_string()),
        }
    }

    pub fn disconnected(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status: ReportStatus::Disconnected,
            phone: None,
        }
    }
}

/// Commands written to a bridge process's stdin, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BridgeCommand {
    Initialize { id: u64 },
    SendMessage { id: u64, chat_id: String, body: String },
    Destroy { id: u64 },
}

/// Lines read from a bridge process's stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        code: String,
    },
    Ready {
        account: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Message {
        from: String,
        body: String,
    },
    /// A command with this id completed.
    Ack {
        id: u64,
    },
    /// A command failed; `id` is absent for failures not tied to a command.
    Error {
        #[serde(default)]
        id: Option<u64>,
        message: String,
    },
}
