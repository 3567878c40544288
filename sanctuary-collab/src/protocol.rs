//! Event protocol spoken between a collaboration client and the relay.
//!
//! Wire format (one WebSocket text frame per event, JSON):
//! ```text
//! ┌───────────────────────────┬──────────────────────────────┐
//! │ "event": snake_case name  │ "data": payload (camelCase)  │
//! └───────────────────────────┴──────────────────────────────┘
//! {"event":"cursor_update","data":{"position":{"x":10.0,"y":20.0}}}
//! ```
//!
//! Outbound traffic is a [`ClientEvent`], inbound traffic a [`ServerEvent`].
//! Both are closed enums, so sender and receiver agree on every payload shape
//! at compile time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A set of changed workspace-state keys and their new values.
pub type StatePatch = Map<String, Value>;

/// Cursor position in the consumer's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Client-selected operating mode.
///
/// Express mode raises the cursor update ceiling (16ms window instead of 32ms)
/// and is reported to the relay in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Express,
    Standard,
}

impl SyncMode {
    pub fn is_express(self) -> bool {
        matches!(self, SyncMode::Express)
    }
}

/// First frame sent on every new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub mode: SyncMode,
}

/// A participant's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<Position>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub is_speaking: bool,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub has_mic: bool,
}

impl Collaborator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            cursor_position: None,
            is_typing: false,
            is_speaking: false,
            has_video: false,
            has_mic: false,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Partial attribute update for a [`Collaborator`]. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_video: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_mic: Option<bool>,
}

impl CollaboratorPatch {
    pub fn cursor(position: Position) -> Self {
        Self { cursor_position: Some(position), ..Self::default() }
    }

    pub fn video(enabled: bool) -> Self {
        Self { has_video: Some(enabled), ..Self::default() }
    }

    pub fn mic(enabled: bool) -> Self {
        Self { has_mic: Some(enabled), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Produce a new record with this patch applied on top of `base`.
    pub fn apply(&self, base: &Collaborator) -> Collaborator {
        let mut next = base.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(avatar) = &self.avatar {
            next.avatar = Some(avatar.clone());
        }
        if let Some(position) = self.cursor_position {
            next.cursor_position = Some(position);
        }
        if let Some(v) = self.is_typing {
            next.is_typing = v;
        }
        if let Some(v) = self.is_speaking {
            next.is_speaking = v;
        }
        if let Some(v) = self.has_video {
            next.has_video = v;
        }
        if let Some(v) = self.has_mic {
            next.has_mic = v;
        }
        next
    }
}

/// Flag patch for one remote collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: String,
    #[serde(flatten)]
    pub patch: CollaboratorPatch,
}

/// Externally pushed express-mode multipliers. Only present fields are merged.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressModeUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_improvement: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_assistance: Option<f64>,
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Tags the connection with session and user identity
    Handshake(Handshake),
    /// Throttled local cursor position
    CursorUpdate { position: Position },
    /// Changed workspace-state keys only
    StateSync(StatePatch),
    ToggleVideo { enabled: bool },
    ToggleMic { enabled: bool },
    /// Fire-and-forget; no response is defined
    AiAssistanceRequest { task: String },
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Handshake(_) => "handshake",
            ClientEvent::CursorUpdate { .. } => "cursor_update",
            ClientEvent::StateSync(_) => "state_sync",
            ClientEvent::ToggleVideo { .. } => "toggle_video",
            ClientEvent::ToggleMic { .. } => "toggle_mic",
            ClientEvent::AiAssistanceRequest { .. } => "ai_assistance_request",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Events received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    CollaboratorJoined(Collaborator),
    /// Payload is the departing collaborator's id
    CollaboratorLeft(String),
    CursorUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        position: Position,
    },
    PresenceUpdate(PresenceUpdate),
    /// A peer's state diff
    StateSync(StatePatch),
    ExpressModeUpdate(ExpressModeUpdate),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::CollaboratorJoined(_) => "collaborator_joined",
            ServerEvent::CollaboratorLeft(_) => "collaborator_left",
            ServerEvent::CursorUpdate { .. } => "cursor_update",
            ServerEvent::PresenceUpdate(_) => "presence_update",
            ServerEvent::StateSync(_) => "state_sync",
            ServerEvent::ExpressModeUpdate(_) => "express_mode_update",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionFailed(String),
    AlreadyConnected,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::AlreadyConnected => write!(f, "Connection already open"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
