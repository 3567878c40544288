//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;
use crate::presence::CursorIntervals;
use crate::protocol::{Collaborator, Handshake, SyncMode};

/// How `participantCount` is maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantCounting {
    /// Incremented on join, decremented (floored at zero) on leave.
    /// Can drift from the roster if a join/leave pair is missed.
    #[default]
    EventCounted,
    /// Always equal to the remote roster size.
    RosterDerived,
}

/// Configuration for one collaboration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay base URL; the session id is appended as a path segment
    pub server_url: String,
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub avatar: Option<String>,
    pub mode: SyncMode,
    /// Cursor throttle window in express mode
    pub express_cursor_interval_ms: u64,
    /// Cursor throttle window in standard mode
    pub standard_cursor_interval_ms: u64,
    pub participant_counting: ParticipantCounting,
    /// Seed values for the metrics record
    pub initial_metrics: Metrics,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session_id: String::new(),
            user_id: String::new(),
            user_name: String::new(),
            avatar: None,
            mode: SyncMode::Express,
            express_cursor_interval_ms: 16,
            standard_cursor_interval_ms: 32,
            participant_counting: ParticipantCounting::EventCounted,
            initial_metrics: Metrics::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(
        server_url: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse and validate a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.trim().is_empty() {
            return Err(ConfigError::MissingField("session_id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::MissingField("user_id"));
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.server_url.clone()));
        }
        Ok(())
    }

    /// Connection URL: `<server_url>/<session_id>`.
    pub fn session_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.session_id)
    }

    pub fn handshake(&self) -> Handshake {
        Handshake {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            mode: self.mode,
        }
    }

    /// The local user's own presence record.
    pub fn local_collaborator(&self) -> Collaborator {
        Collaborator {
            avatar: self.avatar.clone(),
            ..Collaborator::new(self.user_id.clone(), self.user_name.clone())
        }
    }

    pub fn cursor_intervals(&self) -> CursorIntervals {
        CursorIntervals {
            express: Duration::from_millis(self.express_cursor_interval_ms),
            standard: Duration::from_millis(self.standard_cursor_interval_ms),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Parse(String),
    MissingField(&'static str),
    InvalidUrl(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "Invalid configuration: {e}"),
            Self::MissingField(field) => write!(f, "Missing required field: {field}"),
            Self::InvalidUrl(url) => write!(f, "Server URL must use ws:// or wss://: {url}"),
        }
    }
}

impl std::error::Error for ConfigError {}
