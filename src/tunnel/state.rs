//! Tunnel lifecycle states, attempts and failures

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelState {
    Idle,
    Preparing,
    ResolvingAddress,
    ApplyingSettings,
    StartingEngine,
    Running,
    Stopping,
    Failed,
}

impl TunnelState {
    /// A connect attempt (Preparing through StartingEngine) or a stop is
    /// in progress
    pub fn is_in_flight(&self) -> bool {
        self.is_connecting() || *self == TunnelState::Stopping
    }

    /// Between Preparing and StartingEngine
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            TunnelState::Preparing
                | TunnelState::ResolvingAddress
                | TunnelState::ApplyingSettings
                | TunnelState::StartingEngine
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Idle => "idle",
            TunnelState::Preparing => "preparing",
            TunnelState::ResolvingAddress => "resolving-address",
            TunnelState::ApplyingSettings => "applying-settings",
            TunnelState::StartingEngine => "starting-engine",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal failure of one connect attempt
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "kebab-case")]
pub enum TunnelError {
    #[error("no configuration available")]
    NoConfiguration,

    #[error("engine start timed out")]
    EngineStartTimeout,

    #[error("engine start failed: {0}")]
    EngineStartFailed(String),

    #[error("applying network settings failed: {0}")]
    SettingsApplyFailed(String),
}

/// Longest engine reason shown to users
const MAX_REASON_CHARS: usize = 160;

impl TunnelError {
    /// Short message for display
    pub fn user_message(&self) -> String {
        match self {
            TunnelError::NoConfiguration => "No server configured. Add a server link first.".to_string(),
            TunnelError::EngineStartTimeout => {
                "The VPN engine did not start in time. Try again.".to_string()
            }
            TunnelError::EngineStartFailed(reason) => {
                let reason = reason.lines().next().unwrap_or_default();
                let short: String = reason.chars().take(MAX_REASON_CHARS).collect();
                if short.is_empty() {
                    "The VPN engine failed to start.".to_string()
                } else {
                    format!("The VPN engine failed to start: {}", short)
                }
            }
            TunnelError::SettingsApplyFailed(_) => {
                "Could not apply network settings.".to_string()
            }
        }
    }
}

/// Record of one connect attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelAttempt {
    /// Distinguishes attempts in logs and status snapshots
    pub id: Uuid,

    pub state: TunnelState,

    /// Server address from the document
    pub server_address: Option<String>,

    /// IPv4 address the server address resolved to
    pub server_ip: Option<Ipv4Addr>,

    pub socks_port: u16,

    pub http_port: u16,

    pub started_at: DateTime<Utc>,

    /// Set once the attempt failed
    pub error: Option<TunnelError>,
}

impl TunnelAttempt {
    pub fn new() -> Self {
        TunnelAttempt {
            id: Uuid::new_v4(),
            state: TunnelState::Preparing,
            server_address: None,
            server_ip: None,
            socks_port: 0,
            http_port: 0,
            started_at: Utc::now(),
            error: None,
        }
    }
}

impl Default for TunnelAttempt {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot returned by `TunnelManager::status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// The path is currently unusable; only meaningful while running
    pub degraded: bool,
    pub attempt: Option<TunnelAttempt>,
}

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TunnelEvent {
    StateChanged { state: TunnelState },
    DegradedChanged { degraded: bool },
    Failed { message: String },
}
