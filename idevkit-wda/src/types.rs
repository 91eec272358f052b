//! WebDriverAgent payload types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Screen geometry in points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: f64,
    pub height: f64,
}

impl WindowSize {
    /// Center of the screen, handy for taps
    pub fn center(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.width && y <= self.height
    }
}

/// Foreground application as reported by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAppInfo {
    pub bundle_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub process_arguments: Value,
}

/// Session details returned by `GET /session/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// Raw capabilities object, agent-specific
    pub capabilities: Value,
}

/// Agent health from `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub ready: bool,
    pub message: Option<String>,
    /// Session the agent reports as current, if any
    pub session_id: Option<String>,
    pub raw: Value,
}

/// Hardware buttons understood by `wda/pressButton`
pub mod buttons {
    pub const HOME: &str = "home";
    pub const VOLUME_UP: &str = "volumeUp";
    pub const VOLUME_DOWN: &str = "volumeDown";
}
