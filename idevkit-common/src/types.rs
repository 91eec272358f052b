//! Common types for idevkit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Information about an attached iOS device, as reported by `ideviceinfo`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub udid: String,
    pub device_name: Option<String>,
    pub product_type: Option<String>,
    pub product_version: Option<String>,
    pub build_version: Option<String>,
    /// Every `Key: Value` pair the tool printed
    pub properties: BTreeMap<String, String>,
}

/// An installed application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub bundle_id: String,
    pub version: Option<String>,
    pub name: String,
}

impl AppInfo {
    /// Apple-signed system apps live under the `com.apple.` prefix
    pub fn is_system(&self) -> bool {
        self.bundle_id.starts_with("com.apple.")
    }
}

/// Availability of one toolchain binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub program: String,
    pub path: Option<std::path::PathBuf>,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        self.path.is_some()
    }
}

/// Severity of a device log record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Unknown,
}

impl LogLevel {
    /// Map a level token from either syslog (`<Notice>`) or plain
    /// (`WARN`) log formats
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "debug" | "d" | "trace" | "verbose" | "v" => Some(Self::Debug),
            "info" | "i" | "notice" | "default" => Some(Self::Info),
            "warn" | "w" | "warning" => Some(Self::Warn),
            "error" | "e" | "err" | "fault" | "fatal" | "critical" | "crit" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed line of the device log stream. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    /// Host time at which the line was read
    pub timestamp: SystemTime,
    pub level: LogLevel,
    pub message: String,
    /// Originating process, when the line carried one
    pub process: Option<String>,
    pub pid: Option<u32>,
    /// Timestamp text as printed by the device
    pub device_time: Option<String>,
    /// The line exactly as it was read
    pub line: String,
}

impl LogRecord {
    /// Record for a line that did not match any known format
    pub fn unparsed(line: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level: LogLevel::Unknown,
            message: line.to_string(),
            process: None,
            pid: None,
            device_time: None,
            line: line.to_string(),
        }
    }
}

/// Lifecycle of a log monitor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

/// Why a running capture ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    DurationElapsed,
    Failed,
}

/// Point-in-time status of a log monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub capture_id: String,
    pub device_id: Option<String>,
    pub state: MonitorState,
    pub stop_reason: Option<StopReason>,
    pub lines_read: u64,
    pub records_matched: u64,
    pub source_pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub stopped_at: Option<SystemTime>,
    pub last_error: Option<crate::DeviceKitError>,
}
