//! Error handling for idevkit

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across idevkit
pub type Result<T> = std::result::Result<T, DeviceKitError>;

/// Main error type for device management, log capture and automation
///
/// Payloads are plain strings so the error stays `Clone` and can be stored as
/// a monitor's last error after the capture task has gone away.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceKitError {
    #[error("Device not available: {device_id}")]
    DeviceUnavailable { device_id: String },

    #[error("Toolchain binary not found: {program}")]
    ToolNotFound { program: String },

    #[error("Failed to start {program}: {reason}")]
    ProcessSpawn { program: String, reason: String },

    #[error("{program} exited with status {exit_code:?}: {stderr}")]
    Toolchain {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Application not installed: {bundle_id}")]
    AppNotFound { bundle_id: String },

    #[error("Automation agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("Session creation failed (status {status:?}): {message}")]
    SessionCreate { status: Option<u16>, message: String },

    #[error("No active automation session")]
    NoActiveSession,

    #[error("Automation agent returned status {status}: {message}")]
    AgentProtocol { status: u16, message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Log monitor has already been started")]
    MonitorAlreadyRunning,

    #[error("Log capture failed: {0}")]
    CaptureFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DeviceKitError {
    /// Create a timeout error for the named operation
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a capture failure
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Self::CaptureFailed(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a device-unavailable error
    pub fn device_unavailable<S: Into<String>>(device_id: S) -> Self {
        Self::DeviceUnavailable {
            device_id: device_id.into(),
        }
    }

    /// Get the error category for classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DeviceUnavailable { .. } | Self::AppNotFound { .. } => ErrorCategory::Device,
            Self::ToolNotFound { .. } | Self::ProcessSpawn { .. } | Self::Toolchain { .. } => {
                ErrorCategory::Toolchain
            }
            Self::AgentUnreachable(_)
            | Self::SessionCreate { .. }
            | Self::NoActiveSession
            | Self::AgentProtocol { .. } => ErrorCategory::Agent,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::MonitorAlreadyRunning | Self::CaptureFailed(_) => ErrorCategory::Monitor,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::Serialization(_) => ErrorCategory::System,
            Self::InvalidRequest(_) => ErrorCategory::Application,
        }
    }

    /// Check whether retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::AgentUnreachable(_) => true,
            // A dying log stream can be restarted with a fresh monitor
            Self::CaptureFailed(_) => true,
            Self::DeviceUnavailable { .. } => false,
            Self::ToolNotFound { .. } | Self::ProcessSpawn { .. } => false,
            Self::Toolchain { .. } | Self::AppNotFound { .. } => false,
            Self::SessionCreate { .. } | Self::NoActiveSession | Self::AgentProtocol { .. } => {
                false
            }
            Self::MonitorAlreadyRunning => false,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) | Self::InvalidRequest(_) => {
                false
            }
        }
    }

    /// Get suggested recovery action
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::DeviceUnavailable { device_id } => Some(format!(
                "Ensure device {} is attached, unlocked and trusts this computer",
                device_id
            )),
            Self::ToolNotFound { program } => Some(format!(
                "Install libimobiledevice so that {} is on PATH, or set toolchain.bin_dir",
                program
            )),
            Self::Timeout { .. } => Some("Retry the operation or raise the timeout".to_string()),
            Self::AgentUnreachable(_) => Some(
                "Check that WebDriverAgent is running and its port is forwarded".to_string(),
            ),
            Self::NoActiveSession => {
                Some("Create a session first or enable implicit sessions".to_string())
            }
            Self::MonitorAlreadyRunning => {
                Some("Construct a new monitor for each capture".to_string())
            }
            Self::Config(_) => Some("Review and correct configuration settings".to_string()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeviceKitError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceKitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DeviceKitError {
    fn from(err: anyhow::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// Error categories for classification and handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Device,
    Toolchain,
    Agent,
    Timeout,
    Monitor,
    Configuration,
    System,
    Application,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_worthy_errors_are_distinguished() {
        assert!(DeviceKitError::timeout("ideviceinfo").is_recoverable());
        assert!(DeviceKitError::AgentUnreachable("refused".into()).is_recoverable());
        assert!(!DeviceKitError::device_unavailable("abc").is_recoverable());
        assert!(!DeviceKitError::ToolNotFound {
            program: "idevice_id".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            DeviceKitError::device_unavailable("abc").category(),
            ErrorCategory::Device
        );
        assert_eq!(
            DeviceKitError::Toolchain {
                program: "afcclient".into(),
                exit_code: Some(1),
                stderr: "boom".into(),
            }
            .category(),
            ErrorCategory::Toolchain
        );
        assert_eq!(DeviceKitError::NoActiveSession.category(), ErrorCategory::Agent);
        assert_eq!(
            DeviceKitError::MonitorAlreadyRunning.category(),
            ErrorCategory::Monitor
        );
    }

    #[test]
    fn test_toolchain_error_display_carries_stderr() {
        let err = DeviceKitError::Toolchain {
            program: "ideviceinstaller".into(),
            exit_code: Some(255),
            stderr: "ERROR: Could not connect to lockdownd".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ideviceinstaller"));
        assert!(text.contains("255"));
        assert!(text.contains("lockdownd"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DeviceKitError = io.into();
        assert!(matches!(err, DeviceKitError::Io(ref m) if m.contains("denied")));
    }
}
