//! idevkit common library
//!
//! Shared types, error handling, configuration and the device-side building
//! blocks: the libimobiledevice toolchain facade and live syslog monitoring.

pub mod blocking;
pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod monitor;
pub mod syslog;
pub mod toolchain;
pub mod types;

pub use blocking::{build_runtime, BlockingLogMonitor, BlockingToolchain};
pub use buffer::{BufferConfig, BufferStats, LogBuffer};
pub use config::{
    parse_config, AgentConfig, AppConfig, ConfigFormat, ConfigManager, LoggingConfig,
    MonitorConfig, ToolchainConfig,
};
pub use error::{DeviceKitError, ErrorCategory, Result};
pub use filter::FilterSpec;
pub use logging::{init_logging, init_logging_from_config, init_logging_with_level};
pub use monitor::{LogMonitor, LogRecordStream, MonitorOptions};
pub use syslog::{parse_line, LineSource};
pub use toolchain::Toolchain;
pub use types::*;
