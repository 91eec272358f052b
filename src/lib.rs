//! idevkit
//!
//! Automation for a physically attached iOS device: libimobiledevice command
//! wrappers, live syslog monitoring, and a WebDriverAgent session client.

pub use idevkit_common as common;
pub use idevkit_wda as wda;

pub use idevkit_common::{
    init_logging, init_logging_from_config, AppConfig, BlockingLogMonitor, BlockingToolchain,
    ConfigManager, DeviceKitError, FilterSpec, LogLevel, LogMonitor, LogRecord, MonitorOptions,
    MonitorState, Result, Toolchain,
};
pub use idevkit_wda::{BlockingSessionClient, SessionClient};
