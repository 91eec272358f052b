//! Blocking entry points
//!
//! Each blocking type owns (or shares) a tokio runtime and drives the async
//! implementation on it, so both call shapes behave identically. The runtime
//! keeps a worker thread, which is where a blocking monitor's capture runs
//! between calls.
//!
//! These types must not be used from inside an async context.

use crate::monitor::{LogMonitor, MonitorOptions};
use crate::{
    AppInfo, DeviceInfo, DeviceKitError, LogRecord, MonitorConfig, MonitorState, MonitorStatus,
    Result, ToolStatus, Toolchain,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::warn;

/// Build the runtime used by the blocking wrappers
pub fn build_runtime() -> Result<Arc<Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("idevkit-worker")
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| DeviceKitError::Io(format!("Failed to create runtime: {}", e)))
}

/// Blocking mirror of [`Toolchain`]
#[derive(Debug, Clone)]
pub struct BlockingToolchain {
    toolchain: Toolchain,
    runtime: Arc<Runtime>,
}

impl BlockingToolchain {
    pub fn new(toolchain: Toolchain) -> Result<Self> {
        Ok(Self::with_runtime(toolchain, build_runtime()?))
    }

    pub fn with_runtime(toolchain: Toolchain, runtime: Arc<Runtime>) -> Self {
        Self { toolchain, runtime }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.runtime)
    }

    pub fn list_devices(&self) -> Result<Vec<String>> {
        self.runtime.block_on(self.toolchain.list_devices())
    }

    pub fn is_device_attached(&self, udid: &str) -> Result<bool> {
        self.runtime.block_on(self.toolchain.is_device_attached(udid))
    }

    pub fn ensure_device(&self, udid: &str) -> Result<()> {
        self.runtime.block_on(self.toolchain.ensure_device(udid))
    }

    pub fn wait_for_device(&self, udid: &str, timeout: Duration) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.wait_for_device(udid, timeout))
    }

    pub fn device_info(&self, udid: &str) -> Result<DeviceInfo> {
        self.runtime.block_on(self.toolchain.device_info(udid))
    }

    pub fn device_property(&self, udid: &str, key: &str) -> Result<Option<String>> {
        self.runtime
            .block_on(self.toolchain.device_property(udid, key))
    }

    pub fn list_apps(&self, udid: &str) -> Result<Vec<AppInfo>> {
        self.runtime.block_on(self.toolchain.list_apps(udid))
    }

    pub fn app_info(&self, udid: &str, bundle_id: &str) -> Result<AppInfo> {
        self.runtime
            .block_on(self.toolchain.app_info(udid, bundle_id))
    }

    pub fn install_app(&self, udid: &str, package: &Path) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.install_app(udid, package))
    }

    pub fn uninstall_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.uninstall_app(udid, bundle_id))
    }

    pub fn launch_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.launch_app(udid, bundle_id))
    }

    pub fn push_file(&self, udid: &str, local: &Path, remote: &str) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.push_file(udid, local, remote))
    }

    pub fn pull_file(&self, udid: &str, remote: &str, local: &Path) -> Result<()> {
        self.runtime
            .block_on(self.toolchain.pull_file(udid, remote, local))
    }

    pub fn reboot(&self, udid: &str) -> Result<()> {
        self.runtime.block_on(self.toolchain.reboot(udid))
    }

    pub fn shutdown(&self, udid: &str) -> Result<()> {
        self.runtime.block_on(self.toolchain.shutdown(udid))
    }

    pub fn check_tools(&self) -> Vec<ToolStatus> {
        self.toolchain.check_tools()
    }

    pub fn missing_tools(&self) -> Vec<String> {
        self.toolchain.missing_tools()
    }
}

/// Blocking mirror of [`LogMonitor`]
///
/// `start` returns as soon as the capture is running; the capture itself
/// runs on the runtime's worker thread. Dropping a running monitor stops it.
#[derive(Debug)]
pub struct BlockingLogMonitor {
    monitor: LogMonitor,
    runtime: Arc<Runtime>,
}

impl BlockingLogMonitor {
    pub fn new(toolchain: Toolchain, config: MonitorConfig) -> Result<Self> {
        Ok(Self::with_runtime(toolchain, config, build_runtime()?))
    }

    pub fn with_runtime(toolchain: Toolchain, config: MonitorConfig, runtime: Arc<Runtime>) -> Self {
        Self {
            monitor: LogMonitor::new(toolchain, config),
            runtime,
        }
    }

    /// The async monitor driven by this wrapper
    pub fn monitor(&self) -> &LogMonitor {
        &self.monitor
    }

    pub fn start(&self, options: MonitorOptions) -> Result<()> {
        self.runtime.block_on(self.monitor.start(options))
    }

    pub fn stop(&self) -> Result<()> {
        self.runtime.block_on(self.monitor.stop())
    }

    pub fn get_logs(&self) -> Result<Vec<LogRecord>> {
        self.monitor.get_logs()
    }

    pub fn state(&self) -> MonitorState {
        self.monitor.state()
    }

    pub fn status(&self) -> MonitorStatus {
        self.monitor.status()
    }

    pub fn last_error(&self) -> Option<DeviceKitError> {
        self.monitor.last_error()
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn source_closed(&self) -> bool {
        self.monitor.source_closed()
    }

    /// Block until the capture ends on its own
    pub fn join(&self) -> MonitorStatus {
        self.runtime.block_on(self.monitor.join())
    }

    /// Run `f` while capturing, then stop; `stop` also runs if `f` panics
    pub fn scoped<F, R>(&self, options: MonitorOptions, f: F) -> Result<R>
    where
        F: FnOnce(&BlockingLogMonitor) -> Result<R>,
    {
        self.start(options)?;

        let mut guard = StopGuard {
            monitor: self,
            armed: true,
        };
        let result = f(self);
        guard.armed = false;

        let stopped = self.stop();
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Capture for a fixed duration and return what matched
    pub fn capture(
        toolchain: Toolchain,
        config: MonitorConfig,
        options: MonitorOptions,
    ) -> Result<Vec<LogRecord>> {
        let runtime = build_runtime()?;
        runtime.block_on(LogMonitor::capture(toolchain, config, options))
    }
}

impl Drop for BlockingLogMonitor {
    fn drop(&mut self) {
        if self.monitor.state() == MonitorState::Running {
            if let Err(e) = self.runtime.block_on(self.monitor.stop()) {
                warn!("Failed to stop log monitor on drop: {}", e);
            }
        }
    }
}

struct StopGuard<'a> {
    monitor: &'a BlockingLogMonitor,
    armed: bool,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Scoped log capture unwinding, stopping monitor");
            let _ = self.monitor.stop();
        }
    }
}
