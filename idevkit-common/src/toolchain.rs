//! libimobiledevice command execution and device management
//!
//! Every call is a single request/response exchange with one of the
//! libimobiledevice command-line tools, bounded by the configured timeout.

use crate::{AppInfo, DeviceInfo, DeviceKitError, Result, ToolStatus, ToolchainConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

pub const IDEVICE_ID: &str = "idevice_id";
pub const IDEVICEINFO: &str = "ideviceinfo";
pub const IDEVICEINSTALLER: &str = "ideviceinstaller";
pub const IDEVICEDEBUG: &str = "idevicedebug";
pub const AFCCLIENT: &str = "afcclient";
pub const IDEVICEDIAGNOSTICS: &str = "idevicediagnostics";
pub const IDEVICESYSLOG: &str = "idevicesyslog";

/// Every binary the toolchain facade and the log monitor may invoke
pub const TOOLS: &[&str] = &[
    IDEVICE_ID,
    IDEVICEINFO,
    IDEVICEINSTALLER,
    IDEVICEDEBUG,
    AFCCLIENT,
    IDEVICEDIAGNOSTICS,
    IDEVICESYSLOG,
];

/// Executor for the libimobiledevice command-line tools
#[derive(Debug, Clone)]
pub struct Toolchain {
    bin_dir: Option<PathBuf>,
    command_timeout: Duration,
}

impl Toolchain {
    /// Create a toolchain resolving binaries on PATH
    pub fn new() -> Self {
        Self {
            bin_dir: None,
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Create a toolchain from the `[toolchain]` configuration section
    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self {
            bin_dir: config.bin_dir.clone(),
            command_timeout: config.command_timeout(),
        }
    }

    /// Resolve binaries inside a specific directory
    pub fn with_bin_dir<P: Into<PathBuf>>(mut self, bin_dir: P) -> Self {
        self.bin_dir = Some(bin_dir.into());
        self
    }

    /// Set command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Path used to launch a tool
    pub fn program_path(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Command for a tool with piped output, killed if dropped
    pub(crate) fn command(&self, tool: &str) -> Command {
        let mut cmd = Command::new(self.program_path(tool));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a tool to completion and return its stdout
    pub async fn execute(&self, tool: &str, args: &[&str]) -> Result<String> {
        debug!("Executing: {} {}", tool, args.join(" "));

        let mut cmd = self.command(tool);
        cmd.args(args);

        // On timeout the output future is dropped and kill_on_drop reaps the child
        let output = timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| DeviceKitError::timeout(tool))?
            .map_err(|e| spawn_error(tool, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} failed: {}", tool, stderr);
            return Err(DeviceKitError::Toolchain {
                program: tool.to_string(),
                exit_code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a tool against one device, mapping "no device" failures
    async fn execute_for_device(&self, udid: &str, tool: &str, args: &[&str]) -> Result<String> {
        self.ensure_device(udid).await?;

        let mut full_args = vec!["-u", udid];
        full_args.extend_from_slice(args);

        match self.execute(tool, &full_args).await {
            Err(DeviceKitError::Toolchain { stderr, .. })
                if stderr.contains("No device found") =>
            {
                Err(DeviceKitError::device_unavailable(udid))
            }
            other => other,
        }
    }

    /// Get identifiers of attached devices
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let output = self.execute(IDEVICE_ID, &["-l"]).await?;
        let devices = parse_device_list(&output);
        info!("Found {} devices", devices.len());
        Ok(devices)
    }

    /// Check whether a device is currently enumerable
    pub async fn is_device_attached(&self, udid: &str) -> Result<bool> {
        Ok(self.list_devices().await?.iter().any(|d| d == udid))
    }

    /// Fail with `DeviceUnavailable` unless the device is enumerable
    pub async fn ensure_device(&self, udid: &str) -> Result<()> {
        if self.is_device_attached(udid).await? {
            Ok(())
        } else {
            Err(DeviceKitError::device_unavailable(udid))
        }
    }

    /// Wait for a device to be attached
    pub async fn wait_for_device(&self, udid: &str, timeout_duration: Duration) -> Result<()> {
        info!("Waiting for device {} to attach", udid);

        let start_time = std::time::Instant::now();
        while start_time.elapsed() < timeout_duration {
            if self.is_device_attached(udid).await? {
                info!("Device {} is attached", udid);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(DeviceKitError::timeout(format!("waiting for device {}", udid)))
    }

    /// Get device information (`ideviceinfo`)
    pub async fn device_info(&self, udid: &str) -> Result<DeviceInfo> {
        let output = self.execute_for_device(udid, IDEVICEINFO, &[]).await?;
        Ok(parse_device_info(udid, &output))
    }

    /// Get a single lockdown property (`ideviceinfo -k`)
    pub async fn device_property(&self, udid: &str, key: &str) -> Result<Option<String>> {
        let output = self
            .execute_for_device(udid, IDEVICEINFO, &["-k", key])
            .await?;
        let value = output.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    /// List installed applications, system apps included
    pub async fn list_apps(&self, udid: &str) -> Result<Vec<AppInfo>> {
        let output = self
            .execute_for_device(udid, IDEVICEINSTALLER, &["-l", "-o", "list_all"])
            .await?;
        let apps = parse_app_list(&output);
        info!("Device {} has {} applications", udid, apps.len());
        Ok(apps)
    }

    /// Get one application's metadata
    pub async fn app_info(&self, udid: &str, bundle_id: &str) -> Result<AppInfo> {
        self.list_apps(udid)
            .await?
            .into_iter()
            .find(|app| app.bundle_id == bundle_id)
            .ok_or_else(|| DeviceKitError::AppNotFound {
                bundle_id: bundle_id.to_string(),
            })
    }

    /// Install an application package (.ipa)
    pub async fn install_app(&self, udid: &str, package: &Path) -> Result<()> {
        let package = package.to_string_lossy();
        info!("Installing {} on {}", package, udid);
        self.execute_for_device(udid, IDEVICEINSTALLER, &["-i", &package])
            .await?;
        Ok(())
    }

    /// Uninstall an application by bundle identifier
    pub async fn uninstall_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        info!("Uninstalling {} from {}", bundle_id, udid);
        self.execute_for_device(udid, IDEVICEINSTALLER, &["-U", bundle_id])
            .await?;
        Ok(())
    }

    /// Launch an application and detach from it
    pub async fn launch_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        info!("Launching {} on {}", bundle_id, udid);
        self.execute_for_device(udid, IDEVICEDEBUG, &["--detach", "run", bundle_id])
            .await?;
        Ok(())
    }

    /// Copy a local file onto the device
    pub async fn push_file(&self, udid: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        info!("Pushing {} -> {}:{}", local, udid, remote);
        self.execute_for_device(udid, AFCCLIENT, &["put", &local, remote])
            .await?;
        Ok(())
    }

    /// Copy a device file to the local filesystem
    pub async fn pull_file(&self, udid: &str, remote: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        info!("Pulling {}:{} -> {}", udid, remote, local);
        self.execute_for_device(udid, AFCCLIENT, &["get", remote, &local])
            .await?;
        Ok(())
    }

    /// Reboot the device
    pub async fn reboot(&self, udid: &str) -> Result<()> {
        info!("Rebooting {}", udid);
        self.execute_for_device(udid, IDEVICEDIAGNOSTICS, &["restart"])
            .await?;
        Ok(())
    }

    /// Power the device off
    pub async fn shutdown(&self, udid: &str) -> Result<()> {
        info!("Shutting down {}", udid);
        self.execute_for_device(udid, IDEVICEDIAGNOSTICS, &["shutdown"])
            .await?;
        Ok(())
    }

    /// Resolve every toolchain binary
    pub fn check_tools(&self) -> Vec<ToolStatus> {
        TOOLS
            .iter()
            .map(|tool| {
                let path = match &self.bin_dir {
                    Some(dir) => Some(dir.join(tool)).filter(|p| p.is_file()),
                    None => which::which(tool).ok(),
                };
                ToolStatus {
                    program: tool.to_string(),
                    path,
                }
            })
            .collect()
    }

    /// Names of toolchain binaries that could not be found
    pub fn missing_tools(&self) -> Vec<String> {
        self.check_tools()
            .into_iter()
            .filter(|status| !status.is_available())
            .map(|status| status.program)
            .collect()
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a spawn failure, singling out a missing binary
pub(crate) fn spawn_error(tool: &str, err: std::io::Error) -> DeviceKitError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DeviceKitError::ToolNotFound {
            program: tool.to_string(),
        }
    } else {
        DeviceKitError::ProcessSpawn {
            program: tool.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Parse `idevice_id -l` output: one identifier per line
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // `idevice_id -n` style suffixes such as "(USB)" are not part of the id
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Parse `ideviceinfo` output (`Key: Value` per line, nested values indented)
pub fn parse_device_info(udid: &str, output: &str) -> DeviceInfo {
    let mut properties = BTreeMap::new();

    for line in output.lines() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                properties.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    DeviceInfo {
        udid: udid.to_string(),
        device_name: properties.get("DeviceName").cloned(),
        product_type: properties.get("ProductType").cloned(),
        product_version: properties.get("ProductVersion").cloned(),
        build_version: properties.get("BuildVersion").cloned(),
        properties,
    }
}

/// Parse `ideviceinstaller -l` output
///
/// Rows look like `com.example.app, "1.2.3", "Example"` after a
/// `CFBundleIdentifier, ...` header.
pub fn parse_app_list(output: &str) -> Vec<AppInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("CFBundleIdentifier") && !line.starts_with("Total:"))
        .filter_map(parse_app_line)
        .collect()
}

fn parse_app_line(line: &str) -> Option<AppInfo> {
    let mut fields = split_quoted_fields(line).into_iter();
    let bundle_id = fields.next().filter(|id| !id.is_empty())?;
    let version = fields.next().filter(|v| !v.is_empty());
    let name = fields.next().unwrap_or_else(|| bundle_id.clone());

    Some(AppInfo {
        bundle_id,
        version,
        name,
    })
}

/// Split a comma-separated row whose fields may be double-quoted
fn split_quoted_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}
