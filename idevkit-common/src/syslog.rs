//! Device syslog line source and line parsing
//!
//! [`LineSource`] owns one `idevicesyslog` process and hands out its stdout
//! line by line. [`parse_line`] turns a line into a [`LogRecord`].

use crate::toolchain::{spawn_error, IDEVICESYSLOG};
use crate::{DeviceKitError, LogLevel, LogRecord, Result, Toolchain};
use regex::Regex;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Continuous stream of log lines backed by an external process
#[derive(Debug)]
pub struct LineSource {
    device_id: String,
    program: String,
    child: Option<Child>,
    reader: Option<BufReader<ChildStdout>>,
    /// Bytes of a line whose read was interrupted; kept so reads stay cancel-safe
    pending: Vec<u8>,
    pid: Option<u32>,
    grace: Duration,
    closed: Arc<AtomicBool>,
    exit_status: Option<ExitStatus>,
    stderr_tail: Arc<Mutex<Option<String>>>,
}

impl LineSource {
    /// Start `idevicesyslog` for an attached device
    pub async fn open(toolchain: &Toolchain, device_id: &str, grace: Duration) -> Result<Self> {
        toolchain.ensure_device(device_id).await?;

        let mut cmd = toolchain.command(IDEVICESYSLOG);
        cmd.args(["-u", device_id]);
        Self::spawn(cmd, IDEVICESYSLOG, device_id, grace)
    }

    /// Start an arbitrary line-producing command
    ///
    /// stdout must be piped; stderr is drained in the background when piped.
    pub fn spawn(mut cmd: Command, program: &str, device_id: &str, grace: Duration) -> Result<Self> {
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;

        let pid = child.id();
        info!("Started {} for {} (pid {:?})", program, device_id, pid);

        let stdout = child.stdout.take().ok_or_else(|| DeviceKitError::ProcessSpawn {
            program: program.to_string(),
            reason: "stdout was not piped".to_string(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(
                stderr,
                program.to_string(),
                Arc::clone(&stderr_tail),
            ));
        }

        Ok(Self {
            device_id: device_id.to_string(),
            program: program.to_string(),
            child: Some(child),
            reader: Some(BufReader::new(stdout)),
            pending: Vec::new(),
            pid,
            grace,
            closed: Arc::new(AtomicBool::new(false)),
            exit_status: None,
            stderr_tail,
        })
    }

    /// Read the next full line; `None` once the stream has ended or was closed
    ///
    /// Cancel-safe: a read abandoned mid-line resumes where it stopped.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let read = reader
            .read_until(b'\n', &mut self.pending)
            .await
            .map_err(|e| DeviceKitError::capture(format!("{} read failed: {}", self.program, e)))?;

        if read == 0 && self.pending.is_empty() {
            debug!("{} stream ended for {}", self.program, self.device_id);
            self.reader = None;
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.exit_status = Some(status);
                }
            }
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.pending);
        while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.pop();
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period
    ///
    /// Idempotent; a second call returns immediately.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.reader = None;
        self.pending.clear();

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("{} already exited with {}", self.program, status);
            self.exit_status = Some(status);
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: `pid` belongs to a child we own and have not yet reaped
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(
                    "Failed to send SIGTERM to {} (pid {}): {}",
                    self.program,
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for {}: {}", self.program, e);
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing",
                    self.program, self.grace
                );
                child.kill().await.map_err(|e| {
                    DeviceKitError::capture(format!("Failed to kill {}: {}", self.program, e))
                })?;
                self.exit_status = child.try_wait().ok().flatten();
            }
        }

        info!("Closed {} for {}", self.program, self.device_id);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag that flips to `true` once the source is closed; usable after the
    /// source has moved into a task
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit code, once the process has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }

    /// Last line the process wrote to stderr
    pub fn last_stderr(&self) -> Option<String> {
        self.stderr_tail.lock().ok().and_then(|tail| tail.clone())
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        if !self.is_closed() && self.child.is_some() {
            // kill_on_drop takes care of the process itself
            warn!(
                "{} for {} dropped without close, killing",
                self.program, self.device_id
            );
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, program: String, tail: Arc<Mutex<Option<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{} stderr: {}", program, line);
        if let Ok(mut last) = tail.lock() {
            *last = Some(line);
        }
    }
}

fn syslog_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // Oct 18 10:11:12 iPhone SpringBoard(FrontBoard)[58] <Notice>: message
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<time>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)\s+(?P<host>\S+)\s+(?P<proc>[^\[\s]+)\[(?P<pid>\d+)\]\s+<(?P<level>\w+)>:\s?(?P<msg>.*)$",
        )
        .ok()
    })
    .as_ref()
}

fn plain_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // 2024-01-02 10:11:12 ERROR disk full / 2024 WARN low battery
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<time>\S+(?:\s+\d{2}:\d{2}:\d{2}(?:[.,]\d+)?)?)\s+\[?(?P<level>(?i:debug|trace|info|notice|warn|warning|error|fault|fatal|critical))\]?:?(?:\s+(?P<msg>.*))?$",
        )
        .ok()
    })
    .as_ref()
}

/// Parse one line of the device log stream
///
/// Lines in no known format are kept whole with level `Unknown`.
pub fn parse_line(line: &str) -> LogRecord {
    if let Some(caps) = syslog_regex().and_then(|re| re.captures(line)) {
        let process_field = &caps["proc"];
        // "SpringBoard(FrontBoard)" -> process "SpringBoard"
        let process = process_field
            .split_once('(')
            .map(|(name, _)| name)
            .unwrap_or(process_field);

        return LogRecord {
            timestamp: SystemTime::now(),
            level: LogLevel::from_token(&caps["level"]).unwrap_or(LogLevel::Unknown),
            message: caps["msg"].to_string(),
            process: Some(process.to_string()),
            pid: caps["pid"].parse().ok(),
            device_time: Some(caps["time"].to_string()),
            line: line.to_string(),
        };
    }

    if let Some(caps) = plain_regex().and_then(|re| re.captures(line)) {
        if let Some(level) = LogLevel::from_token(&caps["level"]) {
            return LogRecord {
                timestamp: SystemTime::now(),
                level,
                message: caps.name("msg").map(|m| m.as_str()).unwrap_or("").to_string(),
                process: None,
                pid: None,
                device_time: Some(caps["time"].to_string()),
                line: line.to_string(),
            };
        }
    }

    LogRecord::unparsed(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_syslog_line() {
        let line = "Oct 18 10:11:12 iPhone SpringBoard(FrontBoard)[58] <Notice>: Application launched";
        let record = parse_line(line);
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.process.as_deref(), Some("SpringBoard"));
        assert_eq!(record.pid, Some(58));
        assert_eq!(record.device_time.as_deref(), Some("Oct 18 10:11:12"));
        assert_eq!(record.message, "Application launched");
        assert_eq!(record.line, line);
    }

    #[test]
    fn test_parse_syslog_error_with_fraction() {
        let line = "Oct  3 09:00:01.123456 Test-iPhone kernel[0] <Error>: AppleBCM: link down";
        let record = parse_line(line);
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.process.as_deref(), Some("kernel"));
        assert_eq!(record.message, "AppleBCM: link down");
    }

    #[test]
    fn test_parse_plain_lines() {
        let record = parse_line("2024 ERROR disk full");
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.message, "disk full");
        assert_eq!(record.device_time.as_deref(), Some("2024"));

        let record = parse_line("2024-05-01 12:30:00.5 [WARN] low battery");
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.message, "low battery");

        let record = parse_line("2024 INFO boot");
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "boot");
    }

    #[test]
    fn test_unparseable_line_is_kept() {
        let line = "--- last message repeated 3 times ---";
        let record = parse_line(line);
        assert_eq!(record.level, LogLevel::Unknown);
        assert_eq!(record.message, line);
        assert_eq!(record.line, line);
    }

    #[test]
    fn test_unknown_syslog_level() {
        let record = parse_line("Oct 18 10:11:12 iPhone proc[1] <Odd>: text");
        assert_eq!(record.level, LogLevel::Unknown);
        assert_eq!(record.message, "text");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_line_source_reads_until_end() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'one\\ntwo\\r\\nthree'"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut source = LineSource::spawn(cmd, "sh", "test", Duration::from_millis(200)).unwrap();
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(source.read_line().await.unwrap(), None);

        source.close().await.unwrap();
        assert!(source.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_terminates_long_running_process() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo ready; exec sleep 600"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut source = LineSource::spawn(cmd, "sh", "test", Duration::from_millis(200)).unwrap();
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("ready"));

        let started = std::time::Instant::now();
        source.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(source.is_closed());
        assert_eq!(source.read_line().await.unwrap(), None);

        // Second close is a no-op
        source.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_sends_sigterm_before_grace_expires() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo ready; exec sleep 600"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut source = LineSource::spawn(cmd, "sh", "test", Duration::from_secs(10)).unwrap();
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("ready"));

        let started = std::time::Instant::now();
        source.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        // Killed by a signal, so no exit code
        assert_eq!(source.exit_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_escalates_when_sigterm_is_ignored() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap '' TERM; echo ready; while true; do sleep 1; done"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut source = LineSource::spawn(cmd, "sh", "test", Duration::from_millis(100)).unwrap();
        assert_eq!(source.read_line().await.unwrap().as_deref(), Some("ready"));

        source.close().await.unwrap();
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let mut cmd = Command::new("/nonexistent/idevicesyslog");
        cmd.stdout(std::process::Stdio::piped());
        let err = LineSource::spawn(cmd, IDEVICESYSLOG, "test", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DeviceKitError::ToolNotFound { .. }));
    }
}
