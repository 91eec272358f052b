//! Background capture of a device's system log
//!
//! A [`LogMonitor`] runs exactly once: `Idle -> Running -> Stopped`. The
//! capture task owns the [`LineSource`] and the output file; every way the
//! task can end (stop request, duration expiry, stream failure) goes through
//! the same cleanup before the monitor reports `Stopped`.

use crate::filter::{self, FilterSpec};
use crate::syslog::{parse_line, LineSource};
use crate::{
    BufferConfig, DeviceKitError, LogBuffer, LogRecord, MonitorConfig, MonitorState,
    MonitorStatus, Result, StopReason, Toolchain,
};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What to capture and where to put it
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub device_id: String,
    pub filter: FilterSpec,
    /// Matching lines are appended here, one per line
    pub output_file: Option<PathBuf>,
    /// Self-stop after this much wall-clock time
    pub duration: Option<Duration>,
}

impl MonitorOptions {
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            filter: FilterSpec::default(),
            output_file: None,
            duration: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_output_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// State visible to both the monitor handle and its capture task
#[derive(Debug)]
struct MonitorShared {
    buffer: LogBuffer,
    status: RwLock<MonitorStatus>,
    tail: Mutex<Option<broadcast::Sender<LogRecord>>>,
    done: watch::Sender<bool>,
    source_closed: Mutex<Option<Arc<AtomicBool>>>,
}

impl MonitorShared {
    fn read_status(&self) -> MonitorStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_status<F: FnOnce(&mut MonitorStatus)>(&self, update: F) {
        match self.status.write() {
            Ok(mut status) => update(&mut status),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    fn publish(&self, record: LogRecord) {
        if let Ok(tail) = self.tail.lock() {
            if let Some(sender) = tail.as_ref() {
                // No subscribers is fine
                let _ = sender.send(record);
            }
        }
    }

    /// Terminal transition; the buffer is frozen before the state flips
    fn finish(&self, outcome: Result<StopReason>) {
        self.buffer.freeze();

        let (reason, last_error) = match outcome {
            Ok(reason) => (reason, None),
            Err(e) => {
                error!("Log capture failed: {}", e);
                (StopReason::Failed, Some(e))
            }
        };

        self.update_status(|status| {
            status.state = MonitorState::Stopped;
            status.stop_reason = Some(reason);
            status.stopped_at = Some(SystemTime::now());
            if last_error.is_some() {
                status.last_error = last_error;
            }
        });

        if let Ok(mut tail) = self.tail.lock() {
            tail.take();
        }
        self.done.send_replace(true);
    }
}

#[derive(Debug)]
struct MonitorInner {
    toolchain: Toolchain,
    config: MonitorConfig,
    shared: Arc<MonitorShared>,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        // Dropping `stop_tx` wakes the capture task, which cleans up on its own
        if self.shared.read_status().state == MonitorState::Running {
            warn!("Log monitor dropped while running, stopping capture");
        }
    }
}

/// Single-use controller for one background log capture
#[derive(Debug, Clone)]
pub struct LogMonitor {
    inner: Arc<MonitorInner>,
}

impl LogMonitor {
    pub fn new(toolchain: Toolchain, config: MonitorConfig) -> Self {
        let buffer = LogBuffer::with_config(BufferConfig {
            max_records: config.max_records,
        });
        let (tail, _) = broadcast::channel(config.tail_capacity.max(1));
        let (done, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);

        let status = MonitorStatus {
            capture_id: Uuid::new_v4().to_string(),
            device_id: None,
            state: MonitorState::Idle,
            stop_reason: None,
            lines_read: 0,
            records_matched: 0,
            source_pid: None,
            started_at: None,
            stopped_at: None,
            last_error: None,
        };

        Self {
            inner: Arc::new(MonitorInner {
                toolchain,
                config,
                shared: Arc::new(MonitorShared {
                    buffer,
                    status: RwLock::new(status),
                    tail: Mutex::new(Some(tail)),
                    done,
                    source_closed: Mutex::new(None),
                }),
                stop_tx,
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Open the log stream and start the background capture
    ///
    /// Returns once the process is running; capture continues in a task.
    pub async fn start(&self, options: MonitorOptions) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if self.state() != MonitorState::Idle {
            return Err(DeviceKitError::MonitorAlreadyRunning);
        }

        let mut source = LineSource::open(
            &self.inner.toolchain,
            &options.device_id,
            self.inner.config.kill_grace(),
        )
        .await?;

        let sink = match &options.output_file {
            Some(path) => match open_sink(path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    if let Err(close_err) = source.close().await {
                        warn!("Failed to close log source after sink error: {}", close_err);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let shared = Arc::clone(&self.inner.shared);
        if let Ok(mut closed) = shared.source_closed.lock() {
            *closed = Some(source.closed_flag());
        }
        shared.update_status(|status| {
            status.state = MonitorState::Running;
            status.device_id = Some(options.device_id.clone());
            status.source_pid = source.pid();
            status.started_at = Some(SystemTime::now());
        });

        info!(
            "Log capture started for {} (keywords: {:?}, duration: {:?}, output: {:?})",
            options.device_id, options.filter.keywords, options.duration, options.output_file
        );

        let deadline = options.duration.map(|duration| Instant::now() + duration);
        let stop_rx = self.inner.stop_tx.subscribe();
        *task = Some(tokio::spawn(run_capture(
            shared,
            source,
            sink,
            options.filter,
            deadline,
            stop_rx,
        )));

        Ok(())
    }

    /// Stop the capture and wait for cleanup to finish
    ///
    /// Safe to call any number of times and from any task.
    pub async fn stop(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        self.inner.stop_tx.send_replace(true);

        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!("Log capture task ended abnormally: {}", e);
                self.inner
                    .shared
                    .finish(Err(DeviceKitError::capture(format!("capture task aborted: {}", e))));
            }
        }

        if self.state() != MonitorState::Stopped {
            // Never started
            self.inner.shared.finish(Ok(StopReason::Requested));
        }

        debug!("Log monitor {} stopped", self.status().capture_id);
        Ok(())
    }

    /// Ordered copy of every captured record
    pub fn get_logs(&self) -> Result<Vec<LogRecord>> {
        self.inner.shared.buffer.snapshot()
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.inner.shared.buffer
    }

    pub fn state(&self) -> MonitorState {
        self.inner.shared.read_status().state
    }

    pub fn status(&self) -> MonitorStatus {
        self.inner.shared.read_status()
    }

    /// Error that ended the capture, if it failed
    pub fn last_error(&self) -> Option<DeviceKitError> {
        self.inner.shared.read_status().last_error
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Whether the log process has been shut down; `false` before `start`
    pub fn source_closed(&self) -> bool {
        self.inner
            .shared
            .source_closed
            .lock()
            .ok()
            .and_then(|flag| flag.as_ref().map(|f| f.load(Ordering::Acquire)))
            .unwrap_or(false)
    }

    /// Wait until the capture ends on its own (duration or stream end)
    ///
    /// Returns immediately when the monitor was never started.
    pub async fn join(&self) -> MonitorStatus {
        if self.state() != MonitorState::Idle {
            let mut done = self.inner.shared.done.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status()
    }

    /// Live stream of matching records from now on
    ///
    /// Ends when the capture stops. A subscriber that falls more than
    /// `tail_capacity` records behind skips ahead.
    pub fn subscribe(&self) -> LogRecordStream {
        let receiver = self
            .inner
            .shared
            .tail
            .lock()
            .ok()
            .and_then(|tail| tail.as_ref().map(|sender| sender.subscribe()));

        let stream = futures::stream::unfold(receiver, |receiver| async move {
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok(record) => return Some((record, Some(receiver))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Live tail lagged, skipped {} records", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        LogRecordStream {
            inner: stream.boxed(),
        }
    }

    /// Run `f` against this monitor while it captures, then stop it
    ///
    /// `stop` runs whether `f` succeeds or fails; the records captured so far
    /// remain readable through `get_logs` afterwards. If the returned future
    /// is dropped early, the capture is told to stop and shuts down in the
    /// background.
    pub async fn scoped<F, R>(&self, options: MonitorOptions, f: F) -> Result<R>
    where
        F: for<'a> FnOnce(&'a LogMonitor) -> BoxFuture<'a, Result<R>>,
    {
        self.start(options).await?;
        let mut guard = StopGuard {
            monitor: self,
            armed: true,
        };
        let result = f(self).await;
        guard.armed = false;

        let stopped = self.stop().await;
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Capture for a fixed duration and return what matched
    pub async fn capture(
        toolchain: Toolchain,
        config: MonitorConfig,
        options: MonitorOptions,
    ) -> Result<Vec<LogRecord>> {
        if options.duration.is_none() {
            return Err(DeviceKitError::invalid("one-shot capture requires a duration"));
        }

        let monitor = LogMonitor::new(toolchain, config);
        monitor.start(options).await?;
        let status = monitor.join().await;
        monitor.stop().await?;

        match status.last_error {
            Some(e) => Err(e),
            None => monitor.get_logs(),
        }
    }
}

/// Signals the capture task to stop if a scoped future is dropped or unwinds
///
/// Only the stop signal is sent; the task closes the source on its own.
struct StopGuard<'a> {
    monitor: &'a LogMonitor,
    armed: bool,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Scoped log capture abandoned, stopping monitor");
            self.monitor.inner.stop_tx.send_replace(true);
        }
    }
}

/// Live tail of a running monitor
pub struct LogRecordStream {
    inner: BoxStream<'static, LogRecord>,
}

impl Stream for LogRecordStream {
    type Item = LogRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

async fn open_sink(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| DeviceKitError::Io(format!("Failed to open {}: {}", path.display(), e)))
}

async fn run_capture(
    shared: Arc<MonitorShared>,
    mut source: LineSource,
    mut sink: Option<File>,
    filter: FilterSpec,
    deadline: Option<Instant>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let outcome = capture_lines(
        &shared,
        &mut source,
        sink.as_mut(),
        &filter,
        deadline,
        &mut stop_rx,
    )
    .await;

    let outcome = match (outcome, source.close().await) {
        (Ok(reason), Err(e)) => {
            warn!("Failed to close log source: {}", e);
            Ok(reason)
        }
        (outcome, _) => outcome,
    };

    if let Some(mut file) = sink.take() {
        if let Err(e) = file.flush().await {
            warn!("Failed to flush log output file: {}", e);
        }
    }

    shared.finish(outcome);
    info!("Log capture finished: {:?}", shared.read_status().stop_reason);
}

async fn capture_lines(
    shared: &MonitorShared,
    source: &mut LineSource,
    mut sink: Option<&mut File>,
    filter: &FilterSpec,
    deadline: Option<Instant>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<StopReason> {
    let expiry = async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        if *stop_rx.borrow() {
            return Ok(StopReason::Requested);
        }

        tokio::select! {
            biased;

            // A dropped sender means the monitor itself is gone
            _ = stop_rx.changed() => return Ok(StopReason::Requested),
            _ = &mut expiry => {
                debug!("Log capture duration elapsed");
                return Ok(StopReason::DurationElapsed);
            }
            line = source.read_line() => match line? {
                Some(line) => handle_line(shared, sink.as_deref_mut(), filter, line).await?,
                None => {
                    let detail = source
                        .last_stderr()
                        .map(|stderr| format!(": {}", stderr))
                        .unwrap_or_default();
                    return Err(DeviceKitError::capture(format!(
                        "{} exited unexpectedly{}",
                        source.program(),
                        detail
                    )));
                }
            },
        }
    }
}

async fn handle_line(
    shared: &MonitorShared,
    sink: Option<&mut File>,
    filter: &FilterSpec,
    line: String,
) -> Result<()> {
    shared.update_status(|status| status.lines_read += 1);

    let record = parse_line(&line);
    if !filter::matches(&record, filter) {
        return Ok(());
    }

    if let Some(file) = sink {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        file.write_all(&bytes).await?;
        file.flush().await?;
    }

    shared.buffer.append(record.clone())?;
    shared.update_status(|status| status.records_matched += 1);
    shared.publish(record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_new_monitor_is_idle() {
        let monitor = LogMonitor::new(Toolchain::new(), MonitorConfig::default());
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(monitor.get_logs().unwrap().is_empty());
        assert!(!monitor.source_closed());

        let status = monitor.join().await;
        assert_eq!(status.state, MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_terminal() {
        let monitor = LogMonitor::new(Toolchain::new(), MonitorConfig::default());
        monitor.stop().await.unwrap();
        monitor.stop().await.unwrap();

        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.buffer().is_frozen());

        let err = monitor
            .start(MonitorOptions::new("any-device"))
            .await
            .unwrap_err();
        assert_eq!(err, DeviceKitError::MonitorAlreadyRunning);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_monitor_idle() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain::new().with_bin_dir(dir.path());
        let monitor = LogMonitor::new(toolchain, MonitorConfig::default());

        let err = monitor
            .start(MonitorOptions::new("device"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceKitError::ToolNotFound { .. }));
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_capture_requires_duration() {
        let err = LogMonitor::capture(
            Toolchain::new(),
            MonitorConfig::default(),
            MonitorOptions::new("device"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceKitError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_subscribe_after_stop_ends_immediately() {
        let monitor = LogMonitor::new(Toolchain::new(), MonitorConfig::default());
        monitor.stop().await.unwrap();

        let mut tail = monitor.subscribe();
        assert!(tail.next().await.is_none());
    }

    #[tokio::test]
    async fn test_scoped_start_error_skips_callback() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain::new().with_bin_dir(dir.path());
        let monitor = LogMonitor::new(toolchain, MonitorConfig::default());

        let mut called = false;
        let result = monitor
            .scoped(MonitorOptions::new("device"), |_| {
                called = true;
                async { Ok(()) }.boxed()
            })
            .await;

        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn test_options_builder() {
        let options = MonitorOptions::new("udid")
            .with_filter(FilterSpec::keywords(["ERROR"]))
            .with_output_file("/tmp/out.log")
            .with_duration(Duration::from_secs(2));
        assert_eq!(options.device_id, "udid");
        assert_eq!(options.filter.keywords, vec!["ERROR".to_string()]);
        assert_eq!(options.duration, Some(Duration::from_secs(2)));
    }
}
