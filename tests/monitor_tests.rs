//! Log monitor lifecycle against a fake `idevicesyslog`

use crate::mock_environment::{process_alive, wait_for_lines, FakeToolchain, TEST_UDID};
use futures::{FutureExt, StreamExt};
use idevkit::common::{MonitorConfig, StopReason};
use idevkit::{DeviceKitError, FilterSpec, LogMonitor, MonitorOptions, MonitorState};
use std::time::{Duration, Instant};

fn monitor_for(fake: &FakeToolchain) -> LogMonitor {
    LogMonitor::new(
        fake.toolchain(),
        MonitorConfig {
            kill_grace_ms: 200,
            ..MonitorConfig::default()
        },
    )
}

#[tokio::test]
async fn test_empty_filter_keeps_every_line() {
    let lines: Vec<String> = (0..100).map(|i| format!("2024 INFO line {}", i)).collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let fake = FakeToolchain::new(&line_refs);
    let monitor = monitor_for(&fake);

    monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap();
    wait_for_lines(&monitor, 100).await;
    monitor.stop().await.unwrap();

    let logs = monitor.get_logs().unwrap();
    assert_eq!(logs.len(), 100);
    for (record, line) in logs.iter().zip(&lines) {
        assert_eq!(&record.line, line);
    }
}

#[tokio::test]
async fn test_keyword_subset_in_arrival_order() {
    let lines = [
        "2024 INFO boot",
        "2024 ERROR disk full",
        "2024 INFO network up",
        "2024 WARN low battery",
        "2024 ERROR network down",
        "unstructured disk noise",
    ];
    let fake = FakeToolchain::new(&lines);
    let monitor = monitor_for(&fake);

    monitor
        .start(MonitorOptions::new(TEST_UDID).with_filter(FilterSpec::keywords(["disk", "network"])))
        .await
        .unwrap();
    wait_for_lines(&monitor, lines.len() as u64).await;
    monitor.stop().await.unwrap();

    let captured: Vec<String> = monitor
        .get_logs()
        .unwrap()
        .into_iter()
        .map(|record| record.line)
        .collect();
    assert_eq!(
        captured,
        vec![
            "2024 ERROR disk full",
            "2024 INFO network up",
            "2024 ERROR network down",
            "unstructured disk noise",
        ]
    );

    let status = monitor.status();
    assert_eq!(status.lines_read, 6);
    assert_eq!(status.records_matched, 4);
}

#[tokio::test]
async fn test_case_insensitive_keywords() {
    let lines = ["2024 INFO Wi-Fi associated", "2024 INFO wifi scan", "2024 INFO bt on"];
    let fake = FakeToolchain::new(&lines);
    let monitor = monitor_for(&fake);

    let filter = FilterSpec::keywords(["WIFI", "Wi-Fi"]).case_insensitive();
    monitor
        .start(MonitorOptions::new(TEST_UDID).with_filter(filter))
        .await
        .unwrap();
    wait_for_lines(&monitor, 3).await;
    monitor.stop().await.unwrap();

    assert_eq!(monitor.get_logs().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stop_twice_changes_nothing() {
    let fake = FakeToolchain::new(&["2024 INFO one", "2024 INFO two"]);
    let monitor = monitor_for(&fake);

    monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap();
    wait_for_lines(&monitor, 2).await;

    monitor.stop().await.unwrap();
    let first = monitor.get_logs().unwrap();
    monitor.stop().await.unwrap();
    let second = monitor.get_logs().unwrap();

    assert_eq!(first, second);
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(monitor.status().stop_reason, Some(StopReason::Requested));
    assert!(monitor.last_error().is_none());
    assert!(monitor.buffer().is_frozen());
}

#[tokio::test]
async fn test_duration_bound_stops_without_caller() {
    let fake = FakeToolchain::new(&["2024 INFO tick"]);
    let monitor = monitor_for(&fake);

    let started = Instant::now();
    monitor
        .start(MonitorOptions::new(TEST_UDID).with_duration(Duration::from_secs(2)))
        .await
        .unwrap();
    let pid = monitor.status().source_pid.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(6), monitor.join())
        .await
        .expect("monitor did not stop on its own");
    let elapsed = started.elapsed();

    assert_eq!(status.state, MonitorState::Stopped);
    assert_eq!(status.stop_reason, Some(StopReason::DurationElapsed));
    assert!(elapsed >= Duration::from_millis(1900), "stopped early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "stopped late: {:?}", elapsed);
    assert!(monitor.source_closed());
    assert!(!process_alive(pid));
    assert_eq!(monitor.get_logs().unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let fake = FakeToolchain::new(&[]);
    let monitor = monitor_for(&fake);

    monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap();
    let err = monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap_err();
    assert_eq!(err, DeviceKitError::MonitorAlreadyRunning);

    monitor.stop().await.unwrap();
    let err = monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap_err();
    assert_eq!(err, DeviceKitError::MonitorAlreadyRunning);
}

#[tokio::test]
async fn test_unknown_device_fails_to_start() {
    let fake = FakeToolchain::new(&[]);
    let monitor = monitor_for(&fake);

    let err = monitor
        .start(MonitorOptions::new("not-attached"))
        .await
        .unwrap_err();
    assert_eq!(err, DeviceKitError::device_unavailable("not-attached"));
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[tokio::test]
async fn test_scoped_error_leaves_no_process() {
    let fake = FakeToolchain::new(&["2024 INFO a", "2024 ERROR b", "2024 INFO c"]);
    let monitor = monitor_for(&fake);

    let result: idevkit::Result<()> = monitor
        .scoped(MonitorOptions::new(TEST_UDID), |monitor| {
            async move {
                wait_for_lines(monitor, 3).await;
                Err(DeviceKitError::invalid("callback failed"))
            }
            .boxed()
        })
        .await;

    assert_eq!(result.unwrap_err(), DeviceKitError::invalid("callback failed"));

    let pid = monitor.status().source_pid.unwrap();
    assert!(monitor.source_closed());
    assert!(!process_alive(pid));
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(monitor.get_logs().unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_scope_stops_capture() {
    let fake = FakeToolchain::new(&["2024 INFO first"]);
    let monitor = monitor_for(&fake);

    let scope = monitor.scoped(MonitorOptions::new(TEST_UDID), |monitor| {
        async move {
            wait_for_lines(monitor, 1).await;
            std::future::pending::<idevkit::Result<()>>().await
        }
        .boxed()
    });
    assert!(tokio::time::timeout(Duration::from_millis(500), scope)
        .await
        .is_err());

    let pid = monitor.status().source_pid.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), monitor.join())
        .await
        .expect("capture kept running after its scope was dropped");

    assert_eq!(status.state, MonitorState::Stopped);
    assert_eq!(status.stop_reason, Some(StopReason::Requested));
    assert!(monitor.source_closed());
    assert!(!process_alive(pid));
    assert_eq!(monitor.get_logs().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unwritable_output_file_reports_io_error() {
    let fake = FakeToolchain::new(&["2024 INFO a"]);
    let monitor = monitor_for(&fake);
    let out_dir = tempfile::tempdir().unwrap();
    let missing_dir = out_dir.path().join("gone");

    let err = monitor
        .start(MonitorOptions::new(TEST_UDID).with_output_file(missing_dir.join("out.log")))
        .await
        .unwrap_err();

    assert!(matches!(err, DeviceKitError::Io(_)), "unexpected error: {:?}", err);
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[tokio::test]
async fn test_stream_end_is_recorded() {
    let fake = FakeToolchain::with_ending_stream(&["2024 INFO last words"]);
    let monitor = monitor_for(&fake);

    monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), monitor.join())
        .await
        .expect("monitor did not notice the stream ending");

    assert_eq!(status.state, MonitorState::Stopped);
    assert_eq!(status.stop_reason, Some(StopReason::Failed));
    assert!(matches!(status.last_error, Some(DeviceKitError::CaptureFailed(_))));
    assert_eq!(monitor.get_logs().unwrap().len(), 1);

    // Stopping a failed monitor is still fine and keeps the error
    monitor.stop().await.unwrap();
    assert!(monitor.last_error().is_some());
}

#[tokio::test]
async fn test_live_tail_sees_matching_records() {
    let fake = FakeToolchain::new(&["2024 INFO boot", "2024 ERROR disk full", "2024 ERROR fan"]);
    let monitor = monitor_for(&fake);
    let tail = monitor.subscribe();

    monitor
        .start(MonitorOptions::new(TEST_UDID).with_filter(FilterSpec::keywords(["ERROR"])))
        .await
        .unwrap();

    let received: Vec<String> = tokio::time::timeout(
        Duration::from_secs(5),
        tail.take(2).map(|record| record.message).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(received, vec!["disk full", "fan"]);

    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_from_another_task() {
    let lines: Vec<String> = (0..20).map(|i| format!("2024 INFO {}", i)).collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let fake = FakeToolchain::new(&line_refs);
    let monitor = monitor_for(&fake);

    monitor.start(MonitorOptions::new(TEST_UDID)).await.unwrap();
    wait_for_lines(&monitor, 20).await;

    let remote = monitor.clone();
    let stopper = tokio::spawn(async move { remote.stop().await });
    let concurrent = monitor.stop();
    let (joined, local) = tokio::join!(stopper, concurrent);
    joined.unwrap().unwrap();
    local.unwrap();

    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(monitor.get_logs().unwrap().len(), 20);
}
