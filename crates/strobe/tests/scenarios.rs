use std::time::Duration;

use strobe::prelude::*;

fn options() -> CaptureOptions {
    CaptureOptions::new()
        .wait_timeout(Duration::ZERO)
        .recovery_interval(Duration::from_millis(1))
}

#[test]
fn three_frames_to_sink_without_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.raw");
    let mut driver = VirtualDriver::new().with_plane_len(128).with_fill(100, 0);
    let mut diags = Diagnostics::new();

    let mut order = Vec::new();
    let summary = capture_stream(&mut driver, &mut diags, Some(&path), 3, options(), |frame| {
        order.push(frame.index());
        true
    })
    .unwrap();

    assert_eq!(summary.delivered, 3);
    assert!(!diags.has_errors());
    let expected: Vec<u8> = order
        .iter()
        .flat_map(|i| std::iter::repeat_n(VirtualDriver::pattern(*i, 0), 100))
        .collect();
    assert_eq!(std::fs::read(&path).unwrap(), expected);
}

#[test]
fn non_capture_path_reports_not_a_capture_node() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut diags = Diagnostics::new();
    let mut delivered = 0;
    let summary = capture_device(
        file.path(),
        &mut diags,
        None,
        3,
        options(),
        |_| {
            delivered += 1;
            true
        },
    );
    assert!(summary.is_none());
    assert_eq!(delivered, 0);
    assert!(diags.contains_code("V005"));
    assert!(!diags.contains_code("V012"));
}

#[test]
fn missing_path_reports_open_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut diags = Diagnostics::new();
    assert!(open_device(dir.path().join("video42"), &mut diags).is_none());
    let codes: Vec<_> = diags.errors().map(|d| d.code().to_string()).collect();
    assert_eq!(codes, ["V004"]);
}

#[test]
fn source_change_recovery_reaches_target() {
    let mut driver = VirtualDriver::new()
        .event_after(2, DriverEvent::SourceChange { changes: 1 })
        .pending_timings(1);
    let mut diags = Diagnostics::new();
    let summary = capture_stream(&mut driver, &mut diags, None, 5, options(), |_| true).unwrap();
    assert_eq!(summary.delivered, 5);
    assert_eq!(summary.recoveries, 1);
    assert_eq!(summary.session_frames, 3);
    assert!(!diags.has_errors());
}

#[test]
fn broken_queue_is_reported_not_hung() {
    let mut driver = VirtualDriver::new().queue_error_after(1);
    let mut diags = Diagnostics::new();
    let summary = capture_stream(&mut driver, &mut diags, None, 4, options(), |_| true);
    assert!(summary.is_none());
    assert!(diags.contains_code("V006"));
    assert!(!diags.contains_code("V012"));
    assert!(!driver.is_streaming());
}

#[test]
fn consumer_stop_is_not_an_error() {
    let mut driver = VirtualDriver::new();
    let stats = driver.stats();
    let mut diags = Diagnostics::new();
    let mut seen = Vec::new();
    let summary = capture_stream(&mut driver, &mut diags, None, 0, options(), |frame| {
        seen.push(frame.sequence());
        seen.len() < 3
    })
    .unwrap();
    assert_eq!(summary.reason, StopReason::ConsumerStopped);
    assert_eq!(seen, [0, 1, 2]);
    assert_eq!(stats.dequeued(), 3);
    assert_eq!(stats.stream_off(), 1);
    assert!(!diags.has_errors());
}
