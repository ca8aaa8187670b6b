#![doc = include_str!("../README.md")]

use std::path::Path;

pub use strobe_capture as capture;
pub use strobe_core as core;
pub use strobe_v4l2 as v4l2;

use strobe_capture::prelude::*;
use strobe_v4l2::V4l2Device;

/// Open `path`, classify it and read its capabilities.
///
/// Failures are appended to `diags`. A failed sub-device check is reported but not
/// fatal; the node is then treated as a primary node. Returns `None` when the node
/// cannot be opened or does not answer the capability query.
pub fn open_device(path: impl AsRef<Path>, diags: &mut Diagnostics) -> Option<V4l2Device> {
    let mut device = V4l2Device::new(path.as_ref());
    if let Err(err) = device.open() {
        diags.record(&err);
        return None;
    }
    let subdevice = match device.is_subdevice() {
        Ok(subdevice) => subdevice,
        Err(err) => {
            tracing::debug!(code = err.code(), error = %err, "sub-device check failed");
            diags.record(&err);
            false
        }
    };
    if subdevice {
        diags.info("V012", format!("{}: sub-device", path.as_ref().display()));
        return Some(device);
    }
    match device.query_capabilities() {
        Ok(info) => {
            tracing::info!(
                path = %path.as_ref().display(),
                driver = %info.driver,
                card = %info.card,
                "device opened"
            );
            Some(device)
        }
        Err(err) => {
            diags.record(&err);
            device.close();
            None
        }
    }
}

/// Run one capture session against `driver`, reporting through `diags`.
///
/// A clean finish appends a `V012` summary record and returns the summary; any
/// failure is recorded and yields `None`. Teardown has already run either way.
pub fn capture_stream<D, F>(
    driver: &mut D,
    diags: &mut Diagnostics,
    sink: Option<&Path>,
    count: u32,
    options: CaptureOptions,
    consumer: F,
) -> Option<SessionSummary>
where
    D: Driver + ?Sized,
    F: FnMut(&Frame<'_>) -> bool,
{
    let mut engine = CaptureEngine::new(driver, options);
    match engine.run(sink, count, consumer) {
        Ok(summary) => {
            diags.info("V012", summary.to_string());
            Some(summary)
        }
        Err(err) => {
            diags.record(&err);
            None
        }
    }
}

/// [`open_device`], then [`capture_stream`] on the node's capture queue, then close.
///
/// When the node does not support `options.queue`, the capture queue it does support
/// is used instead.
pub fn capture_device<F>(
    path: impl AsRef<Path>,
    diags: &mut Diagnostics,
    sink: Option<&Path>,
    count: u32,
    options: CaptureOptions,
    consumer: F,
) -> Option<SessionSummary>
where
    F: FnMut(&Frame<'_>) -> bool,
{
    let mut device = open_device(path, diags)?;
    let caps = device.info().map(|i| i.capabilities).unwrap_or_default();
    let supported = match options.queue {
        QueueType::VideoCapture => caps.capture,
        QueueType::VideoCaptureMplane => caps.capture_mplane,
        _ => true,
    };
    let options = match device.capture_queue() {
        Some(queue) if !supported => options.queue(queue),
        _ => options,
    };
    let summary = capture_stream(&mut device, diags, sink, count, options, consumer);
    device.close();
    summary
}

pub mod prelude {
    pub use strobe_capture::prelude::*;
    pub use strobe_v4l2::V4l2Device;

    pub use crate::{capture_device, capture_stream, open_device};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn failed_session_lands_in_diagnostics() {
        let mut driver = VirtualDriver::new().fail_map_at(0, 0);
        let mut diags = Diagnostics::new();
        let summary = capture_stream(
            &mut driver,
            &mut diags,
            None,
            1,
            CaptureOptions::new().wait_timeout(Duration::ZERO),
            |_: &Frame<'_>| true,
        );
        assert!(summary.is_none());
        assert!(diags.contains_code("V009"));
        assert!(!diags.contains_code("V012"));
    }

    #[test]
    fn finished_session_appends_summary() {
        let mut driver = VirtualDriver::new();
        let mut diags = Diagnostics::new();
        let summary = capture_stream(
            &mut driver,
            &mut diags,
            None,
            2,
            CaptureOptions::new().wait_timeout(Duration::ZERO),
            |_: &Frame<'_>| true,
        )
        .unwrap();
        assert_eq!(summary.delivered, 2);
        let record = diags.iter().last().unwrap();
        assert_eq!(record.code(), "V012");
        assert_eq!(record.severity(), Severity::Info);
        assert!(record.message().starts_with("2 frames captured (target reached)"));
    }
}
