//! Capture frames from a V4L2 node, or from the virtual driver with `--virtual`.
//!
//! ```text
//! cargo run -p strobe --example capture -- /dev/video0 60 out.raw
//! cargo run -p strobe --example capture -- --virtual 10
//! ```

use std::path::PathBuf;

use strobe::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut args = std::env::args().skip(1);
    let device = args.next().unwrap_or_else(|| "/dev/video0".into());
    let count: u32 = args.next().and_then(|c| c.parse().ok()).unwrap_or(30);
    let sink = args.next().map(PathBuf::from);

    let mut diags = Diagnostics::new();
    let options = CaptureOptions::new().skip_frames(2);
    let consumer = |frame: &Frame<'_>| {
        tracing::debug!(sequence = frame.sequence(), bytes = frame.total_len(), "frame");
        true
    };
    if device == "--virtual" {
        let mut driver = VirtualDriver::new();
        capture_stream(&mut driver, &mut diags, sink.as_deref(), count, options, consumer);
    } else {
        capture_device(&device, &mut diags, sink.as_deref(), count, options, consumer);
    }

    for msg in &diags {
        match msg.details() {
            Some(details) => println!("{msg} ({details})"),
            None => println!("{msg}"),
        }
    }
    if diags.has_errors() {
        std::process::exit(1);
    }
}
