use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Counters for one capture session.
///
/// # Example
/// ```rust
/// use strobe_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.delivered();
/// assert_eq!(metrics.delivered_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    delivered: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    recoveries: AtomicU64,
}

impl Metrics {
    /// A frame reached the consumer.
    pub fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was dropped by the skip counter.
    pub fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffer came back flagged as errored and was recycled.
    pub fn errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    /// A source change forced renegotiation.
    pub fn recovered(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn errored_count(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

impl Clone for Metrics {
    fn clone(&self) -> Self {
        let cloned = Metrics::default();
        cloned
            .delivered
            .store(self.delivered_count(), Ordering::Relaxed);
        cloned.skipped.store(self.skipped_count(), Ordering::Relaxed);
        cloned.errored.store(self.errored_count(), Ordering::Relaxed);
        cloned
            .recoveries
            .store(self.recovery_count(), Ordering::Relaxed);
        cloned
    }
}

/// Frames per second with two decimals of precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FpsSample {
    hundredths: u64,
}

impl FpsSample {
    pub fn from_hundredths(hundredths: u64) -> Self {
        Self { hundredths }
    }

    pub fn hundredths(&self) -> u64 {
        self.hundredths
    }

    pub fn fps(&self) -> f64 {
        self.hundredths as f64 / 100.0
    }
}

impl fmt::Display for FpsSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02} fps", self.hundredths / 100, self.hundredths % 100)
    }
}

/// Frame-rate meter sampled once per elapsed second.
///
/// The first recorded frame sets the baseline. Each later frame bumps the count; once a
/// whole second has elapsed the meter yields `10000 * count / elapsed_centiseconds`
/// hundredths of a frame per second and restarts from the current instant.
///
/// # Example
/// ```rust
/// use std::time::{Duration, Instant};
/// use strobe_core::metrics::FpsMeter;
///
/// let start = Instant::now();
/// let mut meter = FpsMeter::default();
/// assert!(meter.record(start).is_none());
/// let mut sample = None;
/// for i in 1..=25 {
///     sample = meter.record(start + Duration::from_millis(40 * i));
/// }
/// assert_eq!(sample.unwrap().to_string(), "25.00 fps");
/// ```
#[derive(Debug, Clone, Default)]
pub struct FpsMeter {
    baseline: Option<Instant>,
    count: u64,
    last: Option<FpsSample>,
}

impl FpsMeter {
    pub fn record(&mut self, now: Instant) -> Option<FpsSample> {
        let Some(baseline) = self.baseline else {
            self.baseline = Some(now);
            self.count = 0;
            return None;
        };
        self.count += 1;
        let elapsed = now.saturating_duration_since(baseline);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let centis = (elapsed.as_millis() / 10).max(1) as u64;
        let sample = FpsSample::from_hundredths(10_000 * self.count / centis);
        self.baseline = Some(now);
        self.count = 0;
        self.last = Some(sample);
        Some(sample)
    }

    /// Forget the baseline; the next frame starts a fresh measurement.
    pub fn reset(&mut self) {
        self.baseline = None;
        self.count = 0;
    }

    /// Most recent completed sample.
    pub fn last(&self) -> Option<FpsSample> {
        self.last
    }

    /// Frames counted since the current baseline.
    pub fn pending(&self) -> u64 {
        self.count
    }
}
