use std::time::Duration;

use strobe_core::prelude::{MemoryMode, QueueType};

const DEFAULT_BUFFER_COUNT: u32 = 4;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(1);
const MIN_RECOVERY_INTERVAL: Duration = Duration::from_millis(1);

/// Per-session knobs for [`CaptureEngine`](crate::engine::CaptureEngine).
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use strobe_capture::prelude::*;
///
/// let opts = CaptureOptions::new()
///     .buffer_count(0)
///     .skip_frames(2)
///     .wait_timeout(Duration::ZERO)
///     .memory(MemoryMode::UserPtr)
///     .sanitized();
/// assert_eq!(opts.buffer_count, 1);
/// assert_eq!(opts.skip_frames, 2);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CaptureOptions {
    /// Capture queue to negotiate and stream on.
    pub queue: QueueType,
    /// How buffer memory is provided to the driver.
    pub memory: MemoryMode,
    /// Buffers requested during negotiation; the driver may grant fewer.
    pub buffer_count: u32,
    /// Deliverable frames discarded before the first delivery.
    pub skip_frames: u32,
    /// Readiness wait per loop iteration. Zero turns the loop into a busy poll.
    pub wait_timeout: Duration,
    /// Pause between timing queries while recovering from a source change.
    pub recovery_interval: Duration,
    /// Give up recovery after this many pending timing queries. `None` retries forever.
    pub max_recovery_attempts: Option<u32>,
    /// Subscribe to end-of-stream and source-change events before arming.
    pub subscribe_events: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            queue: QueueType::VideoCapture,
            memory: MemoryMode::Mmap,
            buffer_count: DEFAULT_BUFFER_COUNT,
            skip_frames: 0,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            max_recovery_attempts: None,
            subscribe_events: true,
        }
    }
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capture queue.
    pub fn queue(mut self, queue: QueueType) -> Self {
        self.queue = queue;
        self
    }

    /// Set the memory mode.
    pub fn memory(mut self, memory: MemoryMode) -> Self {
        self.memory = memory;
        self
    }

    /// Set how many buffers to request.
    pub fn buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Discard this many frames before the first delivery.
    pub fn skip_frames(mut self, skip: u32) -> Self {
        self.skip_frames = skip;
        self
    }

    /// Set the readiness wait per iteration.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the pause between timing queries during recovery.
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Bound recovery; `None` keeps retrying.
    pub fn max_recovery_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Toggle the end-of-stream and source-change subscriptions.
    pub fn subscribe_events(mut self, subscribe: bool) -> Self {
        self.subscribe_events = subscribe;
        self
    }

    /// Clamp values the engine cannot work with.
    pub fn sanitized(self) -> Self {
        Self {
            buffer_count: self.buffer_count.max(1),
            recovery_interval: self.recovery_interval.max(MIN_RECOVERY_INTERVAL),
            max_recovery_attempts: self.max_recovery_attempts.map(|n| n.max(1)),
            ..self
        }
    }
}
