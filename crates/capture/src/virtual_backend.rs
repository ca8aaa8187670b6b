//! In-memory driver that serves patterned buffers and scripted faults.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs::File,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use libc::{EAGAIN, EBADF, EBUSY, EINVAL, EIO, ENOMEM, ENOTTY};
use strobe_core::prelude::*;

const FRAME_INTERVAL: Duration = Duration::from_micros(33_333);

/// Call counters shared between a [`VirtualDriver`] and its live mappings.
#[derive(Debug, Default)]
pub struct VirtualStats {
    requests: AtomicU64,
    queries: AtomicU64,
    maps: AtomicU64,
    unmaps: AtomicU64,
    exports: AtomicU64,
    queued: AtomicU64,
    dequeued: AtomicU64,
    stream_on: AtomicU64,
    stream_off: AtomicU64,
    timing_queries: AtomicU64,
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        $(
            pub fn $name(&self) -> u64 {
                self.$name.load(Ordering::Relaxed)
            }
        )*
    };
}

impl VirtualStats {
    counters!(
        requests,
        queries,
        maps,
        unmaps,
        exports,
        queued,
        dequeued,
        stream_on,
        stream_off,
        timing_queries,
    );

    /// Mappings created and not yet dropped.
    pub fn live_mappings(&self) -> u64 {
        self.maps().saturating_sub(self.unmaps())
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct VirtualMapping {
    bytes: Box<[u8]>,
    stats: Arc<VirtualStats>,
}

impl PlaneMapping for VirtualMapping {
    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for VirtualMapping {
    fn drop(&mut self) {
        VirtualStats::bump(&self.stats.unmaps);
    }
}

/// Scriptable [`Driver`] backed by process memory.
///
/// Every plane of slot `i` is filled with [`VirtualDriver::pattern`]`(i, plane)`, so a
/// test can tell from the bytes which slot a frame came from. Events are scheduled
/// against the running dequeue count and only delivered once subscribed.
///
/// # Example
/// ```rust
/// use strobe_capture::prelude::*;
///
/// let mut driver = VirtualDriver::new().with_plane_len(32).with_fill(16, 4);
/// let mut engine = CaptureEngine::new(&mut driver, CaptureOptions::default());
/// let mut lens = Vec::new();
/// let summary = engine
///     .run(None, 3, |frame: &Frame<'_>| {
///         lens.push(frame.len());
///         true
///     })
///     .unwrap();
/// assert_eq!(summary.delivered, 3);
/// assert_eq!(lens, [12, 12, 12]);
/// ```
pub struct VirtualDriver {
    format: FormatInfo,
    format_after_change: Option<FormatInfo>,
    plane_len: u32,
    fill: PlaneUsage,
    max_buffers: u32,
    min_buffers: u32,
    allocated: u32,
    memory: MemoryMode,
    streaming: bool,
    queued: VecDeque<u32>,
    user_planes: HashMap<u32, PlaneVec<(*mut u8, u32)>>,
    exported: HashMap<RawFd, (u32, usize)>,
    subscriptions: Vec<EventKind>,
    scheduled: Vec<(u64, DriverEvent)>,
    pending: VecDeque<DriverEvent>,
    errored: HashSet<u64>,
    pending_timings: u32,
    events_supported: bool,
    fail_request: Option<i32>,
    fail_map: Option<(u32, usize)>,
    fail_export: Option<(u32, usize)>,
    fail_stream_off: Option<i32>,
    queue_error_after: Option<u64>,
    dequeues: u64,
    sequence: u32,
    stats: Arc<VirtualStats>,
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDriver {
    /// 320x240 YUYV, one 4 KiB plane per slot, half of it filled, up to 8 buffers.
    pub fn new() -> Self {
        Self {
            format: FormatInfo {
                fourcc: FourCc::new(*b"YUYV"),
                width: 320,
                height: 240,
                planes: 1,
            },
            format_after_change: None,
            plane_len: 4096,
            fill: PlaneUsage {
                bytes_used: 2048,
                data_offset: 0,
            },
            max_buffers: 8,
            min_buffers: 1,
            allocated: 0,
            memory: MemoryMode::Mmap,
            streaming: false,
            queued: VecDeque::new(),
            user_planes: HashMap::new(),
            exported: HashMap::new(),
            subscriptions: Vec::new(),
            scheduled: Vec::new(),
            pending: VecDeque::new(),
            errored: HashSet::new(),
            pending_timings: 0,
            events_supported: true,
            fail_request: None,
            fail_map: None,
            fail_export: None,
            fail_stream_off: None,
            queue_error_after: None,
            dequeues: 0,
            sequence: 0,
            stats: Arc::new(VirtualStats::default()),
        }
    }

    /// Byte every plane of slot `index` is filled with.
    pub fn pattern(index: u32, plane: usize) -> u8 {
        (index as u8)
            .wrapping_mul(16)
            .wrapping_add(plane as u8)
            .wrapping_add(1)
    }

    /// Grant at most `max` buffers.
    pub fn with_max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }

    /// Grant at least `min` buffers regardless of the request.
    pub fn with_min_buffers(mut self, min: u32) -> Self {
        self.min_buffers = min;
        self
    }

    pub fn with_format(mut self, format: FormatInfo) -> Self {
        self.format = format;
        self
    }

    /// Planes per buffer reported on multi-planar queues.
    pub fn with_planes(mut self, planes: usize) -> Self {
        self.format.planes = planes.max(1);
        self
    }

    pub fn with_plane_len(mut self, len: u32) -> Self {
        self.plane_len = len;
        self.fill.bytes_used = self.fill.bytes_used.min(len);
        self
    }

    /// `bytes_used` and `data_offset` reported for every dequeued plane.
    pub fn with_fill(mut self, bytes_used: u32, data_offset: u32) -> Self {
        self.fill = PlaneUsage {
            bytes_used,
            data_offset,
        };
        self
    }

    /// Format reported once timings settle after a source change.
    pub fn with_format_after_change(mut self, format: FormatInfo) -> Self {
        self.format_after_change = Some(format);
        self
    }

    /// Raise `event` right after the `dequeues`-th dequeue (0 = as soon as subscribed).
    pub fn event_after(mut self, dequeues: u64, event: DriverEvent) -> Self {
        self.scheduled.push((dequeues, event));
        self
    }

    /// Flag the `nth` dequeued buffer (1-based) as errored.
    pub fn error_on_dequeue(mut self, nth: u64) -> Self {
        self.errored.insert(nth);
        self
    }

    /// Report an unstable signal for the next `count` timing queries.
    pub fn pending_timings(mut self, count: u32) -> Self {
        self.pending_timings = count;
        self
    }

    /// Reject event subscriptions like a driver without event support.
    pub fn without_events(mut self) -> Self {
        self.events_supported = false;
        self
    }

    /// Reject every REQBUFS with `errno`.
    pub fn fail_request_buffers(mut self, errno: i32) -> Self {
        self.fail_request = Some(errno);
        self
    }

    /// Fail the mapping of one slot/plane with `ENOMEM`.
    pub fn fail_map_at(mut self, index: u32, plane: usize) -> Self {
        self.fail_map = Some((index, plane));
        self
    }

    /// Fail the export of one slot/plane with `EINVAL`.
    pub fn fail_export_at(mut self, index: u32, plane: usize) -> Self {
        self.fail_export = Some((index, plane));
        self
    }

    /// STREAMOFF still stops the queue but reports `errno`.
    pub fn fail_stream_off(mut self, errno: i32) -> Self {
        self.fail_stream_off = Some(errno);
        self
    }

    /// Put the queue in an error state after `dequeues` buffers: every wait while
    /// streaming fails with `EIO`, as `poll` reports `POLLERR` on a broken vb2 queue.
    pub fn queue_error_after(mut self, dequeues: u64) -> Self {
        self.queue_error_after = Some(dequeues);
        self
    }

    pub fn stats(&self) -> Arc<VirtualStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Buffers currently owned by the driver.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Buffers allocated by the last REQBUFS.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn subscriptions(&self) -> &[EventKind] {
        &self.subscriptions
    }

    fn offset_of(index: u32, plane: usize) -> u32 {
        (index << 20) | ((plane as u32 & 0xf) << 16)
    }

    fn slot_of(offset: u32) -> (u32, usize) {
        (offset >> 20, ((offset >> 16) & 0xf) as usize)
    }

    fn subscribed(&self, event: &DriverEvent) -> bool {
        match event {
            DriverEvent::EndOfStream => self.subscriptions.contains(&EventKind::EndOfStream),
            DriverEvent::SourceChange { .. } => {
                self.subscriptions.contains(&EventKind::SourceChange)
            }
            DriverEvent::Other(_) => true,
        }
    }

    fn release_due_events(&mut self) {
        let dequeues = self.dequeues;
        let mut still = Vec::new();
        for (after, event) in std::mem::take(&mut self.scheduled) {
            if after <= dequeues && self.subscribed(&event) {
                self.pending.push_back(event);
            } else {
                still.push((after, event));
            }
        }
        self.scheduled = still;
    }

    fn check_index(&self, request: &'static str, index: u32) -> Result<(), ControlError> {
        if index >= self.allocated {
            return Err(ControlError::new(request, EINVAL));
        }
        Ok(())
    }
}

impl Driver for VirtualDriver {
    fn request_buffers(
        &mut self,
        _queue: QueueType,
        memory: MemoryMode,
        count: u32,
    ) -> Result<u32, ControlError> {
        const REQ: &str = "VIDIOC_REQBUFS";
        VirtualStats::bump(&self.stats.requests);
        if let Some(errno) = self.fail_request {
            return Err(ControlError::new(REQ, errno));
        }
        if self.streaming || self.stats.live_mappings() > 0 {
            return Err(ControlError::new(REQ, EBUSY));
        }
        self.queued.clear();
        self.user_planes.clear();
        self.memory = memory;
        self.allocated = if count == 0 {
            0
        } else {
            count.max(self.min_buffers).min(self.max_buffers)
        };
        Ok(self.allocated)
    }

    fn query_buffer(
        &mut self,
        _queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: usize,
    ) -> Result<PlaneVec<PlaneInfo>, ControlError> {
        self.check_index("VIDIOC_QUERYBUF", index)?;
        if memory.raw() != self.memory.raw() {
            return Err(ControlError::new("VIDIOC_QUERYBUF", EINVAL));
        }
        VirtualStats::bump(&self.stats.queries);
        Ok((0..planes)
            .map(|plane| PlaneInfo {
                length: self.plane_len,
                offset: Self::offset_of(index, plane),
            })
            .collect())
    }

    fn export_buffer(
        &mut self,
        _queue: QueueType,
        index: u32,
        plane: usize,
    ) -> Result<OwnedFd, ControlError> {
        const REQ: &str = "VIDIOC_EXPBUF";
        self.check_index(REQ, index)?;
        if self.fail_export == Some((index, plane)) {
            return Err(ControlError::new(REQ, EINVAL));
        }
        let fd = OwnedFd::from(
            File::open("/dev/null").map_err(|err| ControlError::from_io(REQ, &err))?,
        );
        self.exported.insert(fd.as_raw_fd(), (index, plane));
        VirtualStats::bump(&self.stats.exports);
        Ok(fd)
    }

    fn map(&mut self, source: MapSource<'_>, length: usize) -> Result<Mapping, ControlError> {
        const REQ: &str = "mmap";
        let (index, plane) = match source {
            MapSource::Device { offset } => Self::slot_of(offset),
            MapSource::Exported(fd) => *self
                .exported
                .get(&fd.as_raw_fd())
                .ok_or(ControlError::new(REQ, EBADF))?,
        };
        if self.fail_map == Some((index, plane)) {
            return Err(ControlError::new(REQ, ENOMEM));
        }
        VirtualStats::bump(&self.stats.maps);
        Ok(Box::new(VirtualMapping {
            bytes: vec![Self::pattern(index, plane); length].into_boxed_slice(),
            stats: Arc::clone(&self.stats),
        }))
    }

    unsafe fn queue_buffer(
        &mut self,
        _queue: QueueType,
        memory: MemoryMode,
        request: &QueueRequest,
    ) -> Result<(), ControlError> {
        const REQ: &str = "VIDIOC_QBUF";
        self.check_index(REQ, request.index)?;
        if memory.raw() != self.memory.raw() || self.queued.contains(&request.index) {
            return Err(ControlError::new(REQ, EINVAL));
        }
        let user: PlaneVec<(*mut u8, u32)> = request
            .planes
            .iter()
            .filter_map(|plane| match *plane {
                PlaneSubmit::UserPtr { ptr, length } => Some((ptr, length)),
                PlaneSubmit::Driver { .. } => None,
            })
            .collect();
        if !user.is_empty() {
            self.user_planes.insert(request.index, user);
        }
        self.queued.push_back(request.index);
        VirtualStats::bump(&self.stats.queued);
        Ok(())
    }

    fn dequeue_buffer(
        &mut self,
        _queue: QueueType,
        _memory: MemoryMode,
        planes: usize,
    ) -> Result<Dequeued, ControlError> {
        if !self.streaming {
            return Err(ControlError::new("VIDIOC_DQBUF", EINVAL));
        }
        let Some(index) = self.queued.pop_front() else {
            return Err(ControlError::new("VIDIOC_DQBUF", EAGAIN));
        };
        self.dequeues += 1;
        VirtualStats::bump(&self.stats.dequeued);

        let used = PlaneUsage {
            bytes_used: self.fill.bytes_used.min(self.plane_len),
            data_offset: self.fill.data_offset,
        };
        if let Some(user) = self.user_planes.remove(&index) {
            for (plane, (ptr, length)) in user.into_iter().enumerate() {
                let n = used.bytes_used.min(length) as usize;
                // SAFETY: the QBUF contract keeps `length` bytes at `ptr` writable until
                // this dequeue.
                unsafe { std::ptr::write_bytes(ptr, Self::pattern(index, plane), n) };
            }
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let dequeued = Dequeued {
            index,
            errored: self.errored.contains(&self.dequeues),
            sequence,
            timestamp: FRAME_INTERVAL * sequence,
            planes: (0..planes).map(|_| used).collect(),
        };
        self.release_due_events();
        Ok(dequeued)
    }

    fn stream_on(&mut self, _queue: QueueType) -> Result<(), ControlError> {
        if self.allocated == 0 {
            return Err(ControlError::new("VIDIOC_STREAMON", EINVAL));
        }
        self.streaming = true;
        VirtualStats::bump(&self.stats.stream_on);
        Ok(())
    }

    fn stream_off(&mut self, _queue: QueueType) -> Result<(), ControlError> {
        self.streaming = false;
        self.queued.clear();
        self.user_planes.clear();
        VirtualStats::bump(&self.stats.stream_off);
        match self.fail_stream_off {
            Some(errno) => Err(ControlError::new("VIDIOC_STREAMOFF", errno)),
            None => Ok(()),
        }
    }

    fn subscribe(&mut self, event: EventKind) -> Result<(), ControlError> {
        if !self.events_supported {
            return Err(ControlError::new("VIDIOC_SUBSCRIBE_EVENT", ENOTTY));
        }
        if !self.subscriptions.contains(&event) {
            self.subscriptions.push(event);
        }
        self.release_due_events();
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<DriverEvent>, ControlError> {
        Ok(self.pending.pop_front())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Readiness, ControlError> {
        if self.streaming
            && let Some(after) = self.queue_error_after
            && self.dequeues >= after
        {
            return Err(ControlError::new("poll", EIO));
        }
        Ok(Readiness {
            event: !self.pending.is_empty(),
            buffer: self.streaming && !self.queued.is_empty(),
        })
    }

    fn settle_timings(&mut self) -> Result<TimingStatus, ControlError> {
        VirtualStats::bump(&self.stats.timing_queries);
        if self.pending_timings > 0 {
            self.pending_timings -= 1;
            return Ok(TimingStatus::Pending);
        }
        if let Some(format) = self.format_after_change.take() {
            self.format = format;
        }
        Ok(TimingStatus::Settled)
    }

    fn format(&mut self, queue: QueueType) -> Result<FormatInfo, ControlError> {
        let mut format = self.format;
        if !queue.is_multiplanar() {
            format.planes = 1;
        }
        Ok(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_differ_per_slot_and_plane() {
        assert_ne!(VirtualDriver::pattern(0, 0), 0);
        assert_ne!(VirtualDriver::pattern(0, 0), VirtualDriver::pattern(1, 0));
        assert_ne!(VirtualDriver::pattern(2, 0), VirtualDriver::pattern(2, 1));
    }

    #[test]
    fn dequeue_on_empty_queue_would_block() {
        let mut driver = VirtualDriver::new();
        driver
            .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 2)
            .unwrap();
        driver.stream_on(QueueType::VideoCapture).unwrap();
        let err = driver
            .dequeue_buffer(QueueType::VideoCapture, MemoryMode::Mmap, 1)
            .unwrap_err();
        assert!(err.would_block());
    }

    #[test]
    fn reqbufs_busy_while_mapped() {
        let mut driver = VirtualDriver::new();
        driver
            .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 1)
            .unwrap();
        let map = driver
            .map(MapSource::Device { offset: 0 }, 16)
            .unwrap();
        let err = driver
            .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 0)
            .unwrap_err();
        assert_eq!(err.errno, EBUSY);
        drop(map);
        assert_eq!(
            driver
                .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 0)
                .unwrap(),
            0
        );
    }

    #[test]
    fn events_wait_for_subscription() {
        let mut driver = VirtualDriver::new().event_after(0, DriverEvent::EndOfStream);
        assert!(driver.wait(Duration::ZERO).unwrap().is_idle());
        driver.subscribe(EventKind::SourceChange).unwrap();
        assert!(driver.dequeue_event().unwrap().is_none());
        driver.subscribe(EventKind::EndOfStream).unwrap();
        assert!(driver.wait(Duration::ZERO).unwrap().event);
        assert_eq!(driver.dequeue_event().unwrap(), Some(DriverEvent::EndOfStream));
    }

    #[test]
    fn broken_queue_fails_waits_while_streaming() {
        let mut driver = VirtualDriver::new().queue_error_after(0);
        assert!(driver.wait(Duration::ZERO).is_ok());
        driver
            .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 1)
            .unwrap();
        driver.stream_on(QueueType::VideoCapture).unwrap();
        let err = driver.wait(Duration::ZERO).unwrap_err();
        assert_eq!((err.request, err.errno), ("poll", EIO));
    }

    #[test]
    fn settle_reports_pending_then_applies_new_format() {
        let hd = FormatInfo {
            fourcc: FourCc::new(*b"NV12"),
            width: 1920,
            height: 1080,
            planes: 2,
        };
        let mut driver = VirtualDriver::new()
            .pending_timings(2)
            .with_format_after_change(hd);
        assert_eq!(driver.settle_timings().unwrap(), TimingStatus::Pending);
        assert_eq!(driver.settle_timings().unwrap(), TimingStatus::Pending);
        assert_eq!(driver.settle_timings().unwrap(), TimingStatus::Settled);
        assert_eq!(driver.format(QueueType::VideoCaptureMplane).unwrap(), hd);
        assert_eq!(driver.format(QueueType::VideoCapture).unwrap().planes, 1);
    }
}
