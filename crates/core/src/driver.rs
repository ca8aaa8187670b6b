//! Streaming control surface of a capture node.
//!
//! The buffer pool and the capture engine only ever talk to a [`Driver`]; the V4L2
//! device handle implements it with ioctls, the virtual driver implements it in memory.

use std::{
    os::fd::{BorrowedFd, OwnedFd},
    time::Duration,
};

use smallvec::SmallVec;

use crate::{error::ControlError, format::FormatInfo};

/// Per-plane collection; most formats have at most three planes.
pub type PlaneVec<T> = SmallVec<[T; 3]>;

/// Upper bound on planes per buffer (`VIDEO_MAX_PLANES`).
pub const MAX_PLANES: usize = 8;

/// Buffer queue a pool is negotiated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QueueType {
    VideoCapture,
    VideoCaptureMplane,
    VideoOutput,
    VideoOutputMplane,
}

impl QueueType {
    pub fn is_multiplanar(self) -> bool {
        matches!(self, QueueType::VideoCaptureMplane | QueueType::VideoOutputMplane)
    }

    pub fn is_capture(self) -> bool {
        matches!(self, QueueType::VideoCapture | QueueType::VideoCaptureMplane)
    }

    /// `v4l2_buf_type` value.
    pub fn raw(self) -> u32 {
        match self {
            QueueType::VideoCapture => 1,
            QueueType::VideoOutput => 2,
            QueueType::VideoCaptureMplane => 9,
            QueueType::VideoOutputMplane => 10,
        }
    }
}

/// How buffer memory is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MemoryMode {
    /// Driver-owned memory mapped into the process.
    #[default]
    Mmap,
    /// Zeroed process memory handed to the driver by address.
    UserPtr,
    /// Driver memory exported as shareable handles, then mapped through those handles.
    Exported,
}

impl MemoryMode {
    /// `v4l2_memory` value used on the wire. Exported buffers are driver memory.
    pub fn raw(self) -> u32 {
        match self {
            MemoryMode::Mmap | MemoryMode::Exported => 1,
            MemoryMode::UserPtr => 2,
        }
    }
}

/// Length and mapping offset of one plane, as reported by QUERYBUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneInfo {
    pub length: u32,
    pub offset: u32,
}

/// Where a mapping comes from.
#[derive(Debug, Clone, Copy)]
pub enum MapSource<'a> {
    /// Driver memory at the given mapping offset on the device itself.
    Device { offset: u32 },
    /// A previously exported handle.
    Exported(BorrowedFd<'a>),
}

/// A live memory mapping; dropping it unmaps the region.
pub trait PlaneMapping: Send {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type Mapping = Box<dyn PlaneMapping>;

/// One plane in a QBUF submission.
#[derive(Debug, Clone, Copy)]
pub enum PlaneSubmit {
    /// Driver-owned (mapped or exported) memory.
    Driver { length: u32 },
    /// Process memory the driver writes into until the buffer is dequeued or streaming stops.
    UserPtr { ptr: *mut u8, length: u32 },
}

/// A QBUF submission for one slot.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub index: u32,
    pub planes: PlaneVec<PlaneSubmit>,
}

/// Per-plane fill level of a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneUsage {
    pub bytes_used: u32,
    pub data_offset: u32,
}

/// A completed buffer handed back by DQBUF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    /// Driver flagged the contents as corrupt (`V4L2_BUF_FLAG_ERROR`).
    pub errored: bool,
    pub sequence: u32,
    pub timestamp: Duration,
    pub planes: PlaneVec<PlaneUsage>,
}

/// Events the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    EndOfStream,
    SourceChange,
}

impl EventKind {
    /// `V4L2_EVENT_*` value.
    pub fn raw(self) -> u32 {
        match self {
            EventKind::EndOfStream => 2,
            EventKind::SourceChange => 5,
        }
    }
}

/// An event dequeued from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    EndOfStream,
    SourceChange { changes: u32 },
    Other(u32),
}

/// Conditions reported by a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Exceptional condition: events pending.
    pub event: bool,
    /// A completed buffer can be dequeued.
    pub buffer: bool,
}

impl Readiness {
    pub fn is_idle(&self) -> bool {
        !self.event && !self.buffer
    }
}

/// Outcome of asking the driver to lock onto the incoming signal timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingStatus {
    /// New timings detected and applied.
    Settled,
    /// No stable signal yet; ask again later.
    Pending,
    /// The input has no timing concept (sensor, file, etc.).
    NotApplicable,
}

/// Streaming control requests the capture engine issues.
///
/// Methods map one-to-one onto V4L2 ioctls; errors carry the request name and `errno`
/// so the caller decides which ones are fatal.
pub trait Driver {
    /// REQBUFS. Returns the count the driver granted, which may be lower; `0` frees.
    fn request_buffers(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        count: u32,
    ) -> Result<u32, ControlError>;

    /// QUERYBUF for slot `index`, returning `planes` plane records.
    fn query_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: usize,
    ) -> Result<PlaneVec<PlaneInfo>, ControlError>;

    /// EXPBUF for one slot/plane.
    fn export_buffer(
        &mut self,
        queue: QueueType,
        index: u32,
        plane: usize,
    ) -> Result<OwnedFd, ControlError>;

    /// Map `length` bytes of driver memory into the process.
    fn map(&mut self, source: MapSource<'_>, length: usize) -> Result<Mapping, ControlError>;

    /// QBUF.
    ///
    /// # Safety
    /// Every [`PlaneSubmit::UserPtr`] must point at `length` writable bytes that stay
    /// allocated until the buffer is dequeued or the queue is stopped.
    unsafe fn queue_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        request: &QueueRequest,
    ) -> Result<(), ControlError>;

    /// DQBUF. An empty queue is reported as an error whose `would_block()` is true.
    fn dequeue_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        planes: usize,
    ) -> Result<Dequeued, ControlError>;

    fn stream_on(&mut self, queue: QueueType) -> Result<(), ControlError>;

    fn stream_off(&mut self, queue: QueueType) -> Result<(), ControlError>;

    fn subscribe(&mut self, event: EventKind) -> Result<(), ControlError>;

    /// DQEVENT; `None` when nothing is pending.
    fn dequeue_event(&mut self) -> Result<Option<DriverEvent>, ControlError>;

    /// Wait up to `timeout` for pending events or a completed buffer. Zero never blocks.
    fn wait(&mut self, timeout: Duration) -> Result<Readiness, ControlError>;

    /// Query and apply the current signal timings after a source change.
    fn settle_timings(&mut self) -> Result<TimingStatus, ControlError>;

    /// G_FMT for `queue`.
    fn format(&mut self, queue: QueueType) -> Result<FormatInfo, ControlError>;
}
