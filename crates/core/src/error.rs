use std::{io, path::PathBuf};

fn os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

/// A control request rejected by the driver.
///
/// Carries the request name (e.g. `VIDIOC_REQBUFS`) and the raw `errno` so callers can
/// decide whether a failure is fatal or ignorable.
///
/// # Example
/// ```rust
/// use strobe_core::prelude::ControlError;
///
/// let err = ControlError::new("VIDIOC_DQBUF", libc::EAGAIN);
/// assert!(err.would_block());
/// assert!(err.to_string().starts_with("VIDIOC_DQBUF: failed"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{request}: failed: {}", os_error(.errno))]
pub struct ControlError {
    /// Symbolic name of the request.
    pub request: &'static str,
    /// OS error number reported by the driver.
    pub errno: i32,
}

impl ControlError {
    pub const fn new(request: &'static str, errno: i32) -> Self {
        Self { request, errno }
    }

    /// Build from an `io::Error`, falling back to `EIO` when no OS code is attached.
    pub fn from_io(request: &'static str, err: &io::Error) -> Self {
        Self {
            request,
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Equivalent `io::Error` (strerror text).
    pub fn io_error(&self) -> io::Error {
        os_error(&self.errno)
    }

    /// Driver reported "try again" (`EAGAIN`): nothing ready yet.
    pub fn would_block(&self) -> bool {
        self.io_error().kind() == io::ErrorKind::WouldBlock
    }
}

impl From<ControlError> for io::Error {
    fn from(err: ControlError) -> Self {
        io::Error::new(err.io_error().kind(), err)
    }
}

/// Errors raised while opening a device or running a capture session.
///
/// Every variant maps to a stable diagnostic code through [`CaptureError::code`].
///
/// # Example
/// ```rust
/// use strobe_core::prelude::{CaptureError, ControlError};
///
/// let err = CaptureError::NegotiationFailed(ControlError::new("VIDIOC_REQBUFS", libc::EBUSY));
/// assert_eq!(err.code(), "V007");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to stat {}: {source}", .path.display())]
    StatFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    MetadataUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unknown device name")]
    UnknownDeviceName { devname: Option<String> },
    #[error("failed to open {}: {source}", .path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: not a v4l2 node", .path.display())]
    NotACaptureNode {
        path: PathBuf,
        #[source]
        source: ControlError,
    },
    #[error("device is not open")]
    NotOpen,
    #[error("buffer negotiation failed: {0}")]
    NegotiationFailed(#[source] ControlError),
    #[error("export of buffer {index} plane {plane} failed: {source}")]
    ExportFailed {
        index: u32,
        plane: usize,
        #[source]
        source: ControlError,
    },
    #[error("mapping of buffer {index} plane {plane} failed: {source}")]
    MapFailed {
        index: u32,
        plane: usize,
        #[source]
        source: ControlError,
    },
    #[error(transparent)]
    ControlFailed(#[from] ControlError),
    #[error("output sink {}: {source}", .path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source change recovery abandoned after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
}

impl CaptureError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::StatFailed { .. } => "V001",
            CaptureError::MetadataUnreadable { .. } => "V002",
            CaptureError::UnknownDeviceName { .. } => "V003",
            CaptureError::OpenFailed { .. } | CaptureError::NotOpen => "V004",
            CaptureError::NotACaptureNode { .. } => "V005",
            CaptureError::ControlFailed(_) => "V006",
            CaptureError::NegotiationFailed(_) => "V007",
            CaptureError::ExportFailed { .. } => "V008",
            CaptureError::MapFailed { .. } => "V009",
            CaptureError::Sink { .. } => "V010",
            CaptureError::RecoveryExhausted { .. } => "V011",
        }
    }

    /// The underlying driver rejection, if the error came from a control request.
    pub fn control(&self) -> Option<&ControlError> {
        match self {
            CaptureError::NotACaptureNode { source, .. }
            | CaptureError::ExportFailed { source, .. }
            | CaptureError::MapFailed { source, .. } => Some(source),
            CaptureError::NegotiationFailed(source) | CaptureError::ControlFailed(source) => {
                Some(source)
            }
            _ => None,
        }
    }
}
