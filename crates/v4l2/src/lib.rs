#![doc = include_str!("../README.md")]

use std::{
    fs,
    os::{raw::c_void, unix::fs::MetadataExt},
    path::{Path, PathBuf},
};

use strobe_core::prelude::*;
use v4l::{Device, v4l2};

mod mapping;
mod stream;
pub mod vidioc;

pub use mapping::MmapRegion;

pub use strobe_core;

/// `ioctl` request number type of the platform.
pub type Request = v4l2::vidioc::_IOC_TYPE;

/// One V4L2 device node.
///
/// The connection is released on [`V4l2Device::close`] or drop, whatever the outcome
/// of a capture session.
///
/// # Example
/// ```rust,no_run
/// use strobe_v4l2::V4l2Device;
///
/// let mut dev = V4l2Device::new("/dev/video0");
/// dev.open().unwrap();
/// let info = dev.query_capabilities().unwrap();
/// println!("{} on {}", info.card, info.bus_info);
/// ```
pub struct V4l2Device {
    path: PathBuf,
    device: Option<Device>,
    info: Option<DeviceInfo>,
    subdevice: Option<bool>,
}

impl V4l2Device {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: None,
            info: None,
            subdevice: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the node read-write and non-blocking.
    pub fn open(&mut self) -> Result<(), CaptureError> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = Device::with_path(&self.path).map_err(|source| CaptureError::OpenFailed {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), fd = device.handle().fd(), "device opened");
        self.device = Some(device);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.device.take().is_some() {
            tracing::debug!(path = %self.path.display(), "device closed");
        }
        self.info = None;
        self.subdevice = None;
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Whether the path is a sub-device rather than a primary node.
    ///
    /// Resolves the node's `major:minor`, reads its kernel uevent record and classifies
    /// the `DEVNAME=` entry. An unrecognised name is an error.
    ///
    /// The answer is cached until [`V4l2Device::close`]. A failed check is reported once
    /// and the node is treated as a primary node afterwards.
    pub fn is_subdevice(&mut self) -> Result<bool, CaptureError> {
        if let Some(subdevice) = self.subdevice {
            return Ok(subdevice);
        }
        let classified = classify_node(&self.path).map(NodeClass::is_subdevice);
        self.subdevice = Some(matches!(classified, Ok(true)));
        classified
    }

    /// QUERYCAP, decoded. Sub-devices do not answer it and report an empty record.
    pub fn query_capabilities(&mut self) -> Result<DeviceInfo, CaptureError> {
        if self.device.is_none() {
            return Err(CaptureError::NotOpen);
        }
        let subdevice = self.is_subdevice().unwrap_or_else(|err| {
            tracing::debug!(code = err.code(), error = %err, "sub-device check failed");
            false
        });
        if subdevice {
            tracing::debug!(path = %self.path.display(), "sub-device; skipping capability query");
            let info = DeviceInfo::default();
            self.info = Some(info.clone());
            return Ok(info);
        }
        let caps = self
            .device
            .as_ref()
            .ok_or(CaptureError::NotOpen)?
            .query_caps()
            .map_err(|err| CaptureError::NotACaptureNode {
                path: self.path.clone(),
                source: ControlError::from_io("VIDIOC_QUERYCAP", &err),
            })?;
        let (major, minor, patch) = caps.version;
        let info = DeviceInfo {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            version: (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch),
            capabilities: CapabilityInfo::from_bits(caps.capabilities.bits()),
        };
        tracing::debug!(driver = %info.driver, card = %info.card, "capabilities queried");
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Identity record from the last successful capability query.
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Capture queue the node supports, preferring single-planar.
    pub fn capture_queue(&self) -> Option<QueueType> {
        let caps = self.info.as_ref()?.capabilities;
        if caps.capture {
            Some(QueueType::VideoCapture)
        } else if caps.capture_mplane {
            Some(QueueType::VideoCaptureMplane)
        } else {
            None
        }
    }

    fn fd(&self, request: &'static str) -> Result<i32, ControlError> {
        self.device
            .as_ref()
            .map(|d| d.handle().fd())
            .ok_or(ControlError::new(request, libc::EBADF))
    }

    /// Issue a raw control request against the open node.
    ///
    /// # Safety
    /// `payload` must be the argument type the kernel expects for `request`, including
    /// any pointers it carries.
    pub unsafe fn control<T>(
        &self,
        request: Request,
        name: &'static str,
        payload: &mut T,
    ) -> Result<(), ControlError> {
        let fd = self.fd(name)?;
        // SAFETY: forwarded from the caller.
        unsafe { v4l2::ioctl(fd, request, payload as *mut T as *mut c_void) }
            .map_err(|err| ControlError::from_io(name, &err))
    }
}

impl std::fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Device")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("info", &self.info)
            .finish()
    }
}

/// Location of the kernel uevent record for a character device.
pub fn uevent_path(rdev: libc::dev_t) -> PathBuf {
    PathBuf::from(format!(
        "/sys/dev/char/{}:{}/uevent",
        libc::major(rdev),
        libc::minor(rdev)
    ))
}

/// Classify a device node through its kernel uevent record.
pub fn classify_node(path: &Path) -> Result<NodeClass, CaptureError> {
    let meta = fs::metadata(path).map_err(|source| CaptureError::StatFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let uevent = uevent_path(meta.rdev());
    let record =
        fs::read_to_string(&uevent).map_err(|source| CaptureError::MetadataUnreadable {
            path: uevent.clone(),
            source,
        })?;
    NodeClass::from_uevent(&record).map_err(|devname| CaptureError::UnknownDeviceName { devname })
}
