//! Streaming ioctls behind the [`Driver`] surface.

use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::Duration,
};

use strobe_core::prelude::*;
use v4l::{
    v4l_sys::{
        v4l2_buffer, v4l2_dv_timings, v4l2_event, v4l2_event_subscription, v4l2_exportbuffer,
        v4l2_format, v4l2_plane, v4l2_requestbuffers,
    },
    v4l2::vidioc::{
        VIDIOC_DQBUF, VIDIOC_EXPBUF, VIDIOC_G_FMT, VIDIOC_QBUF, VIDIOC_QUERYBUF, VIDIOC_REQBUFS,
        VIDIOC_STREAMOFF, VIDIOC_STREAMON,
    },
};

use crate::{
    V4l2Device,
    mapping::MmapRegion,
    vidioc::{
        VIDIOC_DQEVENT, VIDIOC_QUERY_DV_TIMINGS, VIDIOC_S_DV_TIMINGS, VIDIOC_SUBSCRIBE_EVENT,
    },
};

const BUF_FLAG_ERROR: u32 = 0x0000_0040;

/// Zeroed kernel argument struct.
fn zeroed<T>() -> T {
    // SAFETY: only instantiated with bindgen V4L2 structs, for which all-zero is valid.
    unsafe { mem::zeroed() }
}

fn timeval_to_duration(secs: i64, micros: i64) -> Duration {
    Duration::from_secs(secs.max(0) as u64) + Duration::from_micros(micros.max(0) as u64)
}

/// Decode poll results. vb2 reports a stopped or broken queue as `POLLERR` alone.
fn readiness(revents: libc::c_short) -> Result<Readiness, ControlError> {
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(ControlError::new("poll", libc::EIO));
    }
    Ok(Readiness {
        event: revents & libc::POLLPRI != 0,
        buffer: revents & libc::POLLIN != 0,
    })
}

impl V4l2Device {
    fn buffer(
        queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: &mut [v4l2_plane],
    ) -> v4l2_buffer {
        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = queue.raw();
        buf.memory = memory.raw();
        buf.index = index;
        if queue.is_multiplanar() {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = planes.len() as u32;
        }
        buf
    }
}

impl Driver for V4l2Device {
    fn request_buffers(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        count: u32,
    ) -> Result<u32, ControlError> {
        let mut req: v4l2_requestbuffers = zeroed();
        req.count = count;
        req.type_ = queue.raw();
        req.memory = memory.raw();
        // SAFETY: REQBUFS takes a v4l2_requestbuffers.
        unsafe { self.control(VIDIOC_REQBUFS, "VIDIOC_REQBUFS", &mut req)? };
        Ok(req.count)
    }

    fn query_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: usize,
    ) -> Result<PlaneVec<PlaneInfo>, ControlError> {
        let mut raw: [v4l2_plane; MAX_PLANES] = zeroed();
        let planes = planes.clamp(1, MAX_PLANES);
        let mut buf = Self::buffer(queue, memory, index, &mut raw[..planes]);
        // SAFETY: QUERYBUF takes a v4l2_buffer; `m.planes` points at `planes` entries.
        unsafe { self.control(VIDIOC_QUERYBUF, "VIDIOC_QUERYBUF", &mut buf)? };
        if !queue.is_multiplanar() {
            // SAFETY: single-planar MMAP buffers report their offset in `m.offset`.
            let offset = unsafe { buf.m.offset };
            return Ok(smallvec::smallvec![PlaneInfo {
                length: buf.length,
                offset,
            }]);
        }
        let count = (buf.length as usize).min(planes);
        Ok(raw[..count]
            .iter()
            .map(|p| PlaneInfo {
                length: p.length,
                // SAFETY: MMAP planes report their offset in `m.mem_offset`.
                offset: unsafe { p.m.mem_offset },
            })
            .collect())
    }

    fn export_buffer(
        &mut self,
        queue: QueueType,
        index: u32,
        plane: usize,
    ) -> Result<OwnedFd, ControlError> {
        let mut exp: v4l2_exportbuffer = zeroed();
        exp.type_ = queue.raw();
        exp.index = index;
        exp.plane = plane as u32;
        exp.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        // SAFETY: EXPBUF takes a v4l2_exportbuffer.
        unsafe { self.control(VIDIOC_EXPBUF, "VIDIOC_EXPBUF", &mut exp)? };
        // SAFETY: the kernel just created this descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn map(&mut self, source: MapSource<'_>, length: usize) -> Result<Mapping, ControlError> {
        let region = match source {
            MapSource::Device { offset } => MmapRegion::new(self.fd("mmap")?, offset, length)?,
            MapSource::Exported(fd) => MmapRegion::new(fd.as_raw_fd(), 0, length)?,
        };
        Ok(Box::new(region))
    }

    unsafe fn queue_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        request: &QueueRequest,
    ) -> Result<(), ControlError> {
        let mut raw: [v4l2_plane; MAX_PLANES] = zeroed();
        let planes = request.planes.len().clamp(1, MAX_PLANES);
        for (slot, submit) in raw.iter_mut().zip(&request.planes) {
            match *submit {
                PlaneSubmit::Driver { length } => slot.length = length,
                PlaneSubmit::UserPtr { ptr, length } => {
                    slot.length = length;
                    slot.m.userptr = ptr as libc::c_ulong;
                }
            }
        }
        let mut buf = Self::buffer(queue, memory, request.index, &mut raw[..planes]);
        if !queue.is_multiplanar()
            && let Some(PlaneSubmit::UserPtr { ptr, length }) = request.planes.first().copied()
        {
            buf.m.userptr = ptr as libc::c_ulong;
            buf.length = length;
        }
        // SAFETY: QBUF takes a v4l2_buffer; user pointers are the caller's contract.
        unsafe { self.control(VIDIOC_QBUF, "VIDIOC_QBUF", &mut buf) }
    }

    fn dequeue_buffer(
        &mut self,
        queue: QueueType,
        memory: MemoryMode,
        planes: usize,
    ) -> Result<Dequeued, ControlError> {
        let mut raw: [v4l2_plane; MAX_PLANES] = zeroed();
        let planes = planes.clamp(1, MAX_PLANES);
        let mut buf = Self::buffer(queue, memory, 0, &mut raw[..planes]);
        // SAFETY: DQBUF takes a v4l2_buffer; `m.planes` points at `planes` entries.
        unsafe { self.control(VIDIOC_DQBUF, "VIDIOC_DQBUF", &mut buf)? };
        let usage = if queue.is_multiplanar() {
            raw[..(buf.length as usize).min(planes)]
                .iter()
                .map(|p| PlaneUsage {
                    bytes_used: p.bytesused,
                    data_offset: p.data_offset,
                })
                .collect()
        } else {
            smallvec::smallvec![PlaneUsage {
                bytes_used: buf.bytesused,
                data_offset: 0,
            }]
        };
        Ok(Dequeued {
            index: buf.index,
            errored: buf.flags & BUF_FLAG_ERROR != 0,
            sequence: buf.sequence,
            timestamp: timeval_to_duration(
                buf.timestamp.tv_sec as i64,
                buf.timestamp.tv_usec as i64,
            ),
            planes: usage,
        })
    }

    fn stream_on(&mut self, queue: QueueType) -> Result<(), ControlError> {
        let mut kind = queue.raw();
        // SAFETY: STREAMON takes the buffer type as an int.
        unsafe { self.control(VIDIOC_STREAMON, "VIDIOC_STREAMON", &mut kind) }
    }

    fn stream_off(&mut self, queue: QueueType) -> Result<(), ControlError> {
        let mut kind = queue.raw();
        // SAFETY: STREAMOFF takes the buffer type as an int.
        unsafe { self.control(VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF", &mut kind) }
    }

    fn subscribe(&mut self, event: EventKind) -> Result<(), ControlError> {
        let mut sub: v4l2_event_subscription = zeroed();
        sub.type_ = event.raw();
        // SAFETY: SUBSCRIBE_EVENT takes a v4l2_event_subscription.
        unsafe {
            self.control(
                VIDIOC_SUBSCRIBE_EVENT,
                "VIDIOC_SUBSCRIBE_EVENT",
                &mut sub,
            )
        }
    }

    fn dequeue_event(&mut self) -> Result<Option<DriverEvent>, ControlError> {
        let mut ev: v4l2_event = zeroed();
        // SAFETY: DQEVENT takes a v4l2_event.
        match unsafe { self.control(VIDIOC_DQEVENT, "VIDIOC_DQEVENT", &mut ev) } {
            Ok(()) => {}
            Err(err) if err.errno == libc::ENOENT => return Ok(None),
            Err(err) => return Err(err),
        }
        let event = match ev.type_ {
            t if t == EventKind::EndOfStream.raw() => DriverEvent::EndOfStream,
            t if t == EventKind::SourceChange.raw() => DriverEvent::SourceChange {
                // SAFETY: source-change events carry `src_change`.
                changes: unsafe { ev.u.src_change.changes },
            },
            other => DriverEvent::Other(other),
        };
        Ok(Some(event))
    }

    fn wait(&mut self, timeout: Duration) -> Result<Readiness, ControlError> {
        let mut pfd = libc::pollfd {
            fd: self.fd("poll")?,
            events: libc::POLLIN | libc::POLLPRI,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            return Err(ControlError::from_io("poll", &io::Error::last_os_error()));
        }
        readiness(pfd.revents)
    }

    fn settle_timings(&mut self) -> Result<TimingStatus, ControlError> {
        let mut timings: v4l2_dv_timings = zeroed();
        // SAFETY: QUERY_DV_TIMINGS takes a v4l2_dv_timings.
        let queried = unsafe {
            self.control(
                VIDIOC_QUERY_DV_TIMINGS,
                "VIDIOC_QUERY_DV_TIMINGS",
                &mut timings,
            )
        };
        match queried {
            Ok(()) => {}
            Err(err) if matches!(err.errno, libc::ENOTTY | libc::ENODATA) => {
                return Ok(TimingStatus::NotApplicable);
            }
            Err(err) if matches!(err.errno, libc::ENOLINK | libc::ENOLCK | libc::ERANGE) => {
                return Ok(TimingStatus::Pending);
            }
            Err(err) => return Err(err),
        }
        // SAFETY: S_DV_TIMINGS takes the record QUERY_DV_TIMINGS just filled.
        unsafe {
            self.control(
                VIDIOC_S_DV_TIMINGS,
                "VIDIOC_S_DV_TIMINGS",
                &mut timings,
            )?
        };
        Ok(TimingStatus::Settled)
    }

    fn format(&mut self, queue: QueueType) -> Result<FormatInfo, ControlError> {
        let mut fmt: v4l2_format = zeroed();
        fmt.type_ = queue.raw();
        // SAFETY: G_FMT takes a v4l2_format.
        unsafe { self.control(VIDIOC_G_FMT, "VIDIOC_G_FMT", &mut fmt)? };
        // SAFETY: the union member matches the queue type we asked for.
        let info = unsafe {
            if queue.is_multiplanar() {
                let pix = fmt.fmt.pix_mp;
                FormatInfo {
                    fourcc: FourCc::from(pix.pixelformat),
                    width: pix.width,
                    height: pix.height,
                    planes: usize::from(pix.num_planes).max(1),
                }
            } else {
                let pix = fmt.fmt.pix;
                FormatInfo {
                    fourcc: FourCc::from(pix.pixelformat),
                    width: pix.width,
                    height: pix.height,
                    planes: 1,
                }
            }
        };
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_clamp_negative_fields() {
        assert_eq!(timeval_to_duration(2, 500_000), Duration::from_millis(2500));
        assert_eq!(timeval_to_duration(-1, -5), Duration::ZERO);
    }

    #[test]
    fn poll_error_conditions_fail_the_wait() {
        let broken = [
            libc::POLLERR,
            libc::POLLHUP,
            libc::POLLNVAL,
            libc::POLLERR | libc::POLLPRI,
        ];
        for revents in broken {
            let err = readiness(revents).unwrap_err();
            assert_eq!((err.request, err.errno), ("poll", libc::EIO));
        }
        let ready = readiness(libc::POLLIN | libc::POLLPRI).unwrap();
        assert!(ready.buffer && ready.event);
        assert!(readiness(0).unwrap().is_idle());
    }

    #[test]
    fn multiplanar_buffer_points_at_planes() {
        let mut raw: [v4l2_plane; MAX_PLANES] = zeroed();
        let buf = V4l2Device::buffer(
            QueueType::VideoCaptureMplane,
            MemoryMode::Mmap,
            3,
            &mut raw[..2],
        );
        assert_eq!(buf.length, 2);
        assert_eq!(buf.index, 3);
        assert_eq!(buf.type_, 9);
        // SAFETY: multi-planar buffers use `m.planes`.
        assert_eq!(unsafe { buf.m.planes }, raw.as_mut_ptr());
    }

    #[test]
    fn requests_on_closed_device_fail_with_ebadf() {
        let mut dev = V4l2Device::new("/dev/video0");
        let err = dev
            .request_buffers(QueueType::VideoCapture, MemoryMode::Mmap, 4)
            .unwrap_err();
        assert_eq!(err.request, "VIDIOC_REQBUFS");
        assert_eq!(err.errno, libc::EBADF);
        assert!(dev.wait(Duration::ZERO).is_err());
    }

    #[test]
    fn non_device_file_rejects_streaming_requests() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut dev = V4l2Device::new(file.path());
        dev.open().unwrap();
        let err = dev.stream_on(QueueType::VideoCapture).unwrap_err();
        assert_eq!(err.errno, libc::ENOTTY);
        assert_eq!(dev.dequeue_event().unwrap_err().errno, libc::ENOTTY);
        assert_eq!(dev.settle_timings().unwrap(), TimingStatus::NotApplicable);
    }
}
