use std::{os::raw::c_void, ptr, slice};

use strobe_core::prelude::{ControlError, PlaneMapping};
use v4l::v4l2;

/// A shared read-write mapping of driver memory, unmapped on drop.
pub struct MmapRegion {
    ptr: *mut c_void,
    len: usize,
}

// SAFETY: the region is plain shared memory with no thread affinity.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn new(fd: i32, offset: u32, len: usize) -> Result<Self, ControlError> {
        // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing we own.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        }
        .map_err(|err| ControlError::from_io("mmap", &err))?;
        Ok(Self { ptr, len })
    }
}

impl PlaneMapping for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr..ptr+len` stays mapped until drop.
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region mapped in `new`, once.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr, self.len) } {
            tracing::warn!(error = %err, len = self.len, "munmap failed");
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
