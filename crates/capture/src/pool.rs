//! Capture buffer slots and their negotiation with the driver.
//!
//! A slot is either owned by the engine (readable) or by the driver (queued, being
//! filled). [`BufferPool::payload`] refuses to hand out bytes of a driver-owned slot.

use std::os::fd::{AsFd, OwnedFd};

use smallvec::smallvec;
use strobe_core::prelude::*;

enum Backing {
    Mapped(Mapping),
    Heap(Box<[u8]>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map.as_slice(),
            Backing::Heap(buf) => buf,
        }
    }
}

#[derive(Default)]
struct PlaneRecord {
    info: PlaneInfo,
    exported: Option<OwnedFd>,
    backing: Option<Backing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Engine,
    Driver,
}

struct Slot {
    planes: PlaneVec<PlaneRecord>,
    prepared: bool,
    owner: Owner,
}

impl Slot {
    fn new(planes: usize) -> Self {
        Self {
            planes: (0..planes).map(|_| PlaneRecord::default()).collect(),
            prepared: false,
            owner: Owner::Engine,
        }
    }
}

/// Negotiated set of capture buffers and their per-plane memory.
///
/// Slot and plane counts are fixed once [`BufferPool::negotiate`] succeeds. Every
/// mapping, heap allocation and exported handle is released exactly once, either by
/// [`BufferPool::release`] or on drop.
///
/// # Example
/// ```rust
/// use strobe_capture::prelude::*;
///
/// let mut driver = VirtualDriver::new();
/// let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 1);
/// let granted = pool.negotiate(&mut driver, 3).unwrap();
/// assert_eq!(granted, 3);
/// pool.prepare(&mut driver).unwrap();
/// assert_eq!(pool.prepared_count(), 3);
/// pool.release();
/// assert_eq!(pool.prepared_count(), 0);
/// ```
pub struct BufferPool {
    queue: QueueType,
    memory: MemoryMode,
    planes: usize,
    requested: u32,
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Single-planar queues always use one plane per slot.
    pub fn new(queue: QueueType, memory: MemoryMode, planes: usize) -> Self {
        let planes = if queue.is_multiplanar() {
            planes.clamp(1, MAX_PLANES)
        } else {
            1
        };
        Self {
            queue,
            memory,
            planes,
            requested: 0,
            slots: Vec::new(),
        }
    }

    /// Queue the pool negotiates against.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Memory mode of every slot.
    pub fn memory(&self) -> MemoryMode {
        self.memory
    }

    /// Planes per slot.
    pub fn planes(&self) -> usize {
        self.planes
    }

    /// Count asked for in the last negotiation.
    pub fn requested(&self) -> u32 {
        self.requested
    }

    /// Slots in use: the driver's grant, clamped to the request.
    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slots currently backed by memory.
    pub fn prepared_count(&self) -> usize {
        self.slots.iter().filter(|s| s.prepared).count()
    }

    pub fn is_prepared(&self, index: u32) -> bool {
        self.slot(index).is_some_and(|s| s.prepared)
    }

    /// Whether the driver currently owns slot `index`.
    pub fn is_queued(&self, index: u32) -> bool {
        self.slot(index).is_some_and(|s| s.owner == Owner::Driver)
    }

    /// Reported length of each plane of slot `index`, once prepared.
    pub fn plane_lengths(&self, index: u32) -> Option<PlaneVec<u32>> {
        self.slot(index)
            .filter(|s| s.prepared)
            .map(|s| s.planes.iter().map(|p| p.info.length).collect())
    }

    /// Exported handles currently held.
    pub fn exported_count(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.planes.iter())
            .filter(|p| p.exported.is_some())
            .count()
    }

    /// Whether every plane of every slot holds an exported handle.
    pub fn is_exported(&self) -> bool {
        !self.slots.is_empty() && self.exported_count() == self.slots.len() * self.planes
    }

    /// REQBUFS for `requested` buffers. Grants above the request are clamped to it.
    pub fn negotiate<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        requested: u32,
    ) -> Result<u32, CaptureError> {
        self.release();
        self.requested = requested;
        let granted = driver
            .request_buffers(self.queue, self.memory, requested)
            .map_err(CaptureError::NegotiationFailed)?;
        if granted == 0 && requested > 0 {
            return Err(CaptureError::NegotiationFailed(ControlError::new(
                "VIDIOC_REQBUFS",
                libc::ENOMEM,
            )));
        }
        if granted > requested {
            tracing::debug!(requested, granted, "driver granted extra buffers; using the request");
        }
        let count = granted.min(requested);
        self.slots = (0..count).map(|_| Slot::new(self.planes)).collect();
        tracing::debug!(
            requested,
            granted = count,
            planes = self.planes,
            memory = ?self.memory,
            "buffers negotiated"
        );
        Ok(count)
    }

    /// EXPBUF every slot/plane. Stops at the first failure; handles exported before
    /// it stay with the pool until release.
    pub fn export<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        queue: QueueType,
    ) -> Result<(), CaptureError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let index = index as u32;
            for (plane, record) in slot.planes.iter_mut().enumerate() {
                if record.exported.is_some() {
                    continue;
                }
                let fd = driver
                    .export_buffer(queue, index, plane)
                    .map_err(|source| CaptureError::ExportFailed {
                        index,
                        plane,
                        source,
                    })?;
                record.exported = Some(fd);
            }
        }
        tracing::debug!(slots = self.slots.len(), "buffers exported");
        Ok(())
    }

    /// Query, back and queue every negotiated slot.
    ///
    /// A failed mapping aborts; slots prepared before it stay valid for [`release`].
    ///
    /// [`release`]: BufferPool::release
    pub fn prepare<D: Driver + ?Sized>(&mut self, driver: &mut D) -> Result<(), CaptureError> {
        for index in 0..self.count() {
            self.prepare_slot(driver, index)?;
            self.queue_slot(driver, index)?;
        }
        tracing::debug!(slots = self.slots.len(), "buffers prepared and queued");
        Ok(())
    }

    fn prepare_slot<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        index: u32,
    ) -> Result<(), CaptureError> {
        let (queue, memory, planes) = (self.queue, self.memory, self.planes);
        let infos = driver.query_buffer(queue, memory, index, planes)?;
        let slot = &mut self.slots[index as usize];
        for (plane, record) in slot.planes.iter_mut().enumerate() {
            let info = infos.get(plane).copied().unwrap_or_default();
            record.info = info;
            let length = info.length as usize;
            let backing = match memory {
                MemoryMode::Mmap => driver
                    .map(MapSource::Device { offset: info.offset }, length)
                    .map(Backing::Mapped),
                MemoryMode::UserPtr => Ok(Backing::Heap(vec![0u8; length].into_boxed_slice())),
                MemoryMode::Exported => {
                    let Some(fd) = record.exported.as_ref() else {
                        return Err(CaptureError::ExportFailed {
                            index,
                            plane,
                            source: ControlError::new("VIDIOC_EXPBUF", libc::EBADF),
                        });
                    };
                    driver
                        .map(MapSource::Exported(fd.as_fd()), length)
                        .map(Backing::Mapped)
                }
            };
            let backing = backing.map_err(|source| CaptureError::MapFailed {
                index,
                plane,
                source,
            })?;
            record.backing = Some(backing);
        }
        slot.prepared = true;
        Ok(())
    }

    /// Hand slot `index` back to the driver.
    pub(crate) fn queue_slot<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        index: u32,
    ) -> Result<(), ControlError> {
        let (queue, memory) = (self.queue, self.memory);
        let Some(slot) = self.slots.get_mut(index as usize).filter(|s| s.prepared) else {
            return Err(ControlError::new("VIDIOC_QBUF", libc::EINVAL));
        };
        let mut request = QueueRequest {
            index,
            planes: smallvec![],
        };
        for record in slot.planes.iter_mut() {
            let length = record.info.length;
            let submit = match record.backing.as_mut() {
                Some(Backing::Heap(buf)) => PlaneSubmit::UserPtr {
                    ptr: buf.as_mut_ptr(),
                    length,
                },
                _ => PlaneSubmit::Driver { length },
            };
            request.planes.push(submit);
        }
        // SAFETY: heap planes are owned by this slot and only freed by `release`, which
        // the engine calls after stream-off has returned every buffer.
        unsafe { driver.queue_buffer(queue, memory, &request)? };
        slot.owner = Owner::Driver;
        Ok(())
    }

    /// Record that the driver returned slot `index`.
    pub(crate) fn mark_dequeued(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.owner = Owner::Engine;
        }
    }

    /// The `data_offset..bytes_used` window of one plane, clamped to its length.
    ///
    /// `None` while the driver owns the slot or the slot was never prepared.
    pub fn payload(&self, index: u32, plane: usize, usage: PlaneUsage) -> Option<&[u8]> {
        let slot = self.slot(index).filter(|s| s.prepared && s.owner == Owner::Engine)?;
        let bytes = slot.planes.get(plane)?.backing.as_ref()?.as_slice();
        let end = (usage.bytes_used as usize).min(bytes.len());
        let start = (usage.data_offset as usize).min(end);
        Some(&bytes[start..end])
    }

    /// Unmap, free and close everything the pool holds. Safe to repeat.
    ///
    /// Must not run while the driver still owns user-pointer slots; stop the stream first.
    pub fn release(&mut self) {
        let mut released = 0usize;
        for slot in &mut self.slots {
            for record in slot.planes.iter_mut() {
                if record.backing.take().is_some() {
                    released += 1;
                }
                drop(record.exported.take());
            }
            slot.prepared = false;
            slot.owner = Owner::Engine;
        }
        if released > 0 {
            tracing::debug!(planes = released, "buffers released");
        }
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("queue", &self.queue)
            .field("memory", &self.memory)
            .field("planes", &self.planes)
            .field("count", &self.slots.len())
            .field("prepared", &self.prepared_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_backend::VirtualDriver;

    fn prepared(driver: &mut VirtualDriver, memory: MemoryMode, count: u32) -> BufferPool {
        let mut pool = BufferPool::new(QueueType::VideoCapture, memory, 1);
        pool.negotiate(driver, count).unwrap();
        if memory == MemoryMode::Exported {
            pool.export(driver, QueueType::VideoCapture).unwrap();
        }
        pool.prepare(driver).unwrap();
        pool
    }

    #[test]
    fn granted_count_never_exceeds_request() {
        for requested in 1..=12 {
            let mut driver = VirtualDriver::new().with_max_buffers(6);
            let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 1);
            let granted = pool.negotiate(&mut driver, requested).unwrap();
            assert!(granted <= requested);
            assert_eq!(granted, requested.min(6));
            pool.prepare(&mut driver).unwrap();
            assert_eq!(pool.prepared_count(), granted as usize);
            assert_eq!(driver.stats().queries(), granted as u64);
            assert_eq!(driver.queued_len(), granted as usize);
        }
    }

    #[test]
    fn generous_driver_is_clamped() {
        let mut driver = VirtualDriver::new().with_min_buffers(5);
        let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 1);
        assert_eq!(pool.negotiate(&mut driver, 2).unwrap(), 2);
        pool.prepare(&mut driver).unwrap();
        assert_eq!(driver.stats().queries(), 2);
    }

    #[test]
    fn rejected_request_is_negotiation_failure() {
        let mut driver = VirtualDriver::new().fail_request_buffers(libc::EBUSY);
        let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 1);
        let err = pool.negotiate(&mut driver, 4).unwrap_err();
        assert_eq!(err.code(), "V007");
        assert_eq!(err.control().map(|c| c.errno), Some(libc::EBUSY));
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn single_planar_forces_one_plane() {
        let pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 3);
        assert_eq!(pool.planes(), 1);
        let pool = BufferPool::new(QueueType::VideoCaptureMplane, MemoryMode::Mmap, 3);
        assert_eq!(pool.planes(), 3);
        let pool = BufferPool::new(QueueType::VideoCaptureMplane, MemoryMode::Mmap, 0);
        assert_eq!(pool.planes(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut driver = VirtualDriver::new();
        let stats = driver.stats();
        let mut pool = prepared(&mut driver, MemoryMode::Mmap, 4);
        assert_eq!(stats.live_mappings(), 4);
        pool.release();
        pool.release();
        assert_eq!(stats.maps(), 4);
        assert_eq!(stats.unmaps(), 4);
        drop(pool);
        assert_eq!(stats.unmaps(), 4);
    }

    #[test]
    fn partial_prepare_releases_only_prepared_planes() {
        let mut driver = VirtualDriver::new().fail_map_at(2, 0);
        let stats = driver.stats();
        let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Mmap, 1);
        pool.negotiate(&mut driver, 4).unwrap();
        let err = pool.prepare(&mut driver).unwrap_err();
        assert!(matches!(err, CaptureError::MapFailed { index: 2, plane: 0, .. }));
        assert_eq!(pool.prepared_count(), 2);
        assert!(pool.is_prepared(1));
        assert!(!pool.is_prepared(3));
        pool.release();
        pool.release();
        assert_eq!(stats.maps(), 2);
        assert_eq!(stats.unmaps(), 2);
    }

    #[test]
    fn export_stops_at_first_failure_and_keeps_earlier_handles() {
        let mut driver = VirtualDriver::new().fail_export_at(1, 0);
        let stats = driver.stats();
        let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Exported, 1);
        pool.negotiate(&mut driver, 3).unwrap();
        let err = pool.export(&mut driver, QueueType::VideoCapture).unwrap_err();
        assert_eq!(err.code(), "V008");
        assert_eq!(stats.exports(), 1);
        assert_eq!(pool.exported_count(), 1);
        assert!(!pool.is_exported());
        pool.release();
        assert_eq!(pool.exported_count(), 0);
    }

    #[test]
    fn exported_pool_maps_through_handles() {
        let mut driver = VirtualDriver::new();
        let stats = driver.stats();
        let pool = prepared(&mut driver, MemoryMode::Exported, 2);
        assert_eq!(pool.exported_count(), 2);
        assert!(pool.is_exported());
        assert_eq!(stats.exports(), 2);
        assert_eq!(stats.live_mappings(), 2);
        drop(pool);
        assert_eq!(stats.live_mappings(), 0);
    }

    #[test]
    fn exported_mode_without_export_is_rejected() {
        let mut driver = VirtualDriver::new();
        let mut pool = BufferPool::new(QueueType::VideoCapture, MemoryMode::Exported, 1);
        pool.negotiate(&mut driver, 1).unwrap();
        let err = pool.prepare(&mut driver).unwrap_err();
        assert_eq!(err.code(), "V008");
    }

    #[test]
    fn userptr_planes_are_zeroed_heap() {
        let mut driver = VirtualDriver::new().with_plane_len(64);
        let stats = driver.stats();
        let mut pool = prepared(&mut driver, MemoryMode::UserPtr, 2);
        assert_eq!(stats.maps(), 0);
        assert_eq!(pool.plane_lengths(0).unwrap().as_slice(), &[64]);
        pool.mark_dequeued(1);
        let usage = PlaneUsage {
            bytes_used: 64,
            data_offset: 0,
        };
        assert!(pool.payload(1, 0, usage).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn payload_hidden_while_driver_owns_slot() {
        let mut driver = VirtualDriver::new();
        let mut pool = prepared(&mut driver, MemoryMode::Mmap, 1);
        let usage = PlaneUsage {
            bytes_used: 8,
            data_offset: 0,
        };
        assert!(pool.is_queued(0));
        assert!(pool.payload(0, 0, usage).is_none());
        pool.mark_dequeued(0);
        assert_eq!(pool.payload(0, 0, usage).map(<[u8]>::len), Some(8));
    }

    #[test]
    fn payload_window_is_clamped() {
        let mut driver = VirtualDriver::new().with_plane_len(16);
        let mut pool = prepared(&mut driver, MemoryMode::Mmap, 1);
        pool.mark_dequeued(0);
        let window = |bytes_used, data_offset| {
            pool.payload(0, 0, PlaneUsage {
                bytes_used,
                data_offset,
            })
            .map(<[u8]>::len)
        };
        assert_eq!(window(10, 4), Some(6));
        assert_eq!(window(100, 0), Some(16));
        assert_eq!(window(4, 10), Some(0));
        assert_eq!(pool.payload(0, 1, PlaneUsage::default()), None);
        assert_eq!(pool.payload(9, 0, PlaneUsage::default()), None);
    }

    #[test]
    fn multiplanar_slots_track_every_plane() {
        let mut driver = VirtualDriver::new().with_planes(2);
        let stats = driver.stats();
        let mut pool = BufferPool::new(QueueType::VideoCaptureMplane, MemoryMode::Mmap, 2);
        pool.negotiate(&mut driver, 3).unwrap();
        pool.prepare(&mut driver).unwrap();
        assert_eq!(stats.maps(), 6);
        assert_eq!(pool.plane_lengths(2).unwrap().len(), 2);
    }
}
