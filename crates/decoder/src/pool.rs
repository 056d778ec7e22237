//! Buffer pools: the driver-allocated, memory-mapped buffers of one queue.
//!
//! A [`BufferPool`] is acquired as a unit. [`BufferPool::allocate`] requests
//! the buffers, queries and maps every plane, and on any failure drops the
//! partially built pool, whose `Drop` unmaps exactly what was mapped so far
//! and frees the driver allocation. The same release path runs at normal
//! teardown and is idempotent.
//!
//! ## Ownership
//!
//! Each buffer is held either by the caller (its planes may be read and
//! written) or by the driver (queued; its planes must not be touched).
//! Ownership moves to the driver on a successful queue and back on dequeue
//! or stream-off. Plane access is only granted for caller-owned buffers.

use std::sync::Arc;

use m2m_common::{SessionError, SessionResult, Stage, Wait};
use tracing::{debug, error, info, trace, warn};

use crate::error::{configuration, rejected, streaming};
use crate::v4l2::{DequeuedBuffer, Direction, MappedRegion, PlaneLayout, Readiness, VideoDevice};

/// Who may touch a buffer right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    Caller,
    Driver,
}

/// One plane of a buffer. Planes the driver reports with zero length are
/// kept for their slot but never mapped.
#[derive(Debug)]
pub struct Plane {
    pub length: u32,
    pub mem_offset: u32,
    /// Bytes holding valid data, as last queued or dequeued.
    pub bytes_used: u32,
    region: Option<MappedRegion>,
}

impl Plane {
    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub index: u32,
    planes: Vec<Plane>,
    ownership: Ownership,
}

impl Buffer {
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Every plane slot the driver reported, mapped or not.
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Planes actually mapped into the process.
    pub fn mapped_plane_count(&self) -> usize {
        self.planes.iter().filter(|p| p.is_mapped()).count()
    }
}

/// The buffers of one queue direction.
pub struct BufferPool<D: VideoDevice> {
    device: Arc<D>,
    direction: Direction,
    buffers: Vec<Buffer>,
    /// Driver allocation outstanding (needs a zero-count request on release).
    allocated: bool,
    streaming: bool,
    /// A zero-length end-of-stream buffer has been queued.
    end_of_stream: bool,
}

impl<D: VideoDevice> BufferPool<D> {
    /// Request `count` buffers and map all of them. Either the whole pool is
    /// returned or nothing stays mapped or allocated.
    pub fn allocate(device: Arc<D>, direction: Direction, count: u32) -> SessionResult<Self> {
        let mut pool = Self {
            device,
            direction,
            buffers: Vec::new(),
            allocated: false,
            streaming: false,
            end_of_stream: false,
        };
        let granted = pool.request(count)?;
        for index in 0..granted {
            pool.query_and_map(index)?;
        }
        info!(
            direction = direction.name(),
            requested = count,
            granted,
            "Buffer pool ready"
        );
        Ok(pool)
    }

    /// `VIDIOC_REQBUFS`. The driver may grant fewer buffers than asked for;
    /// granting none is a setup failure.
    fn request(&mut self, count: u32) -> SessionResult<u32> {
        let granted = self
            .device
            .request_buffers(self.direction, count)
            .map_err(configuration(Stage::BufferSetup, "VIDIOC_REQBUFS"))?;
        if granted == 0 {
            return Err(rejected(
                Stage::BufferSetup,
                "VIDIOC_REQBUFS",
                "driver granted no buffers",
            ));
        }
        self.allocated = true;
        if granted > count {
            warn!(
                direction = self.direction.name(),
                requested = count,
                granted,
                "Driver granted more buffers than requested"
            );
        } else if granted < count {
            debug!(
                direction = self.direction.name(),
                requested = count,
                granted,
                "Driver granted fewer buffers than requested"
            );
        }
        Ok(granted)
    }

    /// `VIDIOC_QUERYBUF` buffer `index`, then map and zero-fill each plane
    /// with non-zero length. The buffer joins the pool before its planes are
    /// mapped so a failure part-way is rolled back by `release`.
    fn query_and_map(&mut self, index: u32) -> SessionResult<()> {
        let layouts: Vec<PlaneLayout> = self
            .device
            .query_buffer(self.direction, index)
            .map_err(configuration(Stage::BufferSetup, "VIDIOC_QUERYBUF"))?;

        self.buffers.push(Buffer {
            index,
            planes: layouts
                .iter()
                .map(|l| Plane {
                    length: l.length,
                    mem_offset: l.mem_offset,
                    bytes_used: 0,
                    region: None,
                })
                .collect(),
            ownership: Ownership::Caller,
        });
        let slot = self.buffers.len() - 1;

        for (plane, layout) in layouts.iter().enumerate() {
            if layout.length == 0 {
                trace!(index, plane, "Zero-length plane left unmapped");
                continue;
            }
            let mut region = self
                .device
                .map_plane(layout)
                .map_err(configuration(Stage::BufferSetup, "mmap"))?;
            region.as_mut_slice().fill(0);
            trace!(
                direction = self.direction.name(),
                index,
                plane,
                length = layout.length,
                offset = layout.mem_offset,
                "Mapped"
            );
            self.buffers[slot].planes[plane].region = Some(region);
        }
        Ok(())
    }

    /// Stop streaming, unmap every mapped plane and free the driver
    /// allocation. Safe to call any number of times and on a pool that was
    /// never fully built. Failures are logged and do not stop the release.
    pub fn release(&mut self) {
        if self.streaming {
            if let Err(e) = self.stream_off() {
                error!(direction = self.direction.name(), error = %e, "Stream off failed during release");
            }
        }

        let mut unmapped = 0usize;
        for buffer in &mut self.buffers {
            for plane in &mut buffer.planes {
                if let Some(region) = plane.region.take() {
                    match self.device.unmap_plane(region) {
                        Ok(()) => unmapped += 1,
                        Err(e) => error!(
                            direction = self.direction.name(),
                            index = buffer.index,
                            error = %e,
                            "munmap failed"
                        ),
                    }
                }
            }
        }

        if self.allocated {
            if let Err(e) = self.device.request_buffers(self.direction, 0) {
                error!(direction = self.direction.name(), error = %e, "Freeing buffers failed");
            }
            self.allocated = false;
        }

        if unmapped > 0 {
            debug!(direction = self.direction.name(), unmapped, "Buffer pool released");
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn end_of_stream_queued(&self) -> bool {
        self.end_of_stream
    }

    pub fn queued_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.ownership == Ownership::Driver)
            .count()
    }

    /// First buffer currently held by the caller.
    pub fn free_buffer(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| b.ownership == Ownership::Caller)
            .map(|b| b.index)
    }

    fn slot(&self, index: u32) -> SessionResult<usize> {
        let slot = index as usize;
        if slot < self.buffers.len() {
            Ok(slot)
        } else {
            Err(SessionError::InvalidBuffer {
                index: slot,
                count: self.buffers.len(),
            })
        }
    }

    fn caller_slot(&self, index: u32) -> SessionResult<usize> {
        let slot = self.slot(index)?;
        match self.buffers[slot].ownership {
            Ownership::Caller => Ok(slot),
            Ownership::Driver => Err(SessionError::BufferBusy { index: slot }),
        }
    }

    /// Mapped memory of a caller-owned plane.
    pub fn plane(&self, index: u32, plane: usize) -> SessionResult<&[u8]> {
        let slot = self.caller_slot(index)?;
        self.buffers[slot]
            .planes
            .get(plane)
            .and_then(|p| p.region.as_ref())
            .map(MappedRegion::as_slice)
            .ok_or(SessionError::InvalidBuffer {
                index: slot,
                count: self.buffers.len(),
            })
    }

    /// Writable mapped memory of a caller-owned plane.
    pub fn plane_mut(&mut self, index: u32, plane: usize) -> SessionResult<&mut [u8]> {
        let slot = self.caller_slot(index)?;
        let count = self.buffers.len();
        self.buffers[slot]
            .planes
            .get_mut(plane)
            .and_then(|p| p.region.as_mut())
            .map(MappedRegion::as_mut_slice)
            .ok_or(SessionError::InvalidBuffer { index: slot, count })
    }

    /// Hand buffer `index` to the driver. `bytes_used` lists the valid bytes
    /// per plane; missing entries count as zero.
    pub fn queue(&mut self, index: u32, bytes_used: &[u32]) -> SessionResult<()> {
        let slot = self.caller_slot(index)?;
        let plane_count = self.buffers[slot].planes.len().max(1);
        let mut used = vec![0u32; plane_count];
        for (dst, &src) in used.iter_mut().zip(bytes_used) {
            *dst = src;
        }

        let queued = self.device.queue_buffer(self.direction, index, &used);
        match queued {
            Ok(()) => {}
            Err(errno) if !self.streaming => {
                return Err(configuration(Stage::BufferSetup, "VIDIOC_QBUF")(errno))
            }
            Err(errno) => return Err(streaming("VIDIOC_QBUF")(errno)),
        }

        let buffer = &mut self.buffers[slot];
        for (plane, &n) in buffer.planes.iter_mut().zip(&used) {
            plane.bytes_used = n;
        }
        buffer.ownership = Ownership::Driver;
        if self.direction == Direction::Input && used[0] == 0 {
            self.end_of_stream = true;
        }
        trace!(direction = self.direction.name(), index, bytes_used = used[0], "Queued");
        Ok(())
    }

    /// Take back a completed buffer. `Ok(None)` means the driver has no more
    /// buffers to return on this queue (`EPIPE` after the last one).
    pub fn dequeue(&mut self) -> SessionResult<Option<DequeuedBuffer>> {
        let done = match self.device.dequeue_buffer(self.direction) {
            Ok(done) => done,
            Err(nix::errno::Errno::EPIPE) => return Ok(None),
            Err(errno) => return Err(streaming("VIDIOC_DQBUF")(errno)),
        };
        let slot = self.slot(done.index)?;
        let buffer = &mut self.buffers[slot];
        for (plane, &n) in buffer.planes.iter_mut().zip(&done.bytes_used) {
            plane.bytes_used = n.min(plane.length);
        }
        buffer.ownership = Ownership::Caller;
        trace!(
            direction = self.direction.name(),
            index = done.index,
            sequence = done.sequence,
            flags = format_args!("0x{:x}", done.flags),
            "Dequeued"
        );
        Ok(Some(done))
    }

    /// `VIDIOC_STREAMON`. Refused while no buffer is queued.
    pub fn stream_on(&mut self) -> SessionResult<()> {
        if self.queued_count() == 0 {
            return Err(SessionError::NothingQueued(self.direction.name()));
        }
        self.device
            .stream_on(self.direction)
            .map_err(configuration(Stage::Streaming, "VIDIOC_STREAMON"))?;
        self.streaming = true;
        info!(direction = self.direction.name(), queued = self.queued_count(), "Streaming on");
        Ok(())
    }

    /// `VIDIOC_STREAMOFF`. Every queued buffer returns to the caller.
    pub fn stream_off(&mut self) -> SessionResult<()> {
        let result = self
            .device
            .stream_off(self.direction)
            .map_err(streaming("VIDIOC_STREAMOFF"));
        // The driver drops its claim on every buffer whether or not the
        // call reported an error; a failed stream-off leaves nothing to retry.
        for buffer in &mut self.buffers {
            buffer.ownership = Ownership::Caller;
        }
        self.streaming = false;
        debug!(direction = self.direction.name(), "Streaming off");
        result
    }

    /// Wait until this queue has a buffer to dequeue.
    pub fn wait(&self, wait: Wait) -> SessionResult<bool> {
        let ready = self
            .device
            .poll(Readiness::for_direction(self.direction), wait)
            .map_err(streaming("poll"))?;
        Ok(match self.direction {
            Direction::Input => ready.input || ready.error,
            Direction::Output => ready.output || ready.error,
        })
    }
}

impl<D: VideoDevice> Drop for BufferPool<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Call, StubConfig, StubDevice};

    fn stub(config: StubConfig) -> (Arc<StubDevice>, crate::stub::CallLog) {
        let device = StubDevice::new(config);
        let log = device.log();
        (Arc::new(device), log)
    }

    #[test]
    fn grant_is_honored_and_planes_zeroed() {
        let (device, _log) = stub(StubConfig {
            input_grant: 3,
            ..StubConfig::default()
        });
        device.set_format(Direction::Input, m2m_common::fourcc(b"H264"), &[4096]).unwrap();

        let pool = BufferPool::allocate(device, Direction::Input, 8).unwrap();
        assert_eq!(pool.len(), 3);
        for buffer in pool.buffers() {
            assert_eq!(buffer.mapped_plane_count(), 1);
        }
        assert!(pool.plane(0, 0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_grant_is_a_setup_failure() {
        let (device, log) = stub(StubConfig {
            input_grant: 0,
            ..StubConfig::default()
        });
        let err = BufferPool::allocate(device, Direction::Input, 4).err().unwrap();
        assert_eq!(err.stage(), Stage::BufferSetup);
        assert_eq!(log.count(|c| matches!(c, Call::Map { .. })), 0);
    }

    #[test]
    fn queued_buffers_are_off_limits() {
        let (device, _log) = stub(StubConfig::default());
        device.set_format(Direction::Input, m2m_common::fourcc(b"H264"), &[1024]).unwrap();
        let mut pool = BufferPool::allocate(device, Direction::Input, 2).unwrap();

        pool.plane_mut(0, 0).unwrap()[..3].copy_from_slice(b"abc");
        pool.queue(0, &[3]).unwrap();
        assert!(matches!(pool.plane_mut(0, 0), Err(SessionError::BufferBusy { index: 0 })));
        assert!(matches!(pool.queue(0, &[3]), Err(SessionError::BufferBusy { .. })));
        assert!(matches!(pool.queue(9, &[3]), Err(SessionError::InvalidBuffer { index: 9, count: 2 })));
        assert_eq!(pool.free_buffer(), Some(1));
    }

    #[test]
    fn stream_on_requires_a_queued_buffer() {
        let (device, log) = stub(StubConfig::default());
        device.set_format(Direction::Input, m2m_common::fourcc(b"H264"), &[1024]).unwrap();
        let mut pool = BufferPool::allocate(device, Direction::Input, 2).unwrap();

        assert!(matches!(pool.stream_on(), Err(SessionError::NothingQueued("input"))));
        assert_eq!(log.count(|c| matches!(c, Call::StreamOn(_))), 0);
    }

    #[test]
    fn stream_off_returns_buffers_to_caller() {
        let (device, _log) = stub(StubConfig::default());
        device.set_format(Direction::Input, m2m_common::fourcc(b"H264"), &[1024]).unwrap();
        let mut pool = BufferPool::allocate(device, Direction::Input, 2).unwrap();
        pool.queue(0, &[0]).unwrap();
        pool.queue(1, &[0]).unwrap();
        assert_eq!(pool.free_buffer(), None);

        pool.stream_off().unwrap();
        assert_eq!(pool.queued_count(), 0);
        assert!(pool.plane_mut(1, 0).is_ok());
    }
}
