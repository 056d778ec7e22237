//! A synthetic decode device for driving sessions without hardware.
//!
//! [`StubDevice`] implements [`VideoDevice`] entirely in memory and records
//! every call into a shared [`CallLog`], including its own close. It models
//! a stateful decoder closely enough to exercise the whole lifecycle: the
//! first non-empty input buffer is taken as the stream header (and makes
//! the decoded format available), every later one produces a decoded frame,
//! and a zero-length input buffer starts the flush that ends with a
//! `LAST`-flagged empty output buffer. It can also fail single decodes and
//! end output early with the input queue stalled.
//!
//! Between queue and dequeue the stub watches the buffer's memory; any change
//! made by the caller in that window is logged as [`Call::WriteWhileQueued`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use m2m_common::Wait;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::v4l2::ffi::{
    V4L2_BUF_FLAG_ERROR, V4L2_BUF_FLAG_LAST, V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE_MPLANE,
    V4L2_CAP_VIDEO_OUTPUT_MPLANE, V4L2_CID_MIN_BUFFERS_FOR_CAPTURE,
};
use crate::v4l2::{
    Capabilities, DequeuedBuffer, Direction, FrameFormat, MappedRegion, PlaneFormat, PlaneLayout,
    Readiness, Rect, VideoDevice,
};

/// One recorded driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    QueryCaps,
    SetFormat { direction: Direction, pixel_format: u32 },
    GetFormat(Direction),
    GetCrop(Direction),
    GetControl(u32),
    RequestBuffers { direction: Direction, count: u32, granted: u32 },
    QueryBuffer { direction: Direction, index: u32 },
    Map { direction: Direction, index: u32, plane: usize, length: u32 },
    MapFailed { direction: Direction, index: u32, plane: usize },
    Unmap { direction: Direction, index: u32, plane: usize },
    /// `unmap_plane` with a region the stub does not know (double unmap).
    UnmapUnknown,
    Queue { direction: Direction, index: u32, bytes_used: Vec<u32> },
    Dequeue { direction: Direction, index: u32, bytes_used: u32, flags: u32 },
    StreamOn(Direction),
    StreamOff(Direction),
    WriteWhileQueued { direction: Direction, index: u32 },
    Close { live_mappings: usize },
}

/// Shared, append-only record of calls. Outlives the device it was taken
/// from so tests can inspect the close.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().iter().filter(|c| pred(c)).count()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.0.lock().iter().position(|c| pred(c))
    }

    /// Index of the last call matching `pred`.
    pub fn last_position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.0.lock().iter().rposition(|c| pred(c))
    }
}

/// Scripted behavior of a [`StubDevice`].
#[derive(Clone, Debug)]
pub struct StubConfig {
    pub caps: Capabilities,
    /// Most input buffers the stub grants.
    pub input_grant: u32,
    /// Most output buffers the stub grants.
    pub output_grant: u32,
    /// Plane lengths reported for input buffers; defaults to the sizes
    /// given to `set_format`.
    pub input_plane_lengths: Option<Vec<u32>>,
    /// Plane lengths reported for output buffers; defaults to NV12M planes
    /// for `width` x `height`.
    pub output_plane_lengths: Option<Vec<u32>>,
    /// Decoded size reported once the header has been consumed.
    pub width: u32,
    pub height: u32,
    pub crop: Option<Rect>,
    pub min_buffers: Option<i32>,
    pub fail_set_format: bool,
    /// Fail mapping of `(direction, buffer, plane)`.
    pub fail_map_at: Option<(Direction, u32, usize)>,
    /// Decoded frames held back until end of stream.
    pub reorder_depth: u32,
    /// Output sequence number returned empty and flagged `ERROR`.
    pub decode_error_at: Option<u32>,
    /// After this many output buffers, emit `LAST` and stop consuming
    /// input.
    pub stop_after: Option<u32>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            caps: Capabilities {
                driver: "s5p-mfc".into(),
                card: "stub decoder".into(),
                bus_info: "platform:stub".into(),
                capabilities: V4L2_CAP_VIDEO_CAPTURE_MPLANE
                    | V4L2_CAP_VIDEO_OUTPUT_MPLANE
                    | V4L2_CAP_STREAMING,
                device_caps: 0,
            },
            input_grant: 2,
            output_grant: 2,
            input_plane_lengths: None,
            output_plane_lengths: None,
            width: 64,
            height: 32,
            crop: None,
            min_buffers: None,
            fail_set_format: false,
            fail_map_at: None,
            reorder_depth: 0,
            decode_error_at: None,
            stop_after: None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    count: u32,
    streaming: bool,
    queued: VecDeque<(u32, Vec<u32>)>,
    done: VecDeque<DequeuedBuffer>,
    sequence: u32,
}

#[derive(Debug)]
struct Mapping {
    direction: Direction,
    index: u32,
    plane: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct State {
    input_format: Option<FrameFormat>,
    input: QueueState,
    output: QueueState,
    /// Live mappings by base address.
    mappings: HashMap<usize, Mapping>,
    /// Buffer contents captured at queue time.
    snapshots: HashMap<(Direction, u32), Vec<u8>>,
    header_seen: bool,
    pending_frames: u32,
    end_of_stream: bool,
    last_emitted: bool,
    /// Input is no longer consumed.
    stalled: bool,
}

impl State {
    fn queue(&mut self, direction: Direction) -> &mut QueueState {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    fn contents(&self, direction: Direction, index: u32) -> Vec<u8> {
        let mut planes: Vec<(&usize, &Mapping)> = self
            .mappings
            .iter()
            .filter(|(_, m)| m.direction == direction && m.index == index)
            .collect();
        planes.sort_by_key(|(_, m)| m.plane);
        let mut bytes = Vec::new();
        for (&addr, m) in planes {
            // SAFETY: `addr` is a live allocation of `m.len` bytes owned by
            // this stub until `unmap_plane`.
            bytes.extend_from_slice(unsafe { std::slice::from_raw_parts(addr as *const u8, m.len) });
        }
        bytes
    }

    fn fill(&mut self, direction: Direction, index: u32, value: u8) {
        for (&addr, m) in &self.mappings {
            if m.direction == direction && m.index == index {
                // SAFETY: as in `contents`; the buffer is driver-owned, so the
                // caller holds no slice into it.
                unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, m.len) }.fill(value);
            }
        }
    }
}

/// In-memory decode device. See the module docs for its behavior.
#[derive(Debug)]
pub struct StubDevice {
    config: StubConfig,
    state: Mutex<State>,
    log: CallLog,
    path: std::path::PathBuf,
}

impl StubDevice {
    pub fn new(config: StubConfig) -> Self {
        Self::with_log(config, CallLog::default())
    }

    /// A stub appending to an existing log, for multi-device scenarios.
    pub fn with_log(config: StubConfig, log: CallLog) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            log,
            path: "/dev/stub-video".into(),
        }
    }

    pub fn at_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn output_lengths(&self) -> Vec<u32> {
        self.config.output_plane_lengths.clone().unwrap_or_else(|| {
            let luma = self.config.width * self.config.height;
            vec![luma, luma / 2]
        })
    }

    fn input_lengths(&self, state: &State) -> Vec<u32> {
        self.config.input_plane_lengths.clone().unwrap_or_else(|| {
            state
                .input_format
                .as_ref()
                .map(|f| f.planes.iter().map(|p| p.size).collect())
                .unwrap_or_else(|| vec![0])
        })
    }

    fn check_untouched(&self, state: &mut State, direction: Direction, index: u32) {
        if let Some(before) = state.snapshots.get(&(direction, index)) {
            if *before != state.contents(direction, index) {
                self.log.push(Call::WriteWhileQueued { direction, index });
            }
        }
    }

    /// Advance the simulated hardware as far as queued buffers allow.
    fn process(&self, state: &mut State) {
        if state.input.streaming && !state.stalled {
            while let Some((index, used)) = state.input.queued.pop_front() {
                let len = used.first().copied().unwrap_or(0);
                if len == 0 {
                    state.end_of_stream = true;
                } else if !state.header_seen {
                    state.header_seen = true;
                } else {
                    state.pending_frames += 1;
                }
                let sequence = state.input.sequence;
                state.input.sequence += 1;
                state.input.done.push_back(DequeuedBuffer {
                    index,
                    bytes_used: used,
                    flags: 0,
                    sequence,
                });
            }
        }

        if !state.output.streaming {
            return;
        }
        let lengths = self.output_lengths();
        loop {
            if state.last_emitted {
                break;
            }
            if self.config.stop_after.is_some_and(|n| state.output.sequence >= n) {
                let Some((index, _)) = state.output.queued.pop_front() else {
                    break;
                };
                let sequence = state.output.sequence;
                state.output.sequence += 1;
                state.output.done.push_back(DequeuedBuffer {
                    index,
                    bytes_used: vec![0; lengths.len()],
                    flags: V4L2_BUF_FLAG_LAST,
                    sequence,
                });
                state.last_emitted = true;
                state.stalled = true;
                return;
            }
            let ready = if state.end_of_stream {
                state.pending_frames > 0
            } else {
                state.pending_frames > self.config.reorder_depth
            };
            if !ready {
                break;
            }
            let Some((index, _)) = state.output.queued.pop_front() else {
                break;
            };
            self.check_untouched(state, Direction::Output, index);
            let sequence = state.output.sequence;
            state.output.sequence += 1;
            state.pending_frames -= 1;
            if self.config.decode_error_at == Some(sequence) {
                state.output.done.push_back(DequeuedBuffer {
                    index,
                    bytes_used: vec![0; lengths.len()],
                    flags: V4L2_BUF_FLAG_ERROR,
                    sequence,
                });
                continue;
            }
            state.fill(Direction::Output, index, (sequence as u8).wrapping_add(1));
            let contents = state.contents(Direction::Output, index);
            state.snapshots.insert((Direction::Output, index), contents);
            state.output.done.push_back(DequeuedBuffer {
                index,
                bytes_used: lengths.clone(),
                flags: 0,
                sequence,
            });
        }

        if state.end_of_stream && state.pending_frames == 0 && !state.last_emitted {
            if let Some((index, _)) = state.output.queued.pop_front() {
                let sequence = state.output.sequence;
                state.output.sequence += 1;
                state.output.done.push_back(DequeuedBuffer {
                    index,
                    bytes_used: vec![0; lengths.len()],
                    flags: V4L2_BUF_FLAG_LAST,
                    sequence,
                });
                state.last_emitted = true;
            }
        }
    }
}

impl Drop for StubDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        self.log.push(Call::Close {
            live_mappings: state.mappings.len(),
        });
        for (addr, m) in state.mappings.drain() {
            // SAFETY: reclaiming the leaked allocation made in `map_plane`.
            drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(addr as *mut u8, m.len)) });
        }
    }
}

fn encode_offset(direction: Direction, index: u32, plane: usize) -> u32 {
    let dir = match direction {
        Direction::Input => 1,
        Direction::Output => 2,
    };
    (dir << 28) | (index << 8) | plane as u32
}

fn decode_offset(offset: u32) -> Option<(Direction, u32, usize)> {
    let direction = match offset >> 28 {
        1 => Direction::Input,
        2 => Direction::Output,
        _ => return None,
    };
    Some((direction, (offset >> 8) & 0x000F_FFFF, (offset & 0xFF) as usize))
}

impl VideoDevice for StubDevice {
    fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn query_caps(&self) -> nix::Result<Capabilities> {
        self.log.push(Call::QueryCaps);
        Ok(self.config.caps.clone())
    }

    fn set_format(
        &self,
        direction: Direction,
        pixel_format: u32,
        plane_sizes: &[u32],
    ) -> nix::Result<FrameFormat> {
        self.log.push(Call::SetFormat {
            direction,
            pixel_format,
        });
        if self.config.fail_set_format {
            return Err(Errno::EINVAL);
        }
        let format = FrameFormat {
            pixel_format,
            width: 0,
            height: 0,
            planes: plane_sizes
                .iter()
                .map(|&size| PlaneFormat { size, stride: 0 })
                .collect(),
        };
        if direction == Direction::Input {
            self.state.lock().input_format = Some(format.clone());
        }
        Ok(format)
    }

    fn get_format(&self, direction: Direction) -> nix::Result<FrameFormat> {
        self.log.push(Call::GetFormat(direction));
        let state = self.state.lock();
        match direction {
            Direction::Input => state.input_format.clone().ok_or(Errno::EINVAL),
            Direction::Output if !state.header_seen => Ok(FrameFormat::default()),
            Direction::Output => Ok(FrameFormat {
                pixel_format: m2m_common::fourcc(b"NM12"),
                width: self.config.width,
                height: self.config.height,
                planes: self
                    .output_lengths()
                    .into_iter()
                    .map(|size| PlaneFormat {
                        size,
                        stride: self.config.width,
                    })
                    .collect(),
            }),
        }
    }

    fn get_crop(&self, direction: Direction) -> nix::Result<Rect> {
        self.log.push(Call::GetCrop(direction));
        self.config.crop.ok_or(Errno::EINVAL)
    }

    fn get_control(&self, id: u32) -> nix::Result<i32> {
        self.log.push(Call::GetControl(id));
        match (id, self.config.min_buffers) {
            (V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, Some(n)) => Ok(n),
            _ => Err(Errno::EINVAL),
        }
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> nix::Result<u32> {
        let mut state = self.state.lock();
        let queue = state.queue(direction);
        if queue.streaming && count > 0 {
            return Err(Errno::EBUSY);
        }
        let limit = match direction {
            Direction::Input => self.config.input_grant,
            Direction::Output => self.config.output_grant,
        };
        let granted = count.min(limit);
        queue.count = granted;
        queue.queued.clear();
        queue.done.clear();
        self.log.push(Call::RequestBuffers {
            direction,
            count,
            granted,
        });
        Ok(granted)
    }

    fn query_buffer(&self, direction: Direction, index: u32) -> nix::Result<Vec<PlaneLayout>> {
        let mut state = self.state.lock();
        if index >= state.queue(direction).count {
            return Err(Errno::EINVAL);
        }
        self.log.push(Call::QueryBuffer { direction, index });
        let lengths = match direction {
            Direction::Input => self.input_lengths(&state),
            Direction::Output => self.output_lengths(),
        };
        Ok(lengths
            .into_iter()
            .enumerate()
            .map(|(plane, length)| PlaneLayout {
                length,
                mem_offset: encode_offset(direction, index, plane),
            })
            .collect())
    }

    fn map_plane(&self, layout: &PlaneLayout) -> nix::Result<MappedRegion> {
        let (direction, index, plane) = decode_offset(layout.mem_offset).ok_or(Errno::EINVAL)?;
        if self.config.fail_map_at == Some((direction, index, plane)) {
            self.log.push(Call::MapFailed {
                direction,
                index,
                plane,
            });
            return Err(Errno::ENOMEM);
        }
        let len = layout.length as usize;
        let memory: Box<[u8]> = vec![0xAA; len].into_boxed_slice();
        let ptr = Box::into_raw(memory).cast::<u8>();
        let ptr = std::ptr::NonNull::new(ptr).ok_or(Errno::ENOMEM)?;
        self.state.lock().mappings.insert(
            ptr.as_ptr() as usize,
            Mapping {
                direction,
                index,
                plane,
                len,
            },
        );
        self.log.push(Call::Map {
            direction,
            index,
            plane,
            length: layout.length,
        });
        // SAFETY: the allocation stays alive until `unmap_plane` or drop.
        Ok(unsafe { MappedRegion::from_raw(ptr, len) })
    }

    fn unmap_plane(&self, region: MappedRegion) -> nix::Result<()> {
        let addr = region.as_ptr() as usize;
        let Some(m) = self.state.lock().mappings.remove(&addr) else {
            self.log.push(Call::UnmapUnknown);
            return Err(Errno::EINVAL);
        };
        self.log.push(Call::Unmap {
            direction: m.direction,
            index: m.index,
            plane: m.plane,
        });
        // SAFETY: reclaiming the allocation leaked in `map_plane`; it was
        // just removed from the live set, so this happens once.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(addr as *mut u8, m.len)) });
        Ok(())
    }

    fn queue_buffer(&self, direction: Direction, index: u32, bytes_used: &[u32]) -> nix::Result<()> {
        let mut state = self.state.lock();
        let queue = state.queue(direction);
        let busy = queue.queued.iter().any(|(i, _)| *i == index)
            || queue.done.iter().any(|b| b.index == index);
        if index >= queue.count || busy {
            return Err(Errno::EINVAL);
        }
        queue.queued.push_back((index, bytes_used.to_vec()));
        let contents = state.contents(direction, index);
        state.snapshots.insert((direction, index), contents);
        self.log.push(Call::Queue {
            direction,
            index,
            bytes_used: bytes_used.to_vec(),
        });
        self.process(&mut state);
        Ok(())
    }

    fn dequeue_buffer(&self, direction: Direction) -> nix::Result<DequeuedBuffer> {
        let mut state = self.state.lock();
        if !state.queue(direction).streaming {
            return Err(Errno::EINVAL);
        }
        let Some(done) = state.queue(direction).done.pop_front() else {
            return Err(if direction == Direction::Output && state.last_emitted {
                Errno::EPIPE
            } else {
                Errno::EAGAIN
            });
        };
        self.check_untouched(&mut state, direction, done.index);
        state.snapshots.remove(&(direction, done.index));
        self.log.push(Call::Dequeue {
            direction,
            index: done.index,
            bytes_used: done.bytes_used.first().copied().unwrap_or(0),
            flags: done.flags,
        });
        Ok(done)
    }

    fn stream_on(&self, direction: Direction) -> nix::Result<()> {
        let mut state = self.state.lock();
        self.log.push(Call::StreamOn(direction));
        if state.queue(direction).count == 0 {
            return Err(Errno::EINVAL);
        }
        state.queue(direction).streaming = true;
        self.process(&mut state);
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> nix::Result<()> {
        let mut state = self.state.lock();
        self.log.push(Call::StreamOff(direction));
        let queue = state.queue(direction);
        queue.streaming = false;
        queue.queued.clear();
        queue.done.clear();
        state.snapshots.retain(|(d, _), _| *d != direction);
        Ok(())
    }

    fn poll(&self, interest: Readiness, wait: Wait) -> nix::Result<Readiness> {
        let ready = {
            let state = self.state.lock();
            Readiness {
                input: interest.input && !state.input.done.is_empty(),
                output: interest.output && (!state.output.done.is_empty() || state.last_emitted),
                error: false,
            }
        };
        if !ready.any() && wait != Wait::Immediate {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_trip_through_mapping() {
        let offset = encode_offset(Direction::Output, 5, 1);
        assert_eq!(decode_offset(offset), Some((Direction::Output, 5, 1)));
        assert_eq!(decode_offset(0), None);
    }

    #[test]
    fn close_reports_leaked_mappings() {
        let log = {
            let device = StubDevice::new(StubConfig::default());
            device.request_buffers(Direction::Output, 1).unwrap();
            let layouts = device.query_buffer(Direction::Output, 0).unwrap();
            let region = device.map_plane(&layouts[0]).unwrap();
            assert!(region.as_slice().iter().all(|&b| b == 0xAA));
            std::mem::forget(region);
            device.log()
        };
        assert_eq!(log.calls().last(), Some(&Call::Close { live_mappings: 1 }));
    }

    #[test]
    fn writes_to_a_queued_buffer_are_reported() {
        let device = StubDevice::new(StubConfig::default());
        device
            .set_format(Direction::Input, m2m_common::fourcc(b"H264"), &[64])
            .unwrap();
        assert_eq!(device.request_buffers(Direction::Input, 2).unwrap(), 2);
        let regions: Vec<MappedRegion> = (0..2)
            .map(|index| {
                let layouts = device.query_buffer(Direction::Input, index).unwrap();
                device.map_plane(&layouts[0]).unwrap()
            })
            .collect();

        device.queue_buffer(Direction::Input, 0, &[8]).unwrap();
        device.queue_buffer(Direction::Input, 1, &[8]).unwrap();
        // SAFETY: the region is live; buffer 1 is driver-owned, which is
        // exactly the write the stub must notice.
        unsafe { *regions[1].as_ptr().add(3) = 0x55 };
        device.stream_on(Direction::Input).unwrap();

        assert_eq!(device.dequeue_buffer(Direction::Input).unwrap().index, 0);
        assert_eq!(device.dequeue_buffer(Direction::Input).unwrap().index, 1);
        let log = device.log();
        assert_eq!(log.count(|c| matches!(c, Call::WriteWhileQueued { .. })), 1);
        assert!(log.calls().contains(&Call::WriteWhileQueued {
            direction: Direction::Input,
            index: 1,
        }));

        for region in regions {
            device.unmap_plane(region).unwrap();
        }
    }

    #[test]
    fn double_unmap_is_detected() {
        let device = StubDevice::new(StubConfig::default());
        device.request_buffers(Direction::Output, 1).unwrap();
        let layouts = device.query_buffer(Direction::Output, 0).unwrap();
        let region = device.map_plane(&layouts[0]).unwrap();
        // SAFETY: test-only alias to provoke a second unmap of the same base.
        let alias = unsafe {
            MappedRegion::from_raw(std::ptr::NonNull::new(region.as_ptr()).unwrap(), region.len())
        };
        device.unmap_plane(region).unwrap();
        assert_eq!(device.unmap_plane(alias), Err(Errno::EINVAL));
        assert_eq!(device.log().count(|c| *c == Call::UnmapUnknown), 1);
    }
}
