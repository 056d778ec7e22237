//! The streaming session: one open decode device, its two buffer pools and
//! the protocol state machine that orders every call on them.
//!
//! ```text
//! CLOSED -> OPENED -> FORMAT_SET -> BUFFERS_READY -> STREAMING -> DRAINING -> CLOSED
//! ```
//!
//! The compressed-stream side is configured first: format, input pool, the
//! header primed into the first input buffer, input streaming on. Only then
//! has the hardware seen the stream header, so only then can the decoded
//! picture format be queried and the output pool sized. [`split`] hands out
//! the two directions as independent halves for the steady-state loops.
//!
//! ## Teardown
//!
//! Teardown runs exactly once, from [`close`] or from `Drop`, whatever state
//! was reached: stream off both queues, release both pools (unmapping every
//! plane), then close the device. Pools hold their own reference to the
//! device, so the handle cannot close while a mapping is alive.
//!
//! [`split`]: StreamingSession::split
//! [`close`]: StreamingSession::close

use std::sync::Arc;

use m2m_common::{
    fourcc_to_string, map_codec, CodecFormat, CodecId, SessionError, SessionResult, Stage, Wait,
};
use tracing::{debug, error, info, trace, warn};

use crate::error::{configuration, rejected, streaming};
use crate::pool::BufferPool;
use crate::v4l2::ffi::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::v4l2::{Direction, PlaneFormat, Readiness, Rect, VideoDevice};

/// Protocol state of a [`StreamingSession`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    FormatSet,
    BuffersReady,
    Streaming,
    Draining,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Opened => "OPENED",
            Self::FormatSet => "FORMAT_SET",
            Self::BuffersReady => "BUFFERS_READY",
            Self::Streaming => "STREAMING",
            Self::Draining => "DRAINING",
        }
    }
}

/// Decoded-picture format learned after the stream header was parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    /// Visible region inside the decoded picture.
    pub visible: Rect,
    pub planes: Vec<PlaneFormat>,
    /// Output buffers actually granted.
    pub buffer_count: usize,
}

/// Owns the device handle and both buffer pools of one decode session.
pub struct StreamingSession<D: VideoDevice> {
    output: Option<BufferPool<D>>,
    input: Option<BufferPool<D>>,
    device: Option<Arc<D>>,
    state: SessionState,
    codec: Option<CodecFormat>,
    output_format: Option<OutputFormat>,
}

impl<D: VideoDevice> StreamingSession<D> {
    /// Start a session on an opened, capability-validated device.
    pub fn new(device: D) -> Self {
        info!(device = %device.path().display(), "Session opened");
        Self {
            output: None,
            input: None,
            device: Some(Arc::new(device)),
            state: SessionState::Opened,
            codec: None,
            output_format: None,
        }
    }

    /// Current state. Streaming becomes draining once the end-of-stream
    /// buffer has been queued.
    pub fn state(&self) -> SessionState {
        match (&self.state, &self.input) {
            (SessionState::Streaming, Some(input)) if input.end_of_stream_queued() => {
                SessionState::Draining
            }
            (state, _) => *state,
        }
    }

    pub fn codec(&self) -> Option<CodecFormat> {
        self.codec
    }

    pub fn output_format(&self) -> Option<&OutputFormat> {
        self.output_format.as_ref()
    }

    pub fn input_pool(&self) -> Option<&BufferPool<D>> {
        self.input.as_ref()
    }

    pub fn output_pool(&self) -> Option<&BufferPool<D>> {
        self.output.as_ref()
    }

    fn require(&self, op: &'static str, stage: Stage, allowed: &[SessionState]) -> SessionResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                stage,
                op,
                state: self.state().name(),
            })
        }
    }

    fn device(&self) -> SessionResult<&Arc<D>> {
        self.device.as_ref().ok_or(SessionError::InvalidState {
            stage: Stage::Streaming,
            op: "device access",
            state: SessionState::Closed.name(),
        })
    }

    /// OPENED -> FORMAT_SET: set the compressed-stream format.
    ///
    /// `input_buffer_size` must hold the largest compressed frame; longer
    /// frames are truncated when queued.
    pub fn set_format(&mut self, codec: CodecId, input_buffer_size: u32) -> SessionResult<CodecFormat> {
        self.require("set_format", Stage::FormatNegotiation, &[SessionState::Opened])?;
        let format = map_codec(codec);
        let Some(pixel_format) = format.fourcc() else {
            warn!(codec = codec.display_name(), "Codec has no hardware format");
            return Err(SessionError::UnsupportedCodec(codec));
        };

        let applied = self
            .device()?
            .set_format(Direction::Input, pixel_format, &[input_buffer_size])
            .map_err(configuration(Stage::FormatNegotiation, "VIDIOC_S_FMT"))?;
        let granted_size = applied.planes.first().map_or(0, |p| p.size);
        if granted_size != 0 && granted_size < input_buffer_size {
            warn!(
                requested = input_buffer_size,
                granted = granted_size,
                "Driver shrank the input buffer size"
            );
        }
        info!(
            codec = codec.display_name(),
            fourcc = %fourcc_to_string(pixel_format),
            buffer_size = input_buffer_size,
            "Input format set"
        );

        self.codec = Some(format);
        self.state = SessionState::FormatSet;
        Ok(format)
    }

    /// FORMAT_SET -> BUFFERS_READY: request and map the input pool.
    pub fn setup_input(&mut self, count: u32) -> SessionResult<usize> {
        self.require("setup_input", Stage::BufferSetup, &[SessionState::FormatSet])?;
        let pool = BufferPool::allocate(Arc::clone(self.device()?), Direction::Input, count)?;
        let granted = pool.len();
        self.input = Some(pool);
        self.state = SessionState::BuffersReady;
        Ok(granted)
    }

    /// Copy `data` into a free input buffer and queue it. Used to prime the
    /// queue with the stream header before streaming starts.
    pub fn queue_input(&mut self, data: &[u8]) -> SessionResult<u32> {
        self.require(
            "queue_input",
            Stage::BufferSetup,
            &[SessionState::BuffersReady, SessionState::Streaming],
        )?;
        let pool = self.input.as_mut().ok_or(SessionError::InvalidState {
            stage: Stage::BufferSetup,
            op: "queue_input",
            state: "no input pool",
        })?;
        let index = pool.free_buffer().ok_or(SessionError::TransientBusy)?;
        fill_and_queue(pool, index, data)?;
        Ok(index)
    }

    /// BUFFERS_READY -> STREAMING: start the compressed-stream queue. At
    /// least one input buffer must be queued.
    pub fn start_input(&mut self) -> SessionResult<()> {
        self.require("start_input", Stage::BufferSetup, &[SessionState::BuffersReady])?;
        if let Some(pool) = self.input.as_mut() {
            pool.stream_on()?;
        }
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Size, map, queue and start the decoded-picture pool from the format
    /// the driver reports after parsing the header.
    ///
    /// The pool holds the driver's minimum capture buffer count plus
    /// `extra`, or `fallback` plus `extra` when the driver does not report
    /// a minimum. `header_wait` bounds the wait for the header buffer to be
    /// consumed before the format is read.
    pub fn setup_output(&mut self, extra: u32, fallback: u32, header_wait: Wait) -> SessionResult<&OutputFormat> {
        self.require("setup_output", Stage::FormatNegotiation, &[SessionState::Streaming])?;
        if self.output.is_some() {
            return Err(SessionError::InvalidState {
                stage: Stage::BufferSetup,
                op: "setup_output",
                state: "output already configured",
            });
        }
        let device = Arc::clone(self.device()?);

        if let Some(input) = self.input.as_ref() {
            let consumed = input.wait(header_wait)?;
            debug!(consumed, "Header wait finished");
        }

        let format = device
            .get_format(Direction::Output)
            .map_err(configuration(Stage::FormatNegotiation, "VIDIOC_G_FMT"))?;
        if format.width == 0 || format.height == 0 {
            return Err(rejected(
                Stage::FormatNegotiation,
                "VIDIOC_G_FMT",
                "decoded size unknown, stream header not parsed",
            ));
        }

        let visible = match device.get_crop(Direction::Output) {
            Ok(rect) => rect,
            Err(e) => {
                debug!(error = %e, "VIDIOC_G_CROP unavailable, using full frame");
                Rect {
                    left: 0,
                    top: 0,
                    width: format.width,
                    height: format.height,
                }
            }
        };

        let min_buffers = match device.get_control(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE) {
            Ok(n) if n > 0 => n as u32,
            Ok(n) => {
                warn!(reported = n, fallback, "Unusable minimum capture buffer count");
                fallback
            }
            Err(e) => {
                warn!(error = %e, fallback, "Minimum capture buffer count unavailable");
                fallback
            }
        };

        let mut pool = BufferPool::allocate(device, Direction::Output, min_buffers + extra)?;
        for index in 0..pool.len() as u32 {
            pool.queue(index, &[])?;
        }
        pool.stream_on()?;

        info!(
            width = format.width,
            height = format.height,
            fourcc = %fourcc_to_string(format.pixel_format),
            visible = format_args!("{}x{}+{}+{}", visible.width, visible.height, visible.left, visible.top),
            buffers = pool.len(),
            "Output format negotiated"
        );

        let output_format = OutputFormat {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            visible,
            planes: format.planes,
            buffer_count: pool.len(),
        };
        self.output = Some(pool);
        Ok(&*self.output_format.insert(output_format))
    }

    /// Split the streaming session into its two independently driven
    /// halves.
    pub fn split(&mut self) -> SessionResult<(InputQueue<'_, D>, OutputQueue<'_, D>)> {
        self.require("split", Stage::Streaming, &[SessionState::Streaming])?;
        match (
            self.input.as_mut(),
            self.output.as_mut(),
            self.output_format.as_ref(),
        ) {
            (Some(input), Some(output), Some(format)) => Ok((
                InputQueue { pool: input },
                OutputQueue {
                    pool: output,
                    format,
                },
            )),
            _ => Err(SessionError::InvalidState {
                stage: Stage::BufferSetup,
                op: "split",
                state: "output not configured",
            }),
        }
    }

    /// Tear the session down and close the device.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let reached = self.state().name();

        for pool in [self.output.as_mut(), self.input.as_mut()].into_iter().flatten() {
            if pool.is_streaming() {
                if let Err(e) = pool.stream_off() {
                    error!(direction = pool.direction().name(), error = %e, "Stream off failed");
                }
            }
        }
        if let Some(mut pool) = self.output.take() {
            pool.release();
        }
        if let Some(mut pool) = self.input.take() {
            pool.release();
        }

        if let Some(device) = self.device.take() {
            let path = device.path().to_path_buf();
            if Arc::strong_count(&device) > 1 {
                error!(device = %path.display(), "Device still referenced at close");
            }
            drop(device);
            info!(device = %path.display(), reached, "Session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl<D: VideoDevice> Drop for StreamingSession<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Copy one compressed frame into plane 0 of a caller-owned input buffer and
/// queue it. Frames larger than the plane are truncated.
fn fill_and_queue<D: VideoDevice>(
    pool: &mut BufferPool<D>,
    index: u32,
    data: &[u8],
) -> SessionResult<usize> {
    let plane = pool.plane_mut(index, 0)?;
    let len = data.len().min(plane.len());
    if len < data.len() {
        warn!(
            index,
            frame = data.len(),
            capacity = plane.len(),
            "Compressed frame truncated to fit the input buffer"
        );
    }
    plane[..len].copy_from_slice(&data[..len]);
    pool.queue(index, &[len as u32])?;
    Ok(len)
}

// ---------------------------------------------------------------------------
// Input half
// ---------------------------------------------------------------------------

/// The compressed-stream half of a split session.
pub struct InputQueue<'a, D: VideoDevice> {
    pool: &'a mut BufferPool<D>,
}

impl<D: VideoDevice> InputQueue<'_, D> {
    /// A caller-owned input buffer: one never queued, or else one the
    /// driver has finished with. `TransientBusy` when none is available.
    pub fn acquire(&mut self) -> SessionResult<u32> {
        if let Some(index) = self.pool.free_buffer() {
            return Ok(index);
        }
        match self.pool.dequeue()? {
            Some(done) => Ok(done.index),
            None => Err(streaming("VIDIOC_DQBUF")(nix::errno::Errno::EPIPE)),
        }
    }

    /// Copy `data` into buffer `index` and queue it. Returns the bytes
    /// queued. Empty frames are skipped, since an empty buffer means end of
    /// stream.
    pub fn submit(&mut self, index: u32, data: &[u8]) -> SessionResult<usize> {
        if data.is_empty() {
            trace!(index, "Skipping empty frame");
            return Ok(0);
        }
        fill_and_queue(self.pool, index, data)
    }

    /// Queue the zero-length buffer that tells the decoder no more input
    /// follows. Does nothing if already queued.
    pub fn end_of_stream(&mut self) -> SessionResult<()> {
        if self.pool.end_of_stream_queued() {
            return Ok(());
        }
        let index = self.acquire()?;
        self.pool.queue(index, &[0])?;
        info!(index, "End of stream queued, draining");
        Ok(())
    }

    pub fn is_end_of_stream_queued(&self) -> bool {
        self.pool.end_of_stream_queued()
    }

    /// Wait until an input buffer comes back from the driver.
    pub fn wait(&self, wait: Wait) -> SessionResult<bool> {
        self.pool.wait(wait)
    }

    /// Poll the device for readiness on any of the queues in `interest`.
    pub fn poll(&self, interest: Readiness, wait: Wait) -> SessionResult<Readiness> {
        self.pool
            .device()
            .poll(interest, wait)
            .map_err(streaming("poll"))
    }
}

// ---------------------------------------------------------------------------
// Output half
// ---------------------------------------------------------------------------

/// A decoded buffer taken from the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: u32,
    pub sequence: u32,
    pub bytes_used: Vec<u32>,
    /// The driver marked this as the final buffer.
    pub is_last: bool,
    /// The driver flagged the decode as failed.
    pub corrupted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    Frame(FrameInfo),
    /// No further decoded buffers will arrive.
    EndOfStream,
}

/// A decoded picture, borrowed from a caller-owned output buffer.
#[derive(Debug)]
pub struct DecodedFrame<'a> {
    pub index: u32,
    pub sequence: u32,
    pub format: &'a OutputFormat,
    /// The valid bytes of each mapped plane.
    pub planes: Vec<&'a [u8]>,
}

/// The decoded-picture half of a split session.
pub struct OutputQueue<'a, D: VideoDevice> {
    pool: &'a mut BufferPool<D>,
    format: &'a OutputFormat,
}

impl<D: VideoDevice> OutputQueue<'_, D> {
    pub fn format(&self) -> &OutputFormat {
        self.format
    }

    /// Take the next decoded buffer. End of stream is signalled by `EPIPE`,
    /// or by an empty buffer (normally flagged `LAST`). A buffer flagged
    /// `ERROR` is a failed decode, never end of stream, even when empty.
    pub fn dequeue(&mut self) -> SessionResult<OutputEvent> {
        let Some(done) = self.pool.dequeue()? else {
            debug!("Output queue reports no more buffers");
            return Ok(OutputEvent::EndOfStream);
        };
        if !done.has_error() && done.bytes_used.first().copied().unwrap_or(0) == 0 {
            debug!(index = done.index, last = done.is_last(), "Empty output buffer, end of stream");
            return Ok(OutputEvent::EndOfStream);
        }
        Ok(OutputEvent::Frame(FrameInfo {
            index: done.index,
            sequence: done.sequence,
            is_last: done.is_last(),
            corrupted: done.has_error(),
            bytes_used: done.bytes_used,
        }))
    }

    /// Borrow the planes of a dequeued frame.
    pub fn frame(&self, info: &FrameInfo) -> SessionResult<DecodedFrame<'_>> {
        let buffer = self
            .pool
            .buffers()
            .get(info.index as usize)
            .ok_or(SessionError::InvalidBuffer {
                index: info.index as usize,
                count: self.pool.len(),
            })?;
        let mut planes = Vec::with_capacity(buffer.mapped_plane_count());
        for (n, plane) in buffer.planes().iter().enumerate() {
            if !plane.is_mapped() {
                continue;
            }
            let data = self.pool.plane(info.index, n)?;
            let used = (plane.bytes_used as usize).min(data.len());
            planes.push(&data[..used]);
        }
        Ok(DecodedFrame {
            index: info.index,
            sequence: info.sequence,
            format: self.format,
            planes,
        })
    }

    /// Give a consumed buffer back to the driver.
    pub fn requeue(&mut self, index: u32) -> SessionResult<()> {
        self.pool.queue(index, &[])
    }

    /// Wait until a decoded buffer is ready.
    pub fn wait(&self, wait: Wait) -> SessionResult<bool> {
        self.pool.wait(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Call, StubConfig, StubDevice};

    fn session(config: StubConfig) -> (StreamingSession<StubDevice>, crate::stub::CallLog) {
        let device = StubDevice::new(config);
        let log = device.log();
        (StreamingSession::new(device), log)
    }

    #[test]
    fn unsupported_codec_stops_before_any_driver_call() {
        let (mut session, log) = session(StubConfig::default());
        let err = session.set_format(CodecId::Vp9, 1 << 20).unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedCodec(CodecId::Vp9)));
        assert_eq!(err.stage(), Stage::FormatNegotiation);
        assert_eq!(session.state(), SessionState::Opened);
        assert_eq!(log.count(|c| matches!(c, Call::SetFormat { .. })), 0);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let (mut session, _log) = session(StubConfig::default());
        assert!(matches!(
            session.setup_input(4),
            Err(SessionError::InvalidState { op: "setup_input", state: "OPENED", .. })
        ));
        assert!(matches!(
            session.start_input(),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(session.split().is_err());
    }

    #[test]
    fn start_input_refuses_an_empty_queue() {
        let (mut session, log) = session(StubConfig::default());
        session.set_format(CodecId::H264, 4096).unwrap();
        session.setup_input(2).unwrap();
        assert!(matches!(session.start_input(), Err(SessionError::NothingQueued("input"))));
        assert_eq!(session.state(), SessionState::BuffersReady);
        assert_eq!(log.count(|c| matches!(c, Call::StreamOn(_))), 0);
    }

    #[test]
    fn output_needs_a_parsed_header() {
        let (mut session, _log) = session(StubConfig::default());
        session.set_format(CodecId::H264, 4096).unwrap();
        session.setup_input(2).unwrap();
        // An empty buffer is an end-of-stream marker, not a header.
        let pool = session.input.as_mut().unwrap();
        pool.queue(0, &[0]).unwrap();
        session.start_input().unwrap();

        let err = session.setup_output(2, 4, Wait::Immediate).unwrap_err();
        assert!(matches!(
            err,
            SessionError::ConfigurationFailed { op: "VIDIOC_G_FMT", stage: Stage::FormatNegotiation, .. }
        ));
    }

    #[test]
    fn output_pool_uses_driver_minimum_plus_extra() {
        let (mut session, _log) = session(StubConfig {
            min_buffers: Some(3),
            output_grant: 16,
            crop: Some(Rect {
                left: 0,
                top: 0,
                width: 60,
                height: 30,
            }),
            ..StubConfig::default()
        });
        session.set_format(CodecId::Mpeg2Video, 4096).unwrap();
        session.setup_input(2).unwrap();
        session.queue_input(&[0, 0, 1, 0xB3]).unwrap();
        session.start_input().unwrap();

        let format = session.setup_output(2, 4, Wait::Immediate).unwrap().clone();
        assert_eq!(format.buffer_count, 5);
        assert_eq!((format.width, format.height), (64, 32));
        assert_eq!(format.visible.width, 60);
        assert_eq!(session.output_pool().unwrap().queued_count(), 5);
        assert!(session.output_pool().unwrap().is_streaming());
    }

    #[test]
    fn close_after_format_failure_still_closes_device() {
        let (mut session, log) = session(StubConfig {
            fail_set_format: true,
            ..StubConfig::default()
        });
        let err = session.set_format(CodecId::H264, 4096).unwrap_err();
        assert_eq!(err.stage(), Stage::FormatNegotiation);
        session.close();
        assert_eq!(log.calls().last(), Some(&Call::Close { live_mappings: 0 }));
    }

    #[test]
    fn drop_tears_down_exactly_once() {
        let log = {
            let (mut session, log) = session(StubConfig::default());
            session.set_format(CodecId::H264, 4096).unwrap();
            session.setup_input(2).unwrap();
            log
        };
        assert_eq!(log.count(|c| matches!(c, Call::Close { .. })), 1);
        assert_eq!(log.count(|c| matches!(c, Call::Unmap { .. })), 2);
        assert_eq!(
            log.count(|c| matches!(c, Call::RequestBuffers { count: 0, .. })),
            1
        );
    }
}
