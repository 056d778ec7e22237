//! Steady-state transfer: moving compressed packets into the input queue and
//! decoded pictures out of the output queue until end of stream.
//!
//! Two scheduling models drive the same session:
//!
//! * [`run_threaded`] feeds input on a scoped worker thread while the calling
//!   thread drains output. A shared abort flag stops the feeder once output
//!   is finished or either side fails.
//! * [`run_polled`] does both from one thread, interleaving non-blocking
//!   queue operations with a single readiness wait.
//!
//! Both bound each wait by the configured [`Wait`]: `Forever` waits in
//! slices, `For(d)` reports a stall as a stream fault after `d` without
//! progress, `Immediate` never blocks.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use m2m_common::{DecoderConfig, Scheduling, SessionError, SessionResult, Wait};
use m2m_demux::{Demuxer, Packet};
use tracing::{debug, info, trace, warn};

use crate::session::{DecodedFrame, FrameInfo, InputQueue, OutputEvent, OutputQueue, StreamingSession};
use crate::v4l2::{Readiness, VideoDevice};

/// Longest single wait, so abort requests are noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Consumer of decoded pictures.
pub trait FrameSink {
    fn consume(&mut self, frame: &DecodedFrame<'_>) -> io::Result<()>;

    /// Called once after the last frame.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Totals of one decode run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames_in: u64,
    pub bytes_in: u64,
    pub frames_out: u64,
    /// Buffers the driver flagged as failed; not handed to the sink.
    pub corrupted: u64,
}

#[derive(Default)]
struct Fed {
    packets: u64,
    bytes: u64,
}

#[derive(Default)]
struct Drained {
    frames: u64,
    corrupted: u64,
}

/// Wait until `ready` reports progress. `Ok(false)` when aborted.
fn wait_until(
    mut ready: impl FnMut(Wait) -> SessionResult<bool>,
    limit: Wait,
    abort: &AtomicBool,
) -> SessionResult<bool> {
    let started = Instant::now();
    loop {
        if abort.load(Ordering::Acquire) {
            return Ok(false);
        }
        let slice = match limit {
            Wait::Immediate => Wait::Immediate,
            Wait::Forever => Wait::For(POLL_SLICE),
            Wait::For(d) => Wait::For(d.saturating_sub(started.elapsed()).min(POLL_SLICE)),
        };
        if ready(slice)? {
            return Ok(true);
        }
        match limit {
            Wait::Immediate => std::thread::yield_now(),
            Wait::For(d) if started.elapsed() >= d => {
                return Err(SessionError::StreamFault {
                    op: "poll",
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no queue progress within {d:?}"),
                    ),
                });
            }
            Wait::For(_) | Wait::Forever => {}
        }
    }
}

fn feed_input<D: VideoDevice>(
    input: &mut InputQueue<'_, D>,
    demuxer: &mut dyn Demuxer,
    limit: Wait,
    abort: &AtomicBool,
) -> SessionResult<Fed> {
    let mut fed = Fed::default();
    while let Some(packet) = demuxer.next_packet()? {
        loop {
            match input.acquire() {
                Ok(index) => {
                    let queued = input.submit(index, &packet.data)?;
                    trace!(index, bytes = queued, keyframe = packet.is_keyframe, "Packet queued");
                    fed.packets += 1;
                    fed.bytes += queued as u64;
                    break;
                }
                Err(e) if e.is_transient() => {
                    if !wait_until(|w| input.wait(w), limit, abort)? {
                        return Ok(fed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if abort.load(Ordering::Acquire) {
            return Ok(fed);
        }
    }

    loop {
        match input.end_of_stream() {
            Ok(()) => break,
            Err(e) if e.is_transient() => {
                if !wait_until(|w| input.wait(w), limit, abort)? {
                    return Ok(fed);
                }
            }
            Err(e) => return Err(e),
        }
    }
    info!(packets = fed.packets, bytes = fed.bytes, "Input exhausted");
    Ok(fed)
}

/// Hand one dequeued buffer to the sink and give it back to the driver.
/// Returns `false` when it was the final buffer.
fn deliver<D: VideoDevice>(
    output: &mut OutputQueue<'_, D>,
    info: &FrameInfo,
    sink: &mut dyn FrameSink,
    drained: &mut Drained,
) -> SessionResult<bool> {
    if info.corrupted {
        warn!(index = info.index, sequence = info.sequence, "Driver flagged a decode error, dropping frame");
        drained.corrupted += 1;
    } else {
        let frame = output.frame(info)?;
        sink.consume(&frame).map_err(SessionError::Sink)?;
        drained.frames += 1;
    }
    if info.is_last {
        debug!(index = info.index, "Final buffer carried a picture");
        return Ok(false);
    }
    output.requeue(info.index)?;
    Ok(true)
}

fn drain_output<D: VideoDevice>(
    output: &mut OutputQueue<'_, D>,
    sink: &mut dyn FrameSink,
    limit: Wait,
    abort: &AtomicBool,
) -> SessionResult<Drained> {
    let mut drained = Drained::default();
    loop {
        match output.dequeue() {
            Ok(OutputEvent::Frame(info)) => {
                if !deliver(output, &info, sink, &mut drained)? {
                    break;
                }
            }
            Ok(OutputEvent::EndOfStream) => break,
            Err(e) if e.is_transient() => {
                if !wait_until(|w| output.wait(w), limit, abort)? {
                    return Ok(drained);
                }
            }
            Err(e) => return Err(e),
        }
    }
    sink.finish().map_err(SessionError::Sink)?;
    info!(frames = drained.frames, corrupted = drained.corrupted, "Output drained");
    Ok(drained)
}

fn worker_panicked() -> SessionError {
    SessionError::StreamFault {
        op: "input worker",
        source: io::Error::new(io::ErrorKind::Other, "input thread panicked"),
    }
}

/// Feed input on a worker thread and drain output on the calling thread.
pub fn run_threaded<D: VideoDevice>(
    session: &mut StreamingSession<D>,
    demuxer: &mut dyn Demuxer,
    sink: &mut dyn FrameSink,
    limit: Wait,
) -> SessionResult<DecodeStats> {
    let (mut input, mut output) = session.split()?;
    let abort = AtomicBool::new(false);

    let joined = crossbeam::scope(|scope| {
        let feeder = scope.spawn(|_| {
            let result = feed_input(&mut input, demuxer, limit, &abort);
            if result.is_err() {
                abort.store(true, Ordering::Release);
            }
            result
        });
        let drained = drain_output(&mut output, sink, limit, &abort);
        // Nothing more comes out, so the feeder must not wait for input
        // buffers a finished or failed decoder will never return.
        abort.store(true, Ordering::Release);
        (feeder.join(), drained)
    });

    let (fed, drained) = joined.map_err(|_| worker_panicked())?;
    let fed = fed.map_err(|_| worker_panicked())?;
    let fed = fed?;
    let drained = drained?;
    Ok(DecodeStats {
        frames_in: fed.packets,
        bytes_in: fed.bytes,
        frames_out: drained.frames,
        corrupted: drained.corrupted,
    })
}

/// Drive both queues from the calling thread.
pub fn run_polled<D: VideoDevice>(
    session: &mut StreamingSession<D>,
    demuxer: &mut dyn Demuxer,
    sink: &mut dyn FrameSink,
    limit: Wait,
) -> SessionResult<DecodeStats> {
    let (mut input, mut output) = session.split()?;
    let never = AtomicBool::new(false);
    let mut fed = Fed::default();
    let mut drained = Drained::default();
    let mut pending: Option<Packet> = None;
    let mut demux_done = false;

    'session: loop {
        // Fill every input buffer that is free.
        while !input.is_end_of_stream_queued() {
            if pending.is_none() && !demux_done {
                pending = demuxer.next_packet()?;
                demux_done = pending.is_none();
            }
            let result = match pending.as_ref() {
                Some(packet) => input.acquire().and_then(|index| input.submit(index, &packet.data)),
                None => input.end_of_stream().map(|()| 0),
            };
            match result {
                Ok(queued) => {
                    if pending.take().is_some() {
                        fed.packets += 1;
                        fed.bytes += queued as u64;
                    }
                }
                Err(e) if e.is_transient() => break,
                Err(e) => return Err(e),
            }
        }

        // Drain every decoded picture that is ready.
        loop {
            match output.dequeue() {
                Ok(OutputEvent::Frame(info)) => {
                    if !deliver(&mut output, &info, sink, &mut drained)? {
                        break 'session;
                    }
                }
                Ok(OutputEvent::EndOfStream) => break 'session,
                Err(e) if e.is_transient() => break,
                Err(e) => return Err(e),
            }
        }

        let interest = if input.is_end_of_stream_queued() {
            Readiness::OUTPUT
        } else {
            Readiness::BOTH
        };
        wait_until(|w| input.poll(interest, w).map(|r| r.any()), limit, &never)?;
    }

    sink.finish().map_err(SessionError::Sink)?;
    info!(packets = fed.packets, frames = drained.frames, "Polled decode finished");
    Ok(DecodeStats {
        frames_in: fed.packets,
        bytes_in: fed.bytes,
        frames_out: drained.frames,
        corrupted: drained.corrupted,
    })
}

/// Run a complete decode of `demuxer` on `device`: configure, stream to
/// end of stream, tear down. The session is closed on every path.
pub fn decode<D: VideoDevice>(
    device: D,
    demuxer: &mut dyn Demuxer,
    sink: &mut dyn FrameSink,
    config: &DecoderConfig,
) -> SessionResult<DecodeStats> {
    let mut session = StreamingSession::new(device);
    let result = configure_and_run(&mut session, demuxer, sink, config);
    session.close();
    result
}

fn configure_and_run<D: VideoDevice>(
    session: &mut StreamingSession<D>,
    demuxer: &mut dyn Demuxer,
    sink: &mut dyn FrameSink,
    config: &DecoderConfig,
) -> SessionResult<DecodeStats> {
    session.set_format(demuxer.codec_id(), config.input_buffer_size)?;
    session.setup_input(config.input_buffers)?;

    // The hardware needs the stream header before it can report the
    // decoded format. Without codec extradata the first packet carries it.
    let mut primed = DecodeStats::default();
    if demuxer.extradata().is_empty() {
        let packet = demuxer.next_packet()?.ok_or(SessionError::NothingQueued("input"))?;
        session.queue_input(&packet.data)?;
        primed.frames_in = 1;
        primed.bytes_in = packet.data.len() as u64;
    } else {
        let header = demuxer.extradata().to_vec();
        session.queue_input(&header)?;
    }
    session.start_input()?;
    session.setup_output(
        config.extra_output_buffers,
        config.output_buffers,
        config.poll_timeout(),
    )?;

    let limit = config.poll_timeout();
    let stats = match config.scheduling {
        Scheduling::Threaded => run_threaded(session, demuxer, sink, limit)?,
        Scheduling::Polled => run_polled(session, demuxer, sink, limit)?,
    };
    Ok(DecodeStats {
        frames_in: stats.frames_in + primed.frames_in,
        bytes_in: stats.bytes_in + primed.bytes_in,
        ..stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_wait_spins_until_ready() {
        let abort = AtomicBool::new(false);
        let mut calls = 0;
        let ready = wait_until(
            |w| {
                assert_eq!(w, Wait::Immediate);
                calls += 1;
                Ok(calls == 3)
            },
            Wait::Immediate,
            &abort,
        )
        .unwrap();
        assert!(ready);
        assert_eq!(calls, 3);
    }

    #[test]
    fn bounded_wait_reports_a_stall() {
        let abort = AtomicBool::new(false);
        let err = wait_until(|_| Ok(false), Wait::For(Duration::from_millis(5)), &abort).unwrap_err();
        match err {
            SessionError::StreamFault { op, source } => {
                assert_eq!(op, "poll");
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn abort_stops_an_unbounded_wait() {
        let abort = AtomicBool::new(true);
        assert!(!wait_until(|_| Ok(false), Wait::Forever, &abort).unwrap());
    }

    #[test]
    fn forever_waits_in_slices() {
        let abort = AtomicBool::new(false);
        let mut seen = Vec::new();
        wait_until(
            |w| {
                seen.push(w);
                Ok(seen.len() == 2)
            },
            Wait::Forever,
            &abort,
        )
        .unwrap();
        assert_eq!(seen, vec![Wait::For(POLL_SLICE); 2]);
    }
}
