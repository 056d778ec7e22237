//! Frame sinks shipped with the command-line tool.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use m2m_decoder::{DecodedFrame, FrameSink};
use tracing::debug;

/// Counts frames and bytes without keeping them.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub frames: u64,
    pub bytes: u64,
}

impl FrameSink for CountingSink {
    fn consume(&mut self, frame: &DecodedFrame<'_>) -> io::Result<()> {
        self.frames += 1;
        self.bytes += frame.planes.iter().map(|p| p.len() as u64).sum::<u64>();
        Ok(())
    }
}

/// Writes every decoded plane back to back into one file.
pub struct RawFileSink<W: Write = BufWriter<File>> {
    out: W,
    counter: CountingSink,
}

impl RawFileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> RawFileSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            counter: CountingSink::default(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.counter.frames
    }

    pub fn bytes(&self) -> u64 {
        self.counter.bytes
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> FrameSink for RawFileSink<W> {
    fn consume(&mut self, frame: &DecodedFrame<'_>) -> io::Result<()> {
        for plane in &frame.planes {
            self.out.write_all(plane)?;
        }
        self.counter.consume(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        debug!(frames = self.counter.frames, bytes = self.counter.bytes, "Flushing raw output");
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2m_decoder::v4l2::{PlaneFormat, Rect};
    use m2m_decoder::OutputFormat;

    fn format() -> OutputFormat {
        OutputFormat {
            pixel_format: m2m_common::fourcc(b"NM12"),
            width: 4,
            height: 2,
            visible: Rect {
                left: 0,
                top: 0,
                width: 4,
                height: 2,
            },
            planes: vec![
                PlaneFormat { size: 8, stride: 4 },
                PlaneFormat { size: 4, stride: 4 },
            ],
            buffer_count: 2,
        }
    }

    #[test]
    fn raw_sink_writes_planes_in_order() {
        let format = format();
        let luma = [1u8; 8];
        let chroma = [2u8; 4];
        let frame = DecodedFrame {
            index: 0,
            sequence: 0,
            format: &format,
            planes: vec![&luma[..], &chroma[..]],
        };

        let mut sink = RawFileSink::new(Vec::new());
        sink.consume(&frame).unwrap();
        sink.consume(&frame).unwrap();
        sink.finish().unwrap();

        assert_eq!(sink.frames(), 2);
        assert_eq!(sink.bytes(), 24);
        let written = sink.into_inner();
        assert_eq!(&written[..12], &[1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(written.len(), 24);
    }

    #[test]
    fn file_sink_flushes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yuv");
        let format = format();
        let plane = [7u8; 8];

        let mut sink = RawFileSink::create(&path).unwrap();
        sink.consume(&DecodedFrame {
            index: 1,
            sequence: 0,
            format: &format,
            planes: vec![&plane[..]],
        })
        .unwrap();
        sink.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 8]);
    }
}
