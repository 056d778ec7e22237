//! Start-code delimited elementary streams.
//!
//! The whole file is read up front and cut into syntax units at every start
//! code (`00 00 01` for H.264 and the MPEG family, the 22-bit picture start
//! code for H.263). Units are then grouped into access units: a packet runs
//! from one picture start to the next, with any headers or delimiters that
//! precede a picture carried at the front of that picture's packet.
//!
//! Everything before the first picture becomes the extradata, so the
//! sequence-level headers reach the decoder before any picture data.

use std::ops::Range;
use std::path::Path;

use m2m_common::{CodecId, DemuxError};
use tracing::{debug, info};

use crate::traits::{Demuxer, Packet};

/// Codec implied by an elementary-stream file extension.
pub fn codec_for_path(path: &Path) -> Option<CodecId> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "h264" | "264" | "avc" => Some(CodecId::H264),
        "m4v" | "cmp" => Some(CodecId::Mpeg4),
        "h263" | "263" => Some(CodecId::H263),
        "m2v" => Some(CodecId::Mpeg2Video),
        "m1v" => Some(CodecId::Mpeg1Video),
        _ => None,
    }
}

/// Role of a syntax unit when grouping units into frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum UnitKind {
    /// Sequence-level header.
    Header,
    /// Starts a new access unit but carries no picture data.
    Delimiter,
    /// First unit of a new picture.
    PictureStart,
    /// Belongs to whatever precedes it.
    Continuation,
}

#[derive(Clone, Debug)]
struct Unit {
    /// Byte range of the unit, start code included.
    range: Range<usize>,
    /// Offset of the first byte after the start code.
    payload: usize,
}

/// Demuxer for raw H.264 / MPEG-4 / H.263 / MPEG-1 / MPEG-2 video streams.
pub struct ElementaryStreamDemuxer {
    codec: CodecId,
    data: Vec<u8>,
    units: Vec<Unit>,
    next_unit: usize,
    extradata: Vec<u8>,
}

impl ElementaryStreamDemuxer {
    pub fn open(path: &Path, codec: CodecId) -> Result<Self, DemuxError> {
        let data = std::fs::read(path).map_err(|e| DemuxError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let demuxer = Self::from_bytes(data, codec)?;
        info!(
            path = %path.display(),
            codec = codec.display_name(),
            units = demuxer.units.len(),
            extradata = demuxer.extradata.len(),
            "Opened elementary stream"
        );
        Ok(demuxer)
    }

    /// Build a demuxer over an in-memory stream.
    pub fn from_bytes(data: Vec<u8>, codec: CodecId) -> Result<Self, DemuxError> {
        let units = split_units(&data, codec);
        let first_picture = units
            .iter()
            .position(|u| classify(codec, &data, u) == UnitKind::PictureStart)
            .ok_or_else(|| DemuxError::Malformed("no picture start code found".into()))?;

        let extradata = match units.first() {
            Some(first) if first_picture > 0 => {
                data[first.range.start..units[first_picture].range.start].to_vec()
            }
            _ => Vec::new(),
        };
        debug!(first_picture, "Split elementary stream");

        Ok(Self {
            codec,
            data,
            units,
            next_unit: first_picture,
            extradata,
        })
    }
}

impl Demuxer for ElementaryStreamDemuxer {
    fn codec_id(&self) -> CodecId {
        self.codec
    }

    fn extradata(&self) -> &[u8] {
        &self.extradata
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        let Some(first) = self.units.get(self.next_unit) else {
            return Ok(None);
        };
        let start = first.range.start;

        let mut end = self.next_unit;
        let mut seen_picture = false;
        let mut is_keyframe = false;
        while let Some(unit) = self.units.get(end) {
            match classify(self.codec, &self.data, unit) {
                UnitKind::PictureStart if seen_picture => break,
                UnitKind::Header | UnitKind::Delimiter if seen_picture => break,
                UnitKind::PictureStart => {
                    seen_picture = true;
                    is_keyframe |= is_intra(self.codec, &self.data, unit);
                }
                UnitKind::Header => is_keyframe = true,
                UnitKind::Delimiter | UnitKind::Continuation => {
                    is_keyframe |= is_intra(self.codec, &self.data, unit);
                }
            }
            end += 1;
        }

        let stop = self.units[end - 1].range.end;
        self.next_unit = end;
        Ok(Some(Packet {
            data: self.data[start..stop].to_vec(),
            is_keyframe,
        }))
    }
}

/// Cut `data` into units at every start code.
fn split_units(data: &[u8], codec: CodecId) -> Vec<Unit> {
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] != 0 || data[i + 1] != 0 {
            i += 1;
            continue;
        }
        if codec == CodecId::H263 {
            if data[i + 2] & 0xFC == 0x80 {
                starts.push((i, i + 2));
                i += 3;
                continue;
            }
        } else if data[i + 2] == 1 {
            // A zero byte right before `00 00 01` is part of a 4-byte start code.
            let begin = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((begin, i + 3));
            i += 3;
            continue;
        }
        i += 1;
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(begin, payload)) in starts.iter().enumerate() {
        let end = starts.get(n + 1).map_or(data.len(), |&(next, _)| next);
        units.push(Unit {
            range: begin..end,
            payload,
        });
    }
    units
}

fn classify(codec: CodecId, data: &[u8], unit: &Unit) -> UnitKind {
    let Some(&code) = data.get(unit.payload) else {
        return UnitKind::Continuation;
    };
    match codec {
        CodecId::H264 => match code & 0x1F {
            7 | 8 | 13 | 15 => UnitKind::Header,
            6 | 9 | 14 | 16..=18 => UnitKind::Delimiter,
            // first_mb_in_slice == 0 is coded as a single `1` bit.
            1..=5 => match data.get(unit.payload + 1) {
                Some(b) if b & 0x80 != 0 => UnitKind::PictureStart,
                _ => UnitKind::Continuation,
            },
            _ => UnitKind::Continuation,
        },
        CodecId::Mpeg1Video | CodecId::Mpeg2Video => match code {
            0xB3 => UnitKind::Header,
            0xB8 => UnitKind::Delimiter,
            0x00 => UnitKind::PictureStart,
            _ => UnitKind::Continuation,
        },
        CodecId::Mpeg4 => match code {
            0x00..=0x2F | 0xB0 | 0xB5 => UnitKind::Header,
            0xB3 => UnitKind::Delimiter,
            0xB6 => UnitKind::PictureStart,
            _ => UnitKind::Continuation,
        },
        CodecId::H263 => UnitKind::PictureStart,
        _ => UnitKind::Continuation,
    }
}

/// Whether `unit` codes an intra picture.
fn is_intra(codec: CodecId, data: &[u8], unit: &Unit) -> bool {
    let byte = |n: usize| data.get(unit.payload + n).copied().unwrap_or(0);
    match codec {
        CodecId::H264 => byte(0) & 0x1F == 5,
        // picture_coding_type follows the 10-bit temporal reference; 1 = I.
        CodecId::Mpeg1Video | CodecId::Mpeg2Video => byte(0) == 0x00 && (byte(2) >> 3) & 0x07 == 1,
        // vop_coding_type is the first two bits after the VOP start code; 0 = I.
        CodecId::Mpeg4 => byte(0) == 0xB6 && byte(1) >> 6 == 0,
        // PTYPE bit 9 (picture coding type) sits 38 bits after the PSC; 0 = INTRA.
        CodecId::H263 => byte(2) & 0x02 == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_stream() -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E]); // SPS
        s.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]); // PPS
        s.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x84, 0x21]); // IDR, first_mb 0
        s.extend_from_slice(&[0, 0, 1, 0x65, 0x10, 0x22]); // IDR, second slice
        s.extend_from_slice(&[0, 0, 0, 1, 0x09, 0x10]); // AUD
        s.extend_from_slice(&[0, 0, 1, 0x41, 0x9A, 0x02]); // non-IDR, first_mb 0
        s
    }

    #[test]
    fn h264_headers_become_extradata() {
        let mut demuxer = ElementaryStreamDemuxer::from_bytes(h264_stream(), CodecId::H264).unwrap();
        assert_eq!(demuxer.codec_id(), CodecId::H264);
        assert_eq!(
            demuxer.extradata(),
            &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]
        );

        let first = demuxer.next_packet().unwrap().unwrap();
        assert!(first.is_keyframe);
        assert_eq!(
            first.data,
            vec![0, 0, 1, 0x65, 0x88, 0x84, 0x21, 0, 0, 1, 0x65, 0x10, 0x22]
        );

        let second = demuxer.next_packet().unwrap().unwrap();
        assert!(!second.is_keyframe);
        assert_eq!(second.data, vec![0, 0, 0, 1, 0x09, 0x10, 0, 0, 1, 0x41, 0x9A, 0x02]);

        assert_eq!(demuxer.next_packet().unwrap(), None);
    }

    #[test]
    fn mpeg2_pictures_split_on_picture_start() {
        let mut s = Vec::new();
        s.extend_from_slice(&[0, 0, 1, 0xB3, 0x14, 0x00, 0xF0]); // sequence header
        s.extend_from_slice(&[0, 0, 1, 0xB8, 0x00, 0x08]); // GOP
        s.extend_from_slice(&[0, 0, 1, 0x00, 0x00, 0x0F, 0xFF]); // I picture
        s.extend_from_slice(&[0, 0, 1, 0x01, 0xAA]); // slice
        s.extend_from_slice(&[0, 0, 1, 0x00, 0x00, 0x57, 0xFF]); // P picture
        s.extend_from_slice(&[0, 0, 1, 0x01, 0xBB]); // slice

        let mut demuxer = ElementaryStreamDemuxer::from_bytes(s, CodecId::Mpeg2Video).unwrap();
        assert_eq!(demuxer.extradata().len(), 13);

        let i_frame = demuxer.next_packet().unwrap().unwrap();
        assert!(i_frame.is_keyframe);
        assert_eq!(i_frame.data.len(), 12);

        let p_frame = demuxer.next_packet().unwrap().unwrap();
        assert!(!p_frame.is_keyframe);
        assert_eq!(p_frame.data, vec![0, 0, 1, 0x00, 0x00, 0x57, 0xFF, 0, 0, 1, 0x01, 0xBB]);
        assert!(demuxer.next_packet().unwrap().is_none());
    }

    #[test]
    fn h263_every_psc_is_a_frame() {
        let s = vec![0, 0, 0x80, 0x02, 0x08, 0x11, 0, 0, 0x82, 0x06, 0x0A, 0x22];
        let mut demuxer = ElementaryStreamDemuxer::from_bytes(s, CodecId::H263).unwrap();
        assert!(demuxer.extradata().is_empty());
        assert_eq!(demuxer.next_packet().unwrap().unwrap().data.len(), 6);
        assert_eq!(demuxer.next_packet().unwrap().unwrap().data.len(), 6);
        assert!(demuxer.next_packet().unwrap().is_none());
    }

    #[test]
    fn stream_without_pictures_is_rejected() {
        let s = vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE];
        let err = ElementaryStreamDemuxer::from_bytes(s, CodecId::H264).err();
        assert!(matches!(err, Some(DemuxError::Malformed(_))));
    }

    #[test]
    fn extension_table() {
        assert_eq!(codec_for_path(Path::new("a.H264")), Some(CodecId::H264));
        assert_eq!(codec_for_path(Path::new("a.m4v")), Some(CodecId::Mpeg4));
        assert_eq!(codec_for_path(Path::new("a.m1v")), Some(CodecId::Mpeg1Video));
        assert_eq!(codec_for_path(Path::new("a.mkv")), None);
        assert_eq!(codec_for_path(Path::new("noext")), None);
    }

    #[test]
    fn open_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.264");
        std::fs::write(&path, h264_stream()).unwrap();

        let mut demuxer = crate::open_demuxer(&path).unwrap();
        assert_eq!(demuxer.codec_id(), CodecId::H264);
        let mut frames = 0;
        while demuxer.next_packet().unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 2);
    }
}
