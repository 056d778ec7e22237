//! Container demuxing through FFmpeg (`ffmpeg` feature).

use std::path::Path;

use ffmpeg_next as ffmpeg;
use m2m_common::{CodecId, DemuxError};
use tracing::{debug, info, warn};

use crate::nal;
use crate::traits::{Demuxer, Packet};

/// Demuxer over any container libavformat can open. Only the best video
/// stream is read; packets of other streams are skipped.
pub struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    codec: CodecId,
    extradata: Vec<u8>,
    /// NAL length size when H.264 packets are length-prefixed.
    nal_length_size: Option<usize>,
}

// SAFETY: the format context is owned exclusively by this demuxer and only
// touched through `&mut self`, so moving it to another thread is sound.
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(path: &Path) -> Result<Self, DemuxError> {
        let open_err = |e: ffmpeg::Error| DemuxError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        ffmpeg::init().map_err(open_err)?;

        let input = ffmpeg::format::input(&path).map_err(open_err)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(DemuxError::NoVideoStream)?;
        let stream_index = stream.index();
        let parameters = stream.parameters();
        let codec = codec_from_ffmpeg(parameters.id());

        // SAFETY: `parameters` borrows the stream's codecpar, which stays
        // valid for as long as `input` is open. The extradata pointer and
        // size are filled in by libavformat together.
        let raw_extradata = unsafe {
            let par = parameters.as_ptr();
            if (*par).extradata.is_null() || (*par).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize)
                    .to_vec()
            }
        };

        let (extradata, nal_length_size) = if codec == CodecId::H264 && nal::is_avcc(&raw_extradata) {
            let config = nal::parse_avcc(&raw_extradata)?;
            (config.annexb_headers, Some(config.nal_length_size))
        } else {
            (raw_extradata, None)
        };

        info!(
            path = %path.display(),
            stream_index,
            codec = codec.display_name(),
            extradata = extradata.len(),
            length_prefixed = nal_length_size.is_some(),
            "Opened container"
        );

        Ok(Self {
            input,
            stream_index,
            codec,
            extradata,
            nal_length_size,
        })
    }
}

impl Demuxer for FfmpegDemuxer {
    fn codec_id(&self) -> CodecId {
        self.codec
    }

    fn extradata(&self) -> &[u8] {
        &self.extradata
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => {
                    warn!(error = %e, "Packet read failed");
                    return Err(DemuxError::Malformed(e.to_string()));
                }
            }
            if packet.stream() != self.stream_index {
                continue;
            }
            let Some(data) = packet.data() else {
                debug!("Skipping empty packet");
                continue;
            };
            let data = match self.nal_length_size {
                Some(size) => nal::length_prefixed_to_annexb(data, size)?,
                None => data.to_vec(),
            };
            return Ok(Some(Packet {
                data,
                is_keyframe: packet.is_key(),
            }));
        }
    }
}

fn codec_from_ffmpeg(id: ffmpeg::codec::Id) -> CodecId {
    use ffmpeg::codec::Id;
    match id {
        Id::H264 => CodecId::H264,
        Id::MPEG4 => CodecId::Mpeg4,
        Id::H263 => CodecId::H263,
        Id::MPEG2VIDEO => CodecId::Mpeg2Video,
        Id::MPEG1VIDEO => CodecId::Mpeg1Video,
        Id::HEVC => CodecId::Hevc,
        Id::VP8 => CodecId::Vp8,
        Id::VP9 => CodecId::Vp9,
        Id::AV1 => CodecId::Av1,
        _ => CodecId::Unknown,
    }
}
