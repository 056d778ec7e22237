//! Demuxer codec identifiers and the hardware coded-format table.

use serde::{Deserialize, Serialize};

/// Video codec identifier as reported by a container demuxer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    H264,
    Mpeg4,
    H263,
    Mpeg2Video,
    Mpeg1Video,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Unknown,
}

impl CodecId {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::H263 => "H.263",
            Self::Mpeg2Video => "MPEG-2 Video",
            Self::Mpeg1Video => "MPEG-1 Video",
            Self::Hevc => "H.265/HEVC",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
            Self::Unknown => "unknown",
        }
    }
}

/// Coded-stream formats accepted by the decoder's compressed-stream queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecFormat {
    H264,
    Mpeg4,
    H263,
    Mpeg2,
    Mpeg1,
    Unsupported,
}

impl CodecFormat {
    /// V4L2 pixel format code for this coded format, `None` for `Unsupported`.
    pub fn fourcc(self) -> Option<u32> {
        match self {
            Self::H264 => Some(fourcc(b"H264")),
            Self::Mpeg4 => Some(fourcc(b"MPG4")),
            Self::H263 => Some(fourcc(b"H263")),
            Self::Mpeg2 => Some(fourcc(b"MPG2")),
            Self::Mpeg1 => Some(fourcc(b"MPG1")),
            Self::Unsupported => None,
        }
    }
}

/// Translate a demuxer codec identifier into the hardware coded format.
///
/// Pure and total: anything outside the table is `Unsupported`.
pub fn map_codec(id: CodecId) -> CodecFormat {
    match id {
        CodecId::H264 => CodecFormat::H264,
        CodecId::Mpeg4 => CodecFormat::Mpeg4,
        CodecId::H263 => CodecFormat::H263,
        CodecId::Mpeg2Video => CodecFormat::Mpeg2,
        CodecId::Mpeg1Video => CodecFormat::Mpeg1,
        CodecId::Hevc | CodecId::Vp8 | CodecId::Vp9 | CodecId::Av1 | CodecId::Unknown => {
            CodecFormat::Unsupported
        }
    }
}

/// Build a little-endian FourCC code (`v4l2_fourcc`).
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Render a FourCC as printable text, e.g. `"NM12"`.
pub fn fourcc_to_string(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_table_is_exact() {
        let table = [
            (CodecId::H264, CodecFormat::H264, 0x3436_3248),
            (CodecId::Mpeg4, CodecFormat::Mpeg4, 0x3447_504d),
            (CodecId::H263, CodecFormat::H263, 0x3336_3248),
            (CodecId::Mpeg2Video, CodecFormat::Mpeg2, 0x3247_504d),
            (CodecId::Mpeg1Video, CodecFormat::Mpeg1, 0x3147_504d),
        ];
        for (id, format, code) in table {
            assert_eq!(map_codec(id), format, "{id:?}");
            assert_eq!(format.fourcc(), Some(code), "{format:?}");
        }
    }

    #[test]
    fn everything_else_is_unsupported() {
        for id in [
            CodecId::Hevc,
            CodecId::Vp8,
            CodecId::Vp9,
            CodecId::Av1,
            CodecId::Unknown,
        ] {
            assert_eq!(map_codec(id), CodecFormat::Unsupported);
        }
        assert_eq!(CodecFormat::Unsupported.fourcc(), None);
    }

    #[test]
    fn fourcc_text() {
        assert_eq!(fourcc_to_string(fourcc(b"NM12")), "NM12");
        assert_eq!(fourcc_to_string(0), "....");
    }
}
