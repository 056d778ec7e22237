//! H.264 NAL framing conversion.
//!
//! Containers such as MP4 and Matroska store H.264 as length-prefixed NAL
//! units with the parameter sets in an `avcC` record. The hardware decoder
//! consumes Annex-B byte streams, so both are rewritten with start codes.

use m2m_common::DemuxError;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Parameter sets and NAL length size extracted from an `avcC` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcConfig {
    /// SPS and PPS units, each prefixed with a start code.
    pub annexb_headers: Vec<u8>,
    /// Size in bytes of the length prefix on every NAL unit (1, 2 or 4).
    pub nal_length_size: usize,
}

/// Whether `extradata` is an `avcC` record rather than Annex-B bytes.
pub fn is_avcc(extradata: &[u8]) -> bool {
    extradata.first() == Some(&1)
}

/// Parse an `AVCDecoderConfigurationRecord`.
pub fn parse_avcc(record: &[u8]) -> Result<AvcConfig, DemuxError> {
    let malformed = |what: &str| DemuxError::Malformed(format!("avcC: {what}"));

    if record.len() < 7 || record[0] != 1 {
        return Err(malformed("bad header"));
    }
    let nal_length_size = usize::from(record[4] & 0x03) + 1;
    if nal_length_size == 3 {
        return Err(malformed("3-byte NAL length"));
    }

    let mut annexb_headers = Vec::new();
    let mut pos = 5;
    // SPS count sits in the low five bits; PPS count is a full byte.
    for mask in [0x1F_u8, 0xFF] {
        let count = record.get(pos).ok_or_else(|| malformed("truncated"))? & mask;
        pos += 1;
        for _ in 0..count {
            let len_bytes = record
                .get(pos..pos + 2)
                .ok_or_else(|| malformed("truncated parameter set length"))?;
            let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
            pos += 2;
            let unit = record
                .get(pos..pos + len)
                .ok_or_else(|| malformed("truncated parameter set"))?;
            annexb_headers.extend_from_slice(&START_CODE);
            annexb_headers.extend_from_slice(unit);
            pos += len;
        }
    }

    Ok(AvcConfig {
        annexb_headers,
        nal_length_size,
    })
}

/// Rewrite a length-prefixed access unit as an Annex-B byte stream.
pub fn length_prefixed_to_annexb(
    data: &[u8],
    nal_length_size: usize,
) -> Result<Vec<u8>, DemuxError> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut pos = 0;
    while pos < data.len() {
        let prefix = data
            .get(pos..pos + nal_length_size)
            .ok_or_else(|| DemuxError::Malformed("truncated NAL length".into()))?;
        let len = prefix
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        pos += nal_length_size;
        let unit = data
            .get(pos..pos + len)
            .ok_or_else(|| DemuxError::Malformed(format!("NAL unit of {len} bytes overruns packet")))?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(unit);
        pos += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVCC: [u8; 19] = [
        0x01, 0x42, 0x00, 0x1E, 0xFF, // version, profile, compat, level, length size 4
        0xE1, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1E, // one SPS
        0x01, 0x00, 0x03, 0x68, 0xCE, 0x38, // one PPS
        0x00, // trailing byte ignored
    ];

    #[test]
    fn avcc_parameter_sets() {
        assert!(is_avcc(&AVCC));
        let config = parse_avcc(&AVCC).unwrap();
        assert_eq!(config.nal_length_size, 4);
        assert_eq!(
            config.annexb_headers,
            vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE, 0x38]
        );
    }

    #[test]
    fn truncated_avcc_is_malformed() {
        assert!(parse_avcc(&AVCC[..10]).is_err());
        assert!(!is_avcc(&[0, 0, 0, 1, 0x67]));
    }

    #[test]
    fn length_prefixes_become_start_codes() {
        let packet = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x06];
        assert_eq!(
            length_prefixed_to_annexb(&packet, 4).unwrap(),
            vec![0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x06]
        );

        let short = [0, 9, 0x65];
        assert!(length_prefixed_to_annexb(&short, 2).is_err());
    }
}
