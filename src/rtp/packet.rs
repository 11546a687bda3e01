use bytes::Bytes;
use std::fmt;

/// RTP protocol version (RFC 3550).
pub const RTP_VERSION: u8 = 2;
/// Fixed header length before CSRC list and extension.
pub const MIN_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpParseError {
    /// Datagram shorter than the fixed 12-byte header.
    TooShort,
    UnsupportedVersion(u8),
    /// CSRC list, extension, or padding extends past the datagram.
    Truncated,
}

impl fmt::Display for RtpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "datagram shorter than the RTP fixed header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported RTP version {}", v),
            Self::Truncated => write!(f, "RTP header fields extend past the datagram"),
        }
    }
}

impl std::error::Error for RtpParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    /// Extension profile id and data, when the X bit is set.
    pub extension_data: Option<(u16, Vec<u8>)>,
    /// Trailing pad count, when the P bit is set.
    pub padding_len: u8,
}

/// One parsed inbound datagram: raw bytes, decoded header, and the payload
/// with CSRCs, extension, and padding removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub raw: Bytes,
    pub payload: Bytes,
}

/// Decode one UDP datagram into header and payload.
pub fn parse(buf: &[u8]) -> Result<RtpPacket, RtpParseError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(RtpParseError::TooShort);
    }
    let b0 = buf[0];
    let version = b0 >> 6;
    if version != RTP_VERSION {
        return Err(RtpParseError::UnsupportedVersion(version));
    }
    let padding = b0 & 0b0010_0000 != 0;
    let extension = b0 & 0b0001_0000 != 0;
    let csrc_count = b0 & 0x0F;

    let b1 = buf[1];
    let marker = b1 & 0x80 != 0;
    let payload_type = b1 & 0x7F;

    let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
    let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let mut offset = MIN_HEADER_LEN;
    let mut csrcs = Vec::with_capacity(csrc_count as usize);
    for _ in 0..csrc_count {
        let end = offset + 4;
        if buf.len() < end {
            return Err(RtpParseError::Truncated);
        }
        csrcs.push(u32::from_be_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]));
        offset = end;
    }

    let extension_data = if extension {
        if buf.len() < offset + 4 {
            return Err(RtpParseError::Truncated);
        }
        let profile = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if buf.len() < offset + words * 4 {
            return Err(RtpParseError::Truncated);
        }
        let data = buf[offset..offset + words * 4].to_vec();
        offset += words * 4;
        Some((profile, data))
    } else {
        None
    };

    let mut end = buf.len();
    let mut padding_len = 0u8;
    if padding {
        padding_len = buf[end - 1];
        let pad = padding_len as usize;
        if pad == 0 || offset + pad > end {
            return Err(RtpParseError::Truncated);
        }
        end -= pad;
    }

    let raw = Bytes::copy_from_slice(buf);
    let payload = raw.slice(offset..end);
    Ok(RtpPacket {
        header: RtpHeader {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension_data,
            padding_len,
        },
        raw,
        payload,
    })
}

/// Reorder/duplicate filter: a packet is stale when its sequence number does
/// not advance past `prev`, unless the gap is large enough to be a wrap.
pub fn seq_is_stale(prev: u16, seq: u16) -> bool {
    prev >= seq && prev - seq < 60000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::framer::RtpFramer;

    fn fixed_header(seq: u16, ts: u32, ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, 0x00];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_plain_packet() {
        let mut buf = fixed_header(100, 1000, 0x1234);
        buf.extend_from_slice(&[0xAA; 160]);

        let pkt = parse(&buf).unwrap();
        assert_eq!(pkt.header.version, 2);
        assert_eq!(pkt.header.payload_type, 0);
        assert!(!pkt.header.marker);
        assert_eq!(pkt.header.sequence_number, 100);
        assert_eq!(pkt.header.timestamp, 1000);
        assert_eq!(pkt.header.ssrc, 0x1234);
        assert_eq!(pkt.payload.len(), 160);
        assert!(pkt.payload.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_parse_rejects_short_and_empty() {
        assert_eq!(parse(&[]), Err(RtpParseError::TooShort));
        assert_eq!(parse(&[0x80; 11]), Err(RtpParseError::TooShort));
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let mut buf = fixed_header(1, 1, 1);
        buf[0] = 0x40; // version 1
        assert_eq!(parse(&buf), Err(RtpParseError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_parse_consumes_csrc_list() {
        let mut buf = fixed_header(7, 70, 0x99);
        buf[0] = 0x80 | 2; // CC = 2
        buf.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
        buf.extend_from_slice(&0x11223344u32.to_be_bytes());
        buf.extend_from_slice(&[0x5A; 8]);

        let pkt = parse(&buf).unwrap();
        assert_eq!(pkt.header.csrcs, vec![0xAABBCCDD, 0x11223344]);
        assert_eq!(pkt.payload.len(), 8);
        assert!(pkt.payload.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_parse_consumes_extension_header() {
        let mut buf = fixed_header(7, 70, 0x99);
        buf[0] = 0x80 | 0b0001_0000; // X set
        buf.extend_from_slice(&0xBEDEu16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // one 32-bit word
        buf.extend_from_slice(&[1, 2, 3, 4]);
        buf.extend_from_slice(&[0x5A; 4]);

        let pkt = parse(&buf).unwrap();
        assert_eq!(pkt.header.extension_data, Some((0xBEDE, vec![1, 2, 3, 4])));
        assert_eq!(&pkt.payload[..], &[0x5A; 4]);
    }

    #[test]
    fn test_parse_trims_padding() {
        let mut buf = fixed_header(7, 70, 0x99);
        buf[0] = 0x80 | 0b0010_0000; // P set
        buf.extend_from_slice(&[0x5A; 6]);
        buf.extend_from_slice(&[0, 0, 3]); // two pad bytes plus the count

        let pkt = parse(&buf).unwrap();
        assert_eq!(pkt.header.padding_len, 3);
        assert_eq!(&pkt.payload[..], &[0x5A; 6]);
    }

    #[test]
    fn test_parse_rejects_truncated_fields() {
        // CC = 1 but no CSRC bytes follow.
        let mut buf = fixed_header(7, 70, 0x99);
        buf[0] = 0x80 | 1;
        assert_eq!(parse(&buf), Err(RtpParseError::Truncated));

        // Pad count larger than the remaining payload.
        let mut buf = fixed_header(7, 70, 0x99);
        buf[0] = 0x80 | 0b0010_0000;
        buf.extend_from_slice(&[0, 200]);
        assert_eq!(parse(&buf), Err(RtpParseError::Truncated));
    }

    #[test]
    fn test_roundtrip_with_framer() {
        let framer = RtpFramer::new(0x1234);
        let payload = (0u8..160).collect::<Vec<_>>();
        let datagram = framer.frame(0, false, 4321, 0xDEADBEEF, &payload);

        let pkt = parse(&datagram).unwrap();
        assert_eq!(pkt.header.version, 2);
        assert_eq!(pkt.header.csrc_count, 0);
        assert!(!pkt.header.extension);
        assert!(!pkt.header.padding);
        assert_eq!(pkt.header.sequence_number, 4321);
        assert_eq!(pkt.header.timestamp, 0xDEADBEEF);
        assert_eq!(pkt.header.ssrc, 0x1234);
        assert_eq!(&pkt.payload[..], &payload[..]);
    }

    #[test]
    fn test_seq_filter_drops_duplicates_and_reorders() {
        assert!(seq_is_stale(100, 100));
        assert!(seq_is_stale(100, 99));
        assert!(seq_is_stale(1000, 500));
        assert!(!seq_is_stale(100, 101));
    }

    #[test]
    fn test_seq_filter_accepts_wrap() {
        // 0xFFFF -> 0x0000 is a wrap, not a reorder.
        assert!(!seq_is_stale(0xFFFF, 0x0000));
        assert!(!seq_is_stale(0xFFF0, 5));
    }
}
