pub mod framer;
pub mod packet;

pub use framer::{RtpFramer, RtpWriter, DEFAULT_SSRC};
pub use packet::{parse, seq_is_stale, RtpHeader, RtpPacket, RtpParseError};
