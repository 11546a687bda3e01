use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::packet::MIN_HEADER_LEN;

/// SSRC stamped on outbound packets unless overridden.
pub const DEFAULT_SSRC: u32 = 0x1234;

/// Builds outbound RTP datagrams: fixed 12-byte header, no CSRCs, no
/// extension, no padding. The marker bit doubles as the telephony-event
/// flag on RFC 2833 packets.
#[derive(Debug, Clone, Copy)]
pub struct RtpFramer {
    ssrc: u32,
}

impl Default for RtpFramer {
    fn default() -> Self {
        Self::new(DEFAULT_SSRC)
    }
}

impl RtpFramer {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn frame(
        &self,
        payload_type: u8,
        marker: bool,
        seq: u16,
        timestamp: u32,
        payload: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_HEADER_LEN + payload.len());
        buf.put_u8(0x80); // version 2, P=0, X=0, CC=0
        buf.put_u8((payload_type & 0x7F) | ((marker as u8) << 7));
        buf.put_u16(seq);
        buf.put_u32(timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Frames and transmits RTP packets on one send socket.
pub struct RtpWriter {
    socket: Arc<UdpSocket>,
    framer: RtpFramer,
}

impl RtpWriter {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            framer: RtpFramer::default(),
        }
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.framer = RtpFramer::new(ssrc);
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.framer.ssrc()
    }

    /// Send one framed packet `repeat` times (identical header and payload
    /// on every copy; RFC 2833 end packets use 3 to tolerate loss).
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        raddr: SocketAddr,
        payload_type: u8,
        marker: bool,
        seq: u16,
        timestamp: u32,
        payload: &[u8],
        repeat: usize,
    ) -> Result<()> {
        let datagram = self.framer.frame(payload_type, marker, seq, timestamp, payload);
        for _ in 0..repeat.max(1) {
            self.socket
                .send_to(&datagram, raddr)
                .await
                .with_context(|| format!("rtp send to {}", raddr))?;
        }
        Ok(())
    }
}
