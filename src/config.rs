use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Negotiated RTP parameters for one media stream.
///
/// The packetization interval is carried as a [`Duration`] so the unit is
/// unambiguous; signaling layers commonly configure 20ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpParams {
    /// Default payload type for outbound audio packets.
    pub payload_type: u8,
    /// Samples carried per packet; the RTP timestamp advances by this much
    /// per non-event packet.
    pub samples_per_packet: u32,
    /// Packetization interval driving the send timer.
    pub ptime: Duration,
}

impl Default for RtpParams {
    fn default() -> Self {
        Self::pcmu()
    }
}

impl RtpParams {
    /// PCMU/8000: 160 samples every 20ms, payload type 0.
    pub fn pcmu() -> Self {
        Self {
            payload_type: 0,
            samples_per_packet: 160,
            ptime: Duration::from_millis(20),
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_samples_per_packet(mut self, samples_per_packet: u32) -> Self {
        self.samples_per_packet = samples_per_packet;
        self
    }

    pub fn with_ptime(mut self, ptime: Duration) -> Self {
        self.ptime = ptime;
        self
    }
}
