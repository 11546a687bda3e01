use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::tone::ToneGenerator;

// DTMF frequencies according to ITU-T Q.23
const DTMF_FREQUENCIES: [(char, (u32, u32)); 16] = [
    ('1', (697, 1209)),
    ('2', (697, 1336)),
    ('3', (697, 1477)),
    ('4', (770, 1209)),
    ('5', (770, 1336)),
    ('6', (770, 1477)),
    ('7', (852, 1209)),
    ('8', (852, 1336)),
    ('9', (852, 1477)),
    ('*', (941, 1209)),
    ('0', (941, 1336)),
    ('#', (941, 1477)),
    ('A', (697, 1633)),
    ('B', (770, 1633)),
    ('C', (852, 1633)),
    ('D', (941, 1633)),
];

pub const NO_PAYLOAD_SUPPORT: &str = "neither rfc2833 nor audio are supported by peer";

/// RFC 2833 event code for a DTMF digit.
pub fn event_code(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(digit as u8 - b'A' + 12),
        _ => None,
    }
}

/// Canonical (low, high) frequency pair for a DTMF digit.
pub fn frequencies(digit: char) -> Option<(u32, u32)> {
    DTMF_FREQUENCIES
        .iter()
        .find(|(d, _)| *d == digit)
        .map(|(_, pair)| *pair)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfOutcome {
    Completed,
    Failed(&'static str),
}

pub type DtmfDoneFn = Arc<dyn Fn(DtmfOutcome) + Send + Sync>;

/// One queued DTMF emission. A `None` digit with an audio payload type
/// negotiated emits silence for the duration.
pub struct DtmfEvent {
    pub digit: Option<char>,
    pub volume: u8,
    pub duration: Duration,
    pub rfc2833_type: Option<u8>,
    pub audio_type: Option<u8>,
    on_done: Option<DtmfDoneFn>,
    started: Option<(u32, Instant)>,
    tone: Option<ToneGenerator>,
}

impl DtmfEvent {
    pub fn new(digit: Option<char>) -> Self {
        Self {
            digit,
            volume: 10,
            duration: Duration::from_millis(100),
            rfc2833_type: None,
            audio_type: None,
            on_done: None,
            started: None,
            tone: None,
        }
    }

    pub fn with_volume(mut self, volume: u8) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_rfc2833_type(mut self, payload_type: u8) -> Self {
        self.rfc2833_type = Some(payload_type);
        self
    }

    pub fn with_audio_type(mut self, payload_type: u8) -> Self {
        self.audio_type = Some(payload_type);
        self
    }

    pub fn with_on_done<F: Fn(DtmfOutcome) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_done = Some(Arc::new(f));
        self
    }

    fn finish(&self, outcome: DtmfOutcome) {
        if let Some(on_done) = &self.on_done {
            on_done(outcome);
        }
    }
}

/// One packet the engine wants emitted in place of the regular payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfPacket {
    pub payload: Vec<u8>,
    pub payload_type: u8,
    pub marker: bool,
    pub timestamp: u32,
    pub repeat: usize,
}

pub type SharedDtmfQueue = Arc<Mutex<DtmfQueue>>;

/// Per-session FIFO of pending DTMF events, consulted once per send
/// opportunity. Only the head event is touched; it is popped when its
/// duration elapses or the whole queue fails.
#[derive(Default)]
pub struct DtmfQueue {
    events: VecDeque<DtmfEvent>,
}

impl DtmfQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedDtmfQueue {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn push(&mut self, event: DtmfEvent) {
        self.events.push_back(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Decide the packet for this send opportunity. `now_timestamp` is the
    /// nominal outbound RTP timestamp and `tdiff` the per-packet timestamp
    /// delta. Returns `None` when the caller should emit its regular
    /// payload instead.
    pub fn next_packet(
        &mut self,
        now_timestamp: u32,
        tdiff: u32,
        samples_per_packet: usize,
    ) -> Option<DtmfPacket> {
        let event = self.events.front_mut()?;

        let (start_timestamp, started_at) = *event
            .started
            .get_or_insert_with(|| (now_timestamp, Instant::now()));
        let event_end = started_at.elapsed() >= event.duration;
        let event_tdiff = now_timestamp.wrapping_sub(start_timestamp).wrapping_add(tdiff);

        let packet = if let Some(payload_type) = event.rfc2833_type {
            let code = event.digit.and_then(event_code).unwrap_or(0);
            let payload = vec![
                code,
                ((event_end as u8) << 7) | (event.volume & 0x3F),
                (event_tdiff >> 8) as u8,
                event_tdiff as u8,
            ];
            DtmfPacket {
                payload,
                payload_type,
                marker: true,
                // every packet of the event shares its start timestamp
                timestamp: start_timestamp,
                repeat: if event_end { 3 } else { 1 },
            }
        } else if let Some(payload_type) = event.audio_type {
            let digit = event.digit;
            let volume = event.volume;
            let tone = event
                .tone
                .get_or_insert_with(|| match digit.and_then(frequencies) {
                    Some((low, high)) => ToneGenerator::dual(low, high, volume),
                    None => ToneGenerator::silence(),
                });
            DtmfPacket {
                payload: tone.generate(samples_per_packet),
                payload_type,
                marker: false,
                timestamp: now_timestamp,
                repeat: 1,
            }
        } else {
            warn!("dtmf: {}", NO_PAYLOAD_SUPPORT);
            for event in self.events.drain(..) {
                event.finish(DtmfOutcome::Failed(NO_PAYLOAD_SUPPORT));
            }
            return None;
        };

        if event_end {
            if let Some(event) = self.events.pop_front() {
                debug!(digit = ?event.digit, "dtmf event finished");
                event.finish(DtmfOutcome::Completed);
            }
        }
        Some(packet)
    }
}
