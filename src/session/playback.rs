use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    spawn_watchdog, CallHandle, CallMedia, DoneFn, MediaSession, StreamState, DEFAULT_INACTIVITY,
};
use crate::config::RtpParams;
use crate::dtmf::SharedDtmfQueue;
use crate::recorder::{RecordSink, RecordTo};
use crate::rtp::framer::{RtpWriter, DEFAULT_SSRC};

/// Payload produced by a playback callback: raw bytes, or bytes plus header
/// overrides.
pub enum PayloadChunk {
    Bytes(Vec<u8>),
    WithOverrides {
        bytes: Vec<u8>,
        payload_type: Option<u8>,
        marker: bool,
        timestamp: Option<u32>,
    },
}

pub type PayloadFn = Arc<dyn Fn(u16) -> Option<PayloadChunk> + Send + Sync>;

/// What the sender transmits: raw µ-law samples from a file, or a
/// per-packet callback keyed by the outbound sequence number.
#[derive(Clone)]
pub enum PlaySource {
    File(PathBuf),
    Callback(PayloadFn),
}

impl PlaySource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn callback<F: Fn(u16) -> Option<PayloadChunk> + Send + Sync + 'static>(f: F) -> Self {
        Self::Callback(Arc::new(f))
    }
}

/// Session that receives RTP (optionally recording) and independently
/// transmits RTP from a file or callback at the packetization interval,
/// with DTMF injection.
pub struct PlaybackSession {
    read_from: Option<PlaySource>,
    repeat: i32,
    write_to: Option<RecordTo>,
    inactivity: Duration,
    dtmf: Option<SharedDtmfQueue>,
    ssrc: u32,
    on_done: Option<DoneFn>,
    call: Option<Arc<CallHandle>>,
}

impl PlaybackSession {
    pub fn new() -> Self {
        Self {
            read_from: None,
            repeat: 1,
            write_to: None,
            inactivity: DEFAULT_INACTIVITY,
            dtmf: None,
            ssrc: DEFAULT_SSRC,
            on_done: None,
            call: None,
        }
    }

    pub fn with_read_from(mut self, read_from: PlaySource) -> Self {
        self.read_from = Some(read_from);
        self
    }

    /// `> 0` plays the file that many times; `<= 0` repeats forever.
    pub fn with_repeat(mut self, repeat: i32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_write_to(mut self, write_to: RecordTo) -> Self {
        self.write_to = Some(write_to);
        self
    }

    pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
        self.inactivity = inactivity;
        self
    }

    pub fn with_dtmf(mut self, dtmf: SharedDtmfQueue) -> Self {
        self.dtmf = Some(dtmf);
        self
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = ssrc;
        self
    }

    /// Invoked when playback is exhausted. Defaults to ending the call.
    pub fn with_on_done<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_done = Some(Arc::new(f));
        self
    }
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSession for PlaybackSession {
    async fn start(&mut self, call: Arc<CallHandle>, media: CallMedia) -> Result<()> {
        self.call = Some(call.clone());
        let didit = Arc::new(AtomicBool::new(false));

        for (index, lsock) in media.lsocks.iter().enumerate() {
            let stream = RecvStream {
                token: call.token(),
                call: call.clone(),
                lsock: lsock.clone(),
                recorder: self.write_to.as_ref().map(RecordSink::new),
                didit: didit.clone(),
            };
            let task = tokio::spawn(stream.run());
            call.register_cleanup(Box::new(move || task.abort()));
        }

        if let Some(read_from) = &self.read_from {
            let sender = SendStream {
                token: call.token().child_token(),
                call: call.clone(),
                writer: RtpWriter::new(media.ssock(0)).with_ssrc(self.ssrc),
                raddr: media.raddr(0),
                rtp: media.rtp.clone(),
                source: PlayoutSource::new(read_from.clone(), self.repeat),
                dtmf: self.dtmf.clone(),
                on_done: self.on_done.clone(),
            };
            let timer = sender.token.clone();
            tokio::spawn(sender.run());
            call.register_cleanup(Box::new(move || timer.cancel()));
            info!("playback sender started");
        }

        let watchdog = spawn_watchdog(call.clone(), didit, self.inactivity);
        call.register_cleanup(Box::new(move || watchdog.cancel()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(call) = &self.call {
            call.teardown();
        }
        Ok(())
    }
}

/// Symmetric receive path: record only, no echo.
struct RecvStream {
    token: CancellationToken,
    call: Arc<CallHandle>,
    lsock: Arc<UdpSocket>,
    recorder: Option<RecordSink>,
    didit: Arc<AtomicBool>,
}

impl RecvStream {
    async fn run(mut self) {
        if let Err(e) = self.recv_loop().await {
            error!("receive stream failed: {:?}", e);
            self.call.teardown();
        }
    }

    async fn recv_loop(&mut self) -> Result<()> {
        let mut state = StreamState::new();
        let mut buf = vec![0u8; 2048];
        loop {
            let n = select! {
                _ = self.token.cancelled() => return Ok(()),
                received = self.lsock.recv_from(&mut buf) => received?.0,
            };
            let Some(pkt) = state.ingest(&buf[..n], &self.didit) else {
                continue;
            };
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write(
                    &pkt.payload,
                    pkt.header.sequence_number,
                    pkt.header.timestamp,
                )?;
            }
        }
    }
}

enum PlayoutSource {
    File {
        path: PathBuf,
        file: Option<File>,
        /// Passes left over the file; `-1` plays forever.
        remaining: i32,
    },
    Callback(PayloadFn),
}

impl PlayoutSource {
    fn new(source: PlaySource, repeat: i32) -> Self {
        match source {
            PlaySource::File(path) => Self::File {
                path,
                file: None,
                remaining: if repeat <= 0 { -1 } else { repeat },
            },
            PlaySource::Callback(f) => Self::Callback(f),
        }
    }
}

/// Chunk of exactly `len` bytes, or `None` at EOF.
fn read_chunk(file: &mut File, len: usize) -> Result<Option<Vec<u8>>> {
    let mut chunk = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut chunk[filled..]).context("playback read")?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(chunk))
}

struct SendStream {
    token: CancellationToken,
    call: Arc<CallHandle>,
    writer: RtpWriter,
    raddr: Option<SocketAddr>,
    rtp: RtpParams,
    source: PlayoutSource,
    dtmf: Option<SharedDtmfQueue>,
    on_done: Option<DoneFn>,
}

impl SendStream {
    async fn run(mut self) {
        match self.send_loop().await {
            Ok(true) => {
                debug!("playback exhausted");
                if let Some(on_done) = &self.on_done {
                    on_done();
                } else {
                    self.call.bye();
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!("playback sender failed: {:?}", e);
                self.call.teardown();
            }
        }
    }

    /// Returns `Ok(true)` when playback ran out of payload, `Ok(false)` on
    /// cancellation.
    async fn send_loop(&mut self) -> Result<bool> {
        let mut ticker = tokio::time::interval(self.rtp.ptime);
        let mut wseq: u16 = rand::random();
        let samples_per_packet = self.rtp.samples_per_packet;

        loop {
            select! {
                _ = self.token.cancelled() => return Ok(false),
                _ = ticker.tick() => {}
            }
            wseq = wseq.wrapping_add(1);
            let timestamp = samples_per_packet.wrapping_mul(wseq as u32);

            if let Some(dtmf) = &self.dtmf {
                let injected = dtmf.lock().unwrap().next_packet(
                    timestamp,
                    samples_per_packet,
                    samples_per_packet as usize,
                );
                if let Some(event) = injected {
                    if let Some(raddr) = self.raddr {
                        self.writer
                            .send(
                                raddr,
                                event.payload_type,
                                event.marker,
                                wseq,
                                event.timestamp,
                                &event.payload,
                                event.repeat,
                            )
                            .await?;
                    }
                    continue;
                }
            }

            let (payload, payload_type, marker, ts_override) = match &mut self.source {
                PlayoutSource::File {
                    path,
                    file,
                    remaining,
                } => {
                    let len = samples_per_packet as usize;
                    if file.is_none() {
                        *file = Some(
                            File::open(&path)
                                .with_context(|| format!("playback: open {}", path.display()))?,
                        );
                    }
                    let chunk = match file.as_mut() {
                        Some(f) => read_chunk(f, len)?,
                        None => None,
                    };
                    let chunk = match chunk {
                        Some(chunk) => Some(chunk),
                        None => {
                            // EOF: close, use up one pass, retry from the start
                            *file = None;
                            if *remaining > 0 {
                                *remaining -= 1;
                            }
                            if *remaining == 0 {
                                return Ok(true);
                            }
                            let mut reopened = File::open(&path)
                                .with_context(|| format!("playback: open {}", path.display()))?;
                            let chunk = read_chunk(&mut reopened, len)?;
                            *file = Some(reopened);
                            if chunk.is_none() {
                                // file shorter than one packet
                                *file = None;
                                return Ok(true);
                            }
                            chunk
                        }
                    };
                    match chunk {
                        Some(chunk) => (chunk, None, false, None),
                        None => return Ok(true),
                    }
                }
                PlayoutSource::Callback(f) => match f(wseq) {
                    None => return Ok(true),
                    Some(PayloadChunk::Bytes(bytes)) => {
                        if bytes.is_empty() {
                            return Ok(true);
                        }
                        (bytes, None, false, None)
                    }
                    Some(PayloadChunk::WithOverrides {
                        bytes,
                        payload_type,
                        marker,
                        timestamp,
                    }) => {
                        if bytes.is_empty() {
                            return Ok(true);
                        }
                        (bytes, payload_type, marker, timestamp)
                    }
                },
            };

            if let Some(raddr) = self.raddr {
                self.writer
                    .send(
                        raddr,
                        payload_type.unwrap_or(self.rtp.payload_type),
                        marker,
                        wseq,
                        ts_override.unwrap_or(timestamp),
                        &payload,
                        1,
                    )
                    .await?;
            }
        }
    }
}
