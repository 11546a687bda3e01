use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{
    spawn_watchdog, CallHandle, CallMedia, MediaSession, StreamState, DEFAULT_INACTIVITY,
};
use crate::dtmf::SharedDtmfQueue;
use crate::recorder::{RecordSink, RecordTo};
use crate::rtp::framer::{RtpWriter, DEFAULT_SSRC};

/// Session that echoes received RTP back to the sender after a configurable
/// packet delay, optionally recording, with DTMF injection in place of the
/// echo. A negative delay makes the session receive-only.
pub struct EchoSession {
    delay: i32,
    write_to: Option<RecordTo>,
    inactivity: Duration,
    dtmf: Option<SharedDtmfQueue>,
    ssrc: u32,
    call: Option<Arc<CallHandle>>,
}

impl EchoSession {
    pub fn new() -> Self {
        Self {
            delay: 0,
            write_to: None,
            inactivity: DEFAULT_INACTIVITY,
            dtmf: None,
            ssrc: DEFAULT_SSRC,
            call: None,
        }
    }

    /// `< 0` receive-only, `0` immediate echo, `n > 0` echo after holding
    /// `n` packets.
    pub fn with_delay(mut self, delay: i32) -> Self {
        self.delay = delay;
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
}

impl Default for EchoSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSession for EchoSession {
    async fn start(&mut self, call: Arc<CallHandle>, media: CallMedia) -> Result<()> {
        self.call = Some(call.clone());
        let didit = Arc::new(AtomicBool::new(false));

        for (index, lsock) in media.lsocks.iter().enumerate() {
            let stream = EchoStream {
                token: call.token(),
                call: call.clone(),
                lsock: lsock.clone(),
                writer: RtpWriter::new(media.ssock(index)).with_ssrc(self.ssrc),
                raddr: media.raddr(index),
                delay: self.delay,
                recorder: self.write_to.as_ref().map(RecordSink::new),
                dtmf: self.dtmf.clone(),
                samples_per_packet: media.rtp.samples_per_packet,
                didit: didit.clone(),
            };
            let task = tokio::spawn(stream.run());
            call.register_cleanup(Box::new(move || task.abort()));
            info!(stream = index, "echo stream started");
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

struct EchoStream {
    token: CancellationToken,
    call: Arc<CallHandle>,
    lsock: Arc<UdpSocket>,
    writer: RtpWriter,
    raddr: Option<SocketAddr>,
    delay: i32,
    recorder: Option<RecordSink>,
    dtmf: Option<SharedDtmfQueue>,
    samples_per_packet: u32,
    didit: Arc<AtomicBool>,
}

impl EchoStream {
    async fn run(mut self) {
        if let Err(e) = self.recv_loop().await {
            error!("echo stream failed: {:?}", e);
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
            let header = &pkt.header;
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write(&pkt.payload, header.sequence_number, header.timestamp)?;
            }

            // DTMF replaces the echo once the inbound timestamp slope is known.
            if let (Some(dtmf), Some(ltdiff)) = (&self.dtmf, state.ltdiff) {
                let injected = dtmf.lock().unwrap().next_packet(
                    header.timestamp,
                    ltdiff,
                    self.samples_per_packet as usize,
                );
                if let Some(event) = injected {
                    if let Some(raddr) = self.raddr {
                        self.writer
                            .send(
                                raddr,
                                event.payload_type,
                                event.marker,
                                header.sequence_number,
                                event.timestamp,
                                &event.payload,
                                event.repeat,
                            )
                            .await?;
                    }
                    continue;
                }
            }

            if self.delay < 0 {
                continue;
            }
            state.delay_buf.push_back(pkt.payload.to_vec());
            while state.delay_buf.len() > self.delay as usize {
                let Some(payload) = state.delay_buf.pop_front() else {
                    break;
                };
                // on hold the buffer still rotates, the send is skipped
                if let Some(raddr) = self.raddr {
                    self.writer
                        .send(
                            raddr,
                            header.payload_type,
                            header.marker,
                            header.sequence_number,
                            header.timestamp,
                            &payload,
                            1,
                        )
                        .await?;
                }
            }
        }
    }
}
