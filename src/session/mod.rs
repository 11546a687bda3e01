use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RtpParams;
use crate::rtp::packet::{self, RtpPacket};

pub mod echo;
pub mod playback;

pub use echo::EchoSession;
pub use playback::{PayloadChunk, PlaySource, PlaybackSession};

/// Calls with no accepted inbound packet for this long are ended.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_secs(10);

pub type ByeFn = Arc<dyn Fn() + Send + Sync>;
pub type CleanupFn = Box<dyn FnOnce() + Send>;
pub type DoneFn = Arc<dyn Fn() + Send + Sync>;

/// Handle to the owning call: lets media end the call and gives the call a
/// LIFO cleanup list to tear the media down with.
pub struct CallHandle {
    token: CancellationToken,
    on_bye: ByeFn,
    cleanups: Mutex<Vec<CleanupFn>>,
}

impl CallHandle {
    pub fn new<F: Fn() + Send + Sync + 'static>(on_bye: F) -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            on_bye: Arc::new(on_bye),
            cleanups: Mutex::new(Vec::new()),
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register_cleanup(&self, f: CleanupFn) {
        self.cleanups.lock().unwrap().push(f);
    }

    /// End the call: notify signaling, then tear the media down.
    pub fn bye(&self) {
        (self.on_bye)();
        self.teardown();
    }

    /// Cancel session tasks and run registered cleanups in LIFO order.
    /// Idempotent: each cleanup runs at most once.
    pub fn teardown(&self) {
        self.token.cancel();
        let mut cleanups = {
            let mut slot = self.cleanups.lock().unwrap();
            std::mem::take(&mut *slot)
        };
        while let Some(cleanup) = cleanups.pop() {
            cleanup();
        }
    }
}

/// Sockets and addressing negotiated by signaling for one call.
#[derive(Clone)]
pub struct CallMedia {
    /// Local receive sockets, one per stream.
    pub lsocks: Vec<Arc<UdpSocket>>,
    /// Local send sockets; defaults to `lsocks`.
    pub ssocks: Option<Vec<Arc<UdpSocket>>>,
    /// Remote address per stream; `None` means the call is on hold.
    pub raddrs: Vec<Option<SocketAddr>>,
    pub rtp: RtpParams,
}

impl CallMedia {
    pub fn single(lsock: Arc<UdpSocket>, raddr: Option<SocketAddr>, rtp: RtpParams) -> Self {
        Self {
            lsocks: vec![lsock],
            ssocks: None,
            raddrs: vec![raddr],
            rtp,
        }
    }

    pub fn ssock(&self, stream: usize) -> Arc<UdpSocket> {
        self.ssocks
            .as_ref()
            .and_then(|socks| socks.get(stream))
            .unwrap_or(&self.lsocks[stream])
            .clone()
    }

    pub fn raddr(&self, stream: usize) -> Option<SocketAddr> {
        self.raddrs.get(stream).copied().flatten()
    }
}

/// A media session bound to one call's sockets.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Bind to the call's media sockets and spawn the session tasks.
    async fn start(&mut self, call: Arc<CallHandle>, media: CallMedia) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Receive-side state for one socket pair.
pub(crate) struct StreamState {
    /// Last accepted inbound sequence number.
    pub rseq: Option<u16>,
    /// Last accepted inbound timestamp.
    pub rts: Option<u32>,
    /// Inferred timestamp-per-packet slope of the inbound stream.
    pub ltdiff: Option<u32>,
    /// Held payloads for delayed echo.
    pub delay_buf: VecDeque<Vec<u8>>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            rseq: None,
            rts: None,
            ltdiff: None,
            delay_buf: VecDeque::new(),
        }
    }

    /// Parse one datagram and run it through the stale filter and slope
    /// inference. Returns `None` for anything to silently drop; `didit` is
    /// touched only for accepted packets.
    pub fn ingest(&mut self, buf: &[u8], didit: &AtomicBool) -> Option<RtpPacket> {
        let pkt = match packet::parse(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("dropping inbound datagram: {}", e);
                return None;
            }
        };
        let seq = pkt.header.sequence_number;
        let ts = pkt.header.timestamp;

        if let Some(prev) = self.rseq {
            if packet::seq_is_stale(prev, seq) {
                debug!(prev, seq, "dropping stale packet");
                return None;
            }
        }
        if let (Some(prev_seq), Some(prev_ts)) = (self.rseq, self.rts) {
            let dseq = seq.wrapping_sub(prev_seq) as u32;
            if dseq > 0 {
                self.ltdiff = Some(ts.wrapping_sub(prev_ts) / dseq);
            }
        }
        self.rseq = Some(seq);
        self.rts = Some(ts);
        didit.store(true, Ordering::Relaxed);
        Some(pkt)
    }
}

/// Spawn the inactivity watchdog: every `period`, end the call unless an
/// accepted inbound packet arrived since the previous check. Returns the
/// token that cancels the watchdog alone.
pub(crate) fn spawn_watchdog(
    call: Arc<CallHandle>,
    didit: Arc<AtomicBool>,
    period: Duration,
) -> CancellationToken {
    let token = call.token().child_token();
    let watchdog = token.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // the immediate first tick
        loop {
            select! {
                _ = watchdog.cancelled() => break,
                _ = ticker.tick() => {
                    if !didit.swap(false, Ordering::Relaxed) {
                        info!("rtp inactivity, ending call");
                        call.bye();
                        break;
                    }
                }
            }
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::framer::RtpFramer;
    use std::sync::atomic::AtomicUsize;

    fn datagram(seq: u16, ts: u32) -> Vec<u8> {
        RtpFramer::new(0x99).frame(0, false, seq, ts, &[0xAB; 4]).to_vec()
    }

    #[test]
    fn test_ingest_tracks_slope() {
        let didit = AtomicBool::new(false);
        let mut state = StreamState::new();

        assert!(state.ingest(&datagram(100, 1000), &didit).is_some());
        assert_eq!(state.ltdiff, None);
        assert!(state.ingest(&datagram(101, 1160), &didit).is_some());
        assert_eq!(state.ltdiff, Some(160));
        // a gap still infers the per-packet slope
        assert!(state.ingest(&datagram(104, 1640), &didit).is_some());
        assert_eq!(state.ltdiff, Some(160));
        assert!(didit.load(Ordering::Relaxed));
    }

    #[test]
    fn test_ingest_drops_stale_and_malformed() {
        let didit = AtomicBool::new(false);
        let mut state = StreamState::new();

        assert!(state.ingest(&[], &didit).is_none());
        assert!(!didit.load(Ordering::Relaxed));

        assert!(state.ingest(&datagram(100, 1000), &didit).is_some());
        didit.store(false, Ordering::Relaxed);
        assert!(state.ingest(&datagram(100, 1000), &didit).is_none());
        assert!(state.ingest(&datagram(99, 840), &didit).is_none());
        assert!(!didit.load(Ordering::Relaxed));
        assert_eq!(state.rseq, Some(100));
    }

    #[test]
    fn test_ingest_accepts_seq_wrap() {
        let didit = AtomicBool::new(false);
        let mut state = StreamState::new();
        assert!(state.ingest(&datagram(0xFFFF, 1000), &didit).is_some());
        assert!(state.ingest(&datagram(0x0000, 1160), &didit).is_some());
        assert_eq!(state.rseq, Some(0));
        assert_eq!(state.ltdiff, Some(160));
    }

    #[test]
    fn test_cleanups_run_lifo_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let call = CallHandle::new(|| {});
        for tag in 1..=3 {
            let order = order.clone();
            call.register_cleanup(Box::new(move || order.lock().unwrap().push(tag)));
        }

        call.teardown();
        call.teardown();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert!(call.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_watchdog_fires_bye_once() {
        let byes = Arc::new(AtomicUsize::new(0));
        let byes_clone = byes.clone();
        let call = CallHandle::new(move || {
            byes_clone.fetch_add(1, Ordering::SeqCst);
        });
        let didit = Arc::new(AtomicBool::new(false));

        spawn_watchdog(call.clone(), didit, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(byes.load(Ordering::SeqCst), 1);
        assert!(call.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_watchdog_spares_active_stream() {
        let byes = Arc::new(AtomicUsize::new(0));
        let byes_clone = byes.clone();
        let call = CallHandle::new(move || {
            byes_clone.fetch_add(1, Ordering::SeqCst);
        });
        let didit = Arc::new(AtomicBool::new(false));

        spawn_watchdog(call.clone(), didit.clone(), Duration::from_millis(60));
        for _ in 0..5 {
            didit.store(true, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(byes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(byes.load(Ordering::SeqCst), 1);
    }
}
