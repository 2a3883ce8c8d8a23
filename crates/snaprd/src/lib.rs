//! Snapshot acquisition: a state machine that sources a full snapshot (from
//! local disk or a peer over HTTP), hands it downstream in an ack-gated
//! handshake, then repeats for incremental snapshots until told to shut
//! down.
//!
//! The machine itself never blocks: `advance()` is polled by the caller's
//! event loop and returns at most one [`Emission`] per call. All I/O runs
//! behind the [`Transport`] trait and [`buffer::WriteBehind`], so the
//! driver logic here is synchronous and deterministic under test.

pub mod buffer;
pub mod http;
pub mod local;
pub mod peer;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use http::{HttpEvent, Transport};
use log::{info, warn};
use peer::PeerPinger;
use url::Url;

const COLLECTING_PEERS_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    WaitingForPeers,
    CollectingPeers,
    ReadingFullFile,
    FlushingFullFile,
    FlushingFullFileReset,
    ReadingIncrementalFile,
    FlushingIncrementalFile,
    ReadingFullUrlHttp,
    ReadingFullHttp,
    FlushingFullHttp,
    FlushingFullHttpReset,
    ReadingIncrementalUrlHttp,
    ReadingIncrementalHttp,
    FlushingIncrementalHttp,
    Shutdown,
    /// Terminal: a write-behind error with no safe local recovery (disk
    /// full, I/O failure) was propagated up. The machine stops advancing.
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Emission {
    Data(Vec<u8>),
    CtrlEofFull,
    CtrlDone,
    CtrlResetFull,
    CtrlShutdown,
    /// An unrecoverable error; the caller should surface it and tear down.
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Inbound {
    Ack,
    Malformed,
}

pub struct Config {
    pub snapshots_dir: PathBuf,
    pub do_download: bool,
    pub incremental_snapshot_fetch: bool,
    pub max_local_snapshot_age: u64,
    pub minimum_download_speed_mib: f64,
    pub maximum_download_retry_abort: u32,
    pub n_consumers: u32,
    /// Caps how many times a single fetch attempt follows a redirect before
    /// it's treated as a failed peer, mirroring `fetch`'s own `max_redirects`.
    pub max_redirects: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            snapshots_dir: PathBuf::from("."),
            do_download: true,
            incremental_snapshot_fetch: true,
            max_local_snapshot_age: 0,
            minimum_download_speed_mib: 1.0,
            maximum_download_retry_abort: 5,
            n_consumers: 2,
            max_redirects: 5,
        }
    }
}

#[derive(Default, Debug)]
pub struct Metrics {
    pub bytes_read: u64,
    pub full_snapshots_loaded: u64,
    pub incremental_snapshots_loaded: u64,
    pub resets: u64,
    pub retries: u64,
}

struct FlushGate {
    acks_needed: u32,
    acks_seen: u32,
}

impl FlushGate {
    fn new(n_consumers: u32) -> Self {
        FlushGate { acks_needed: n_consumers, acks_seen: 0 }
    }

    fn ack(&mut self) -> bool {
        self.acks_seen += 1;
        self.acks_seen >= self.acks_needed
    }
}

pub struct Snaprd<T: Transport, P: PeerPinger> {
    cfg: Config,
    transport: T,
    pinger: P,
    state: State,
    metrics: Metrics,
    collecting_since: Option<Instant>,
    buffer: Option<buffer::WriteBehind>,
    gate: Option<FlushGate>,
    retry_count: u32,
    redirect_count: u32,
    full_base_slot: u64,
    local_full_path: Option<PathBuf>,
    local_incremental_path: Option<PathBuf>,
    http_url: Option<Url>,
}

impl<T: Transport, P: PeerPinger> Snaprd<T, P> {
    pub fn new(cfg: Config, transport: T, pinger: P) -> Self {
        Snaprd {
            cfg,
            transport,
            pinger,
            state: State::WaitingForPeers,
            metrics: Metrics::default(),
            collecting_since: None,
            buffer: None,
            gate: None,
            retry_count: 0,
            redirect_count: 0,
            full_base_slot: 0,
            local_full_path: None,
            local_incremental_path: None,
            http_url: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Advances the machine by one step. Returns at most one emission;
    /// callers should keep calling until `None` comes back before sleeping.
    pub fn advance(&mut self, now: Instant) -> Option<Emission> {
        match self.state {
            State::WaitingForPeers => self.tick_waiting_for_peers(now),
            State::CollectingPeers => self.tick_collecting_peers(now),
            State::ReadingFullFile => self.tick_reading_full_file(),
            State::ReadingIncrementalFile => self.tick_reading_incremental_file(),
            State::ReadingFullUrlHttp => self.tick_reading_full_url_http(),
            State::ReadingFullHttp => self.tick_reading_http(true),
            State::ReadingIncrementalUrlHttp => self.tick_reading_incremental_url_http(),
            State::ReadingIncrementalHttp => self.tick_reading_http(false),
            State::FlushingFullFile
            | State::FlushingFullFileReset
            | State::FlushingIncrementalFile
            | State::FlushingFullHttp
            | State::FlushingFullHttpReset
            | State::FlushingIncrementalHttp => None,
            State::Shutdown | State::Failed => None,
        }
    }

    /// Cancels any in-flight transport, moves to the terminal failed state,
    /// and hands back the error for the caller to surface.
    fn fatal(&mut self, msg: impl Into<String>) -> Option<Emission> {
        self.transport.cancel();
        self.state = State::Failed;
        Some(Emission::Fatal(msg.into()))
    }

    /// Mirrors freshly-read bytes into the write-behind buffer and flushes
    /// them, turning a disk-full or I/O error into a fatal emission instead
    /// of discarding it.
    fn push_bytes(&mut self, bytes: &[u8]) -> Option<Emission> {
        let Some(wb) = self.buffer.as_mut() else { return None };
        wb.push(bytes);
        if let Err(e) = wb.flush() {
            return self.fatal(format!("flushing downloaded bytes failed: {e}"));
        }
        None
    }

    /// Finishes the write-behind buffer on a clean end-of-stream and moves
    /// to the matching ack-gated flush state.
    fn on_http_eof(&mut self, full: bool) -> Option<Emission> {
        if let Some(wb) = self.buffer.as_mut() {
            if let Err(e) = wb.finish() {
                return self.fatal(format!("finishing downloaded snapshot failed: {e}"));
            }
        }
        self.retry_count = 0;
        self.gate = Some(FlushGate::new(self.cfg.n_consumers));
        self.state = if full { State::FlushingFullHttp } else { State::FlushingIncrementalHttp };
        Some(if full { Emission::CtrlEofFull } else { Emission::CtrlDone })
    }

    /// A redirect is legal during both URL resolution and an already-
    /// streaming fetch (a peer can re-redirect mid-download); either way
    /// it's bounded by the same counter so a redirect loop can't spin
    /// forever.
    fn on_http_redirect(&mut self, url: Url) -> Option<Emission> {
        self.redirect_count += 1;
        if self.redirect_count > self.cfg.max_redirects {
            warn!("too many redirects resolving {:?}", self.http_url);
            self.metrics.retries += 1;
            if let Some(peer) = self.pinger.best() {
                self.pinger.invalidate(peer, Instant::now());
            }
            self.state = State::WaitingForPeers;
            return None;
        }
        info!("following redirect to {url}");
        self.http_url = Some(url.clone());
        self.transport.start(url);
        None
    }

    fn on_http_error(&mut self, full: bool, msg: String) -> Option<Emission> {
        warn!("download from {:?} failed: {msg}", self.http_url);
        self.metrics.retries += 1;
        self.retry_count += 1;
        if let Some(peer) = self.pinger.best() {
            self.pinger.invalidate(peer, Instant::now());
        }
        if self.retry_count >= self.cfg.maximum_download_retry_abort {
            self.retry_count = 0;
            self.state = State::WaitingForPeers;
            None
        } else {
            self.start_http_fetch(full)
        }
    }

    /// Delivers a downstream signal (ack or malformed-data report) while a
    /// flush is in progress.
    pub fn on_inbound(&mut self, signal: Inbound) -> Option<Emission> {
        match signal {
            Inbound::Ack => self.on_ack(),
            Inbound::Malformed => self.on_malformed(),
        }
    }

    fn on_ack(&mut self) -> Option<Emission> {
        let done = self.gate.as_mut().map(|g| g.ack()).unwrap_or(false);
        if !done {
            return None;
        }
        self.gate = None;
        match self.state {
            State::FlushingFullFile | State::FlushingFullHttp => {
                self.metrics.full_snapshots_loaded += 1;
                if self.cfg.incremental_snapshot_fetch {
                    if self.have_local_source() {
                        self.state = State::ReadingIncrementalFile;
                        None
                    } else {
                        self.start_http_fetch(false)
                    }
                } else {
                    self.state = State::Shutdown;
                    Some(Emission::CtrlShutdown)
                }
            }
            State::FlushingFullFileReset | State::FlushingFullHttpReset => {
                self.metrics.resets += 1;
                self.state = State::CollectingPeers;
                self.collecting_since = None;
                Some(Emission::CtrlResetFull)
            }
            State::FlushingIncrementalFile | State::FlushingIncrementalHttp => {
                self.metrics.incremental_snapshots_loaded += 1;
                self.state = State::Shutdown;
                Some(Emission::CtrlShutdown)
            }
            _ => None,
        }
    }

    /// A malformed-data report during a flush can't unwind the ack quorum
    /// already owed to consumers that received good bytes earlier in the
    /// stream, so the reset is deferred: the state flips to the matching
    /// `*Reset` variant but the in-flight [`FlushGate`] keeps counting the
    /// same acks, and `on_ack` emits `CtrlResetFull` once it's satisfied.
    fn on_malformed(&mut self) -> Option<Emission> {
        match self.state {
            State::FlushingFullFile => {
                self.state = State::FlushingFullFileReset;
                None
            }
            State::FlushingFullHttp => {
                self.state = State::FlushingFullHttpReset;
                None
            }
            State::ReadingFullFile
            | State::ReadingFullUrlHttp
            | State::ReadingFullHttp
            | State::ReadingIncrementalFile
            | State::ReadingIncrementalUrlHttp
            | State::ReadingIncrementalHttp => {
                self.transport.cancel();
                self.metrics.resets += 1;
                self.state = State::CollectingPeers;
                self.collecting_since = None;
                Some(Emission::CtrlResetFull)
            }
            _ => None,
        }
    }

    fn have_local_source(&self) -> bool {
        self.local_full_path.is_some()
    }

    fn tick_waiting_for_peers(&mut self, _now: Instant) -> Option<Emission> {
        if self.pinger.best().is_some() {
            self.state = State::CollectingPeers;
            self.collecting_since = None;
        }
        None
    }

    fn tick_collecting_peers(&mut self, now: Instant) -> Option<Emission> {
        let since = *self.collecting_since.get_or_insert(now);
        let local_hit = local::find_latest(&self.cfg.snapshots_dir, "snapshot-")
            .filter(|(slot, _, _)| self.local_snapshot_is_fresh(*slot, now));

        if let Some((slot, _, path)) = local_hit {
            info!("using local full snapshot at slot {slot}");
            self.full_base_slot = slot;
            self.local_full_path = Some(path);
            self.local_incremental_path =
                local::find_latest(&self.cfg.snapshots_dir, "incremental-snapshot-")
                    .map(|(_, _, p)| p);
            self.state = State::ReadingFullFile;
            return None;
        }

        if now.duration_since(since) < COLLECTING_PEERS_DEADLINE {
            return None;
        }

        if !self.cfg.do_download {
            self.state = State::WaitingForPeers;
            self.collecting_since = None;
            return None;
        }

        match self.pinger.best() {
            Some(_) => self.start_http_fetch(true),
            None => {
                self.state = State::WaitingForPeers;
                self.collecting_since = None;
                None
            }
        }
    }

    /// `max_local_snapshot_age` of `0` means "no local copy is ever stale
    /// enough to skip"; a nonzero value requires a slot number greater than
    /// that many slots behind tip, which callers track outside this crate
    /// and is not yet wired through `advance`.
    fn local_snapshot_is_fresh(&self, _slot: u64, _now: Instant) -> bool {
        self.cfg.max_local_snapshot_age == 0
    }

    fn tick_reading_full_file(&mut self) -> Option<Emission> {
        self.read_local_file(true)
    }

    fn tick_reading_incremental_file(&mut self) -> Option<Emission> {
        self.read_local_file(false)
    }

    fn read_local_file(&mut self, full: bool) -> Option<Emission> {
        let path = if full { self.local_full_path.clone() } else { self.local_incremental_path.clone() };
        let Some(path) = path else {
            self.state = if full { State::ReadingFullUrlHttp } else { State::ReadingIncrementalUrlHttp };
            return None;
        };
        match std::fs::read(&path) {
            Ok(bytes) => {
                self.metrics.bytes_read += bytes.len() as u64;
                let dest_name = path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("snapshot.out"));
                let dest = self.cfg.snapshots_dir.join(dest_name);
                let mut wb = buffer::WriteBehind::new(1 << 16, dest);
                if let Err(e) = wb.open() {
                    return self.fatal(format!("opening write-behind for local snapshot failed: {e}"));
                }
                wb.push(&bytes);
                if let Err(e) = wb.flush() {
                    return self.fatal(format!("flushing local snapshot failed: {e}"));
                }
                if let Err(e) = wb.finish() {
                    return self.fatal(format!("finishing local snapshot write failed: {e}"));
                }
                self.buffer = Some(wb);
                self.gate = Some(FlushGate::new(self.cfg.n_consumers));
                self.state = if full { State::FlushingFullFile } else { State::FlushingIncrementalFile };
                Some(if full { Emission::CtrlEofFull } else { Emission::CtrlDone })
            }
            Err(_) => {
                self.metrics.resets += 1;
                self.state = State::CollectingPeers;
                self.collecting_since = None;
                Some(Emission::CtrlResetFull)
            }
        }
    }

    /// `ReadingFullUrlHttp`/`ReadingIncrementalUrlHttp`: a fetch attempt was
    /// just started and is still being resolved to its final location. A
    /// `Data`/`Eof` here means the peer answered directly with no redirect;
    /// a `Redirect` is followed (bounded by `max_redirects`) before the
    /// machine ever reaches the streaming `ReadingFullHttp`/
    /// `ReadingIncrementalHttp` states.
    fn tick_reading_full_url_http(&mut self) -> Option<Emission> {
        self.tick_url_resolution(true)
    }

    fn tick_reading_incremental_url_http(&mut self) -> Option<Emission> {
        self.tick_url_resolution(false)
    }

    fn tick_url_resolution(&mut self, full: bool) -> Option<Emission> {
        match self.transport.poll() {
            Some(HttpEvent::Data(bytes)) => {
                self.metrics.bytes_read += bytes.len() as u64;
                if let Some(fatal) = self.push_bytes(&bytes) {
                    return Some(fatal);
                }
                self.state = if full { State::ReadingFullHttp } else { State::ReadingIncrementalHttp };
                Some(Emission::Data(bytes))
            }
            Some(HttpEvent::Redirect(url)) => self.on_http_redirect(url),
            Some(HttpEvent::Eof { .. }) => self.on_http_eof(full),
            Some(HttpEvent::Error(msg)) => self.on_http_error(full, msg),
            None => None,
        }
    }

    /// Starts a fresh fetch attempt: resolves the best peer, opens the
    /// write-behind buffer, and hands the URL to the transport. The machine
    /// enters `ReadingFullUrlHttp`/`ReadingIncrementalUrlHttp` to resolve
    /// redirects before it starts treating incoming bytes as the stream.
    fn start_http_fetch(&mut self, full: bool) -> Option<Emission> {
        let Some(peer) = self.pinger.best() else {
            self.state = State::WaitingForPeers;
            return None;
        };
        let path = if full { "/snapshot.tar.zst" } else { "/incremental-snapshot.tar.zst" };
        let url = Url::parse(&format!("http://{}:{}{}", peer.addr, peer.port, path)).ok();
        let Some(url) = url else {
            self.state = State::CollectingPeers;
            self.collecting_since = None;
            return None;
        };
        let dest = self.cfg.snapshots_dir.join(if full { "snapshot.tar.zst" } else { "incremental-snapshot.tar.zst" });
        let mut wb = buffer::WriteBehind::new(1 << 16, dest);
        if let Err(e) = wb.open() {
            return self.fatal(format!(
                "opening write-behind for {} snapshot failed: {e}",
                if full { "full" } else { "incremental" }
            ));
        }
        info!("fetching {} snapshot from {}", if full { "full" } else { "incremental" }, url);
        self.http_url = Some(url.clone());
        self.redirect_count = 0;
        self.transport.start(url);
        self.buffer = Some(wb);
        self.state = if full { State::ReadingFullUrlHttp } else { State::ReadingIncrementalUrlHttp };
        None
    }

    fn tick_reading_http(&mut self, full: bool) -> Option<Emission> {
        match self.transport.poll() {
            Some(HttpEvent::Data(bytes)) => {
                self.metrics.bytes_read += bytes.len() as u64;
                if let Some(fatal) = self.push_bytes(&bytes) {
                    return Some(fatal);
                }
                Some(Emission::Data(bytes))
            }
            Some(HttpEvent::Redirect(url)) => self.on_http_redirect(url),
            Some(HttpEvent::Eof { .. }) => self.on_http_eof(full),
            Some(HttpEvent::Error(msg)) => self.on_http_error(full, msg),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::mock::MockTransport;
    use peer::StaticPeerPinger;
    use std::net::Ipv4Addr;

    fn peer() -> peer::Peer {
        peer::Peer { addr: Ipv4Addr::new(10, 0, 0, 1), port: 8899 }
    }

    fn machine(dir: &std::path::Path) -> Snaprd<MockTransport, StaticPeerPinger> {
        let cfg = Config { snapshots_dir: dir.to_path_buf(), ..Config::default() };
        Snaprd::new(cfg, MockTransport::default(), StaticPeerPinger::new(vec![peer()]))
    }

    #[test]
    fn waits_for_peers_until_one_appears() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config { snapshots_dir: dir.path().to_path_buf(), ..Config::default() };
        let mut sm = Snaprd::new(cfg, MockTransport::default(), StaticPeerPinger::new(vec![]));
        assert_eq!(sm.state(), State::WaitingForPeers);
        sm.advance(Instant::now());
        assert_eq!(sm.state(), State::WaitingForPeers);
    }

    #[test]
    fn full_http_happy_path_then_incremental_then_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = machine(dir.path());
        let t0 = Instant::now();

        sm.advance(t0);
        assert_eq!(sm.state(), State::CollectingPeers);

        sm.advance(t0);
        assert_eq!(sm.state(), State::CollectingPeers);

        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);
        assert_eq!(sm.transport.started.len(), 1);

        sm.transport.push(HttpEvent::Data(b"full-bytes".to_vec()));
        let ev = sm.advance(past_deadline);
        assert_eq!(ev, Some(Emission::Data(b"full-bytes".to_vec())));
        assert_eq!(sm.state(), State::ReadingFullHttp);

        sm.transport.push(HttpEvent::Eof { total_size: Some(10) });
        let ev = sm.advance(past_deadline);
        assert_eq!(ev, Some(Emission::CtrlEofFull));
        assert_eq!(sm.state(), State::FlushingFullHttp);

        assert_eq!(sm.on_inbound(Inbound::Ack), None);
        let ev = sm.on_inbound(Inbound::Ack);
        assert_eq!(ev, None);
        assert_eq!(sm.state(), State::ReadingIncrementalUrlHttp);
        assert_eq!(sm.metrics().full_snapshots_loaded, 1);
        assert_eq!(sm.transport.started.len(), 2);

        sm.transport.push(HttpEvent::Eof { total_size: Some(0) });
        let ev = sm.advance(past_deadline);
        assert_eq!(ev, Some(Emission::CtrlDone));
        assert_eq!(sm.state(), State::FlushingIncrementalHttp);

        sm.on_inbound(Inbound::Ack);
        let ev = sm.on_inbound(Inbound::Ack);
        assert_eq!(ev, Some(Emission::CtrlShutdown));
        assert_eq!(sm.state(), State::Shutdown);
        assert_eq!(sm.metrics().incremental_snapshots_loaded, 1);
    }

    #[test]
    fn malformed_during_full_flush_defers_reset_until_acks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = machine(dir.path());
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        sm.advance(past_deadline);
        sm.advance(past_deadline);
        sm.transport.push(HttpEvent::Eof { total_size: Some(0) });
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::FlushingFullHttp);

        assert_eq!(sm.on_inbound(Inbound::Malformed), None);
        assert_eq!(sm.state(), State::FlushingFullHttpReset);

        assert_eq!(sm.on_inbound(Inbound::Ack), None);
        let ev = sm.on_inbound(Inbound::Ack);
        assert_eq!(ev, Some(Emission::CtrlResetFull));
        assert_eq!(sm.state(), State::CollectingPeers);
        assert_eq!(sm.metrics().resets, 1);
    }

    #[test]
    fn malformed_mid_read_cancels_transport_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = machine(dir.path());
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);

        sm.transport.push(HttpEvent::Data(b"partial".to_vec()));
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullHttp);

        let ev = sm.on_inbound(Inbound::Malformed);
        assert_eq!(ev, Some(Emission::CtrlResetFull));
        assert_eq!(sm.state(), State::CollectingPeers);
        assert_eq!(sm.transport.cancelled, 1);
    }

    #[test]
    fn redirect_is_followed_before_streaming_begins() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = machine(dir.path());
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);
        assert_eq!(sm.transport.started.len(), 1);

        let redirected = Url::parse("http://10.0.0.9:8899/snapshot.tar.zst").unwrap();
        sm.transport.push(HttpEvent::Redirect(redirected.clone()));
        let ev = sm.advance(past_deadline);
        assert_eq!(ev, None);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);
        assert_eq!(sm.transport.started.len(), 2);
        assert_eq!(sm.transport.started.last(), Some(&redirected));

        sm.transport.push(HttpEvent::Data(b"full-bytes".to_vec()));
        let ev = sm.advance(past_deadline);
        assert_eq!(ev, Some(Emission::Data(b"full-bytes".to_vec())));
        assert_eq!(sm.state(), State::ReadingFullHttp);
    }

    #[test]
    fn too_many_redirects_invalidates_peer_and_waits_for_peers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config { snapshots_dir: dir.path().to_path_buf(), max_redirects: 2, ..Config::default() };
        let mut sm = Snaprd::new(cfg, MockTransport::default(), StaticPeerPinger::new(vec![peer()]));
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);

        for n in 0..3u8 {
            let next = Url::parse(&format!("http://10.0.0.{}:8899/snapshot.tar.zst", 10 + n)).unwrap();
            sm.transport.push(HttpEvent::Redirect(next));
            sm.advance(past_deadline);
        }

        assert_eq!(sm.state(), State::WaitingForPeers);
        assert_eq!(sm.metrics().retries, 1);
    }

    #[test]
    fn http_error_retries_until_abort_threshold_then_waits_for_peers() {
        let dir = tempfile::tempdir().unwrap();
        let peers = vec![
            peer::Peer { addr: Ipv4Addr::new(10, 0, 0, 1), port: 8899 },
            peer::Peer { addr: Ipv4Addr::new(10, 0, 0, 2), port: 8899 },
            peer::Peer { addr: Ipv4Addr::new(10, 0, 0, 3), port: 8899 },
        ];
        let cfg = Config { snapshots_dir: dir.path().to_path_buf(), maximum_download_retry_abort: 2, ..Config::default() };
        let mut sm = Snaprd::new(cfg, MockTransport::default(), StaticPeerPinger::new(peers));
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);
        assert_eq!(sm.transport.started.len(), 1);

        sm.transport.push(HttpEvent::Error("connection reset".into()));
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::ReadingFullUrlHttp);
        assert_eq!(sm.transport.started.len(), 2);
        assert_eq!(sm.metrics().retries, 1);

        sm.transport.push(HttpEvent::Error("connection reset".into()));
        sm.advance(past_deadline);
        assert_eq!(sm.state(), State::WaitingForPeers);
        assert_eq!(sm.metrics().retries, 2);
    }

    #[test]
    fn write_behind_open_failure_is_reported_as_fatal() {
        let mut sm = machine(std::path::Path::new("/nonexistent-dir-for-snaprd-test"));
        let t0 = Instant::now();
        let past_deadline = t0 + COLLECTING_PEERS_DEADLINE + Duration::from_millis(1);

        sm.advance(t0);
        sm.advance(t0);
        let ev = sm.advance(past_deadline);
        assert!(matches!(ev, Some(Emission::Fatal(_))));
        assert_eq!(sm.state(), State::Failed);
    }
}
