//! Framed TCP transport.
//!
//! Responsibilities:
//! - Own one socket at a time (a "session"), with a reader and a writer task
//! - Bounded outgoing queue: `send` waits at most `offer_timeout`, then drops
//! - Length-prefixed frames in both directions (see `tether_core::protocol`)
//! - Report every failure through the listener, never into caller tasks
//!
//! An idle read timeout is not a failure; the reader simply polls again.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use tether_core::error::{Result, TetherError};
use tether_core::packet::Packet;
use tether_core::protocol::{decode_frame, decode_packet, frame_packet, DEFAULT_MAX_FRAME_BYTES};

use crate::config::AgentConfig;
use crate::transport::listener::TransportListener;
use crate::transport::stats::{TransportSnapshot, TransportStats};

const READ_CHUNK: usize = 8 * 1024;

/// Socket-level state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// Tunables for one transport instance.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
    pub offer_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            queue_capacity: 5000,
            offer_timeout: Duration::from_millis(200),
        }
    }
}

impl From<&AgentConfig> for TransportOptions {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            connect_timeout: cfg.backend.connect_timeout(),
            read_timeout: cfg.backend.read_timeout(),
            max_frame_bytes: cfg.backend.max_frame_bytes,
            queue_capacity: cfg.queue.capacity,
            offer_timeout: cfg.queue.offer_timeout(),
        }
    }
}

/// One connected socket: the queue feeding its writer and the stop signal for both tasks.
struct Session {
    id: u64,
    tx: mpsc::Sender<Packet>,
    stop: watch::Sender<bool>,
}

struct Inner {
    opts: TransportOptions,
    state: AtomicU8,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    stats: TransportStats,
}

/// Cheap to clone; all clones drive the same socket.
#[derive(Clone)]
pub struct FramedTransport {
    inner: Arc<Inner>,
}

impl FramedTransport {
    pub fn new(opts: TransportOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                opts,
                state: AtomicU8::new(LinkState::Disconnected as u8),
                listener: RwLock::new(None),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
                stats: TransportStats::default(),
            }),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        if let Ok(mut slot) = self.inner.listener.write() {
            *slot = Some(listener);
        }
    }

    pub fn clear_listener(&self) {
        if let Ok(mut slot) = self.inner.listener.write() {
            *slot = None;
        }
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.inner.listener.read().ok().and_then(|slot| slot.clone())
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.opts
    }

    pub fn stats(&self) -> &TransportStats {
        &self.inner.stats
    }

    /// Packets currently waiting for the writer.
    pub fn queue_depth(&self) -> usize {
        self.with_session(|s| s.tx.max_capacity() - s.tx.capacity())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            connected: self.is_connected(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.inner.opts.queue_capacity,
            dropped_total: self.inner.stats.dropped_total(),
            frames_written: self.inner.stats.frames_written(),
            frames_read: self.inner.stats.frames_read(),
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Option<T> {
        let guard = self.inner.session.lock().ok()?;
        guard.as_ref().map(f)
    }

    /// Open the socket and start the reader and writer.
    ///
    /// No-op while another connect is in flight or a session is live.
    /// Failures are reported to the listener and also returned so the
    /// caller can schedule its backoff.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                LinkState::Disconnected as u8,
                LinkState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(%addr, state = ?self.state(), "connect ignored");
            return Ok(());
        }

        let stream = match timeout(self.inner.opts.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.connect_failed(addr, TetherError::from(e)).await,
            Err(_) => {
                return self
                    .connect_failed(addr, TetherError::Connection("connect timed out".into()))
                    .await
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }

        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.inner.opts.queue_capacity.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        let installed = match self.inner.session.lock() {
            Ok(mut slot) => {
                *slot = Some(Session { id, tx, stop });
                true
            }
            Err(_) => false,
        };
        if !installed {
            return self
                .connect_failed(addr, TetherError::Internal("session lock poisoned".into()))
                .await;
        }
        self.inner
            .state
            .store(LinkState::Connected as u8, Ordering::Release);
        tracing::info!(%addr, session = id, "transport connected");

        tokio::spawn(self.clone().write_loop(id, wr, rx, stop_rx.clone()));

        if let Some(l) = self.listener() {
            l.on_connect().await;
        }

        tokio::spawn(self.clone().read_loop(id, rd, stop_rx));
        Ok(())
    }

    async fn connect_failed(&self, addr: &str, err: TetherError) -> Result<()> {
        self.inner
            .state
            .store(LinkState::Disconnected as u8, Ordering::Release);
        tracing::warn!(%addr, error = %err, "transport connect failed");
        self.notify_error(&err).await;
        Err(err)
    }

    /// Tear down the live session, if any. Idempotent.
    pub async fn disconnect(&self) {
        self.close_session(None).await;
    }

    /// Close the session `only` (or whichever is live when `None`).
    /// `on_disconnect` fires once per session because the slot is taken under the lock.
    async fn close_session(&self, only: Option<u64>) {
        let taken = match self.inner.session.lock() {
            Ok(mut slot) => match slot.as_ref() {
                Some(s) if only.map_or(true, |id| id == s.id) => slot.take(),
                _ => None,
            },
            Err(_) => None,
        };
        let Some(session) = taken else { return };

        let _ = session.stop.send(true);
        self.inner
            .state
            .store(LinkState::Disconnected as u8, Ordering::Release);
        let discarded = session.tx.max_capacity() - session.tx.capacity();
        drop(session);
        tracing::info!(discarded, "transport disconnected");

        if let Some(l) = self.listener() {
            l.on_disconnect().await;
        }
    }

    /// Enqueue a packet for the writer, waiting at most the offer timeout.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let Some(tx) = self.with_session(|s| s.tx.clone()) else {
            let err = TetherError::NotConnected;
            self.notify_error(&err).await;
            return Err(err);
        };

        match tx.send_timeout(packet, self.inner.opts.offer_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(p)) => {
                self.inner.stats.record_dropped();
                tracing::warn!(
                    packet_id = %p.id(),
                    action = %p.action(),
                    dropped_total = self.inner.stats.dropped_total(),
                    "outgoing queue saturated; packet dropped"
                );
                let err = TetherError::QueueSaturated;
                self.notify_error(&err).await;
                Err(err)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                let err = TetherError::NotConnected;
                self.notify_error(&err).await;
                Err(err)
            }
        }
    }

    async fn notify_error(&self, err: &TetherError) {
        if let Some(l) = self.listener() {
            l.on_error(err).await;
        }
    }

    async fn dispatch(&self, packet: Packet) {
        if let Some(l) = self.listener() {
            l.on_packet(packet).await;
        }
    }

    async fn read_loop(self, id: u64, mut rd: OwnedReadHalf, mut stop: watch::Receiver<bool>) {
        let max = self.inner.opts.max_frame_bytes;
        let idle = self.inner.opts.read_timeout;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        let failure = 'session: loop {
            loop {
                match decode_frame(&mut buf, max) {
                    Ok(Some(body)) => {
                        self.inner.stats.record_read();
                        match decode_packet(&body) {
                            Ok(packet) => self.dispatch(packet).await,
                            // framing is intact, so only this frame is rejected
                            Err(e) => {
                                tracing::warn!(session = id, error = %e, "rejecting undecodable frame");
                                self.notify_error(&e).await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'session Some(e),
                }
            }

            tokio::select! {
                biased;
                _ = stop.changed() => break None,
                res = timeout(idle, rd.read_buf(&mut buf)) => match res {
                    Err(_) => {
                        tracing::trace!(session = id, "read timeout (connection idle)");
                    }
                    Ok(Ok(0)) => break Some(TetherError::Connection("closed by peer".into())),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => break Some(TetherError::from(e)),
                },
            }
        };

        if let Some(e) = failure {
            tracing::warn!(session = id, error = %e, "reader stopped");
            self.notify_error(&e).await;
        }
        self.close_session(Some(id)).await;
    }

    async fn write_loop(
        self,
        id: u64,
        mut wr: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Packet>,
        mut stop: watch::Receiver<bool>,
    ) {
        let max = self.inner.opts.max_frame_bytes;

        // stop is polled first: a closed session never writes what is still queued
        let failure = loop {
            let packet = tokio::select! {
                biased;
                _ = stop.changed() => break None,
                next = rx.recv() => match next {
                    Some(p) => p,
                    None => break None,
                },
            };

            let frame = match frame_packet(&packet, max) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(session = id, packet_id = %packet.id(), error = %e, "packet not encodable; dropped");
                    self.notify_error(&e).await;
                    continue;
                }
            };

            if *stop.borrow() {
                break None;
            }
            let written = tokio::select! {
                biased;
                _ = stop.changed() => break None,
                res = async {
                    wr.write_all(&frame).await?;
                    wr.flush().await
                } => res,
            };
            match written {
                Ok(()) => self.inner.stats.record_written(),
                Err(e) => break Some(TetherError::from(e)),
            }
        };

        if let Some(e) = failure {
            tracing::warn!(session = id, error = %e, "writer stopped");
            self.notify_error(&e).await;
            self.close_session(Some(id)).await;
        }
    }

    /// Install a session whose queue nobody drains.
    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub(crate) fn install_stalled_session(&self) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(self.inner.opts.queue_capacity);
        let (stop, _) = watch::channel(false);
        *self.inner.session.lock().unwrap() = Some(Session { id: 0, tx, stop });
        self.inner
            .state
            .store(LinkState::Connected as u8, Ordering::Release);
        rx
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tether_core::packet::Fields;
    use tokio::net::TcpListener;

    fn opts(capacity: usize, offer_ms: u64) -> TransportOptions {
        TransportOptions {
            queue_capacity: capacity,
            offer_timeout: Duration::from_millis(offer_ms),
            ..TransportOptions::default()
        }
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let t = FramedTransport::new(opts(4, 10));
        let err = t.send(Packet::event("x", Fields::new())).await.unwrap_err();
        assert_eq!(err, TetherError::NotConnected);
        assert_eq!(t.stats().dropped_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_drops_one_count_per_packet() {
        let t = FramedTransport::new(opts(2, 200));
        let _rx = t.install_stalled_session();

        t.send(Packet::event("a", Fields::new())).await.unwrap();
        t.send(Packet::event("b", Fields::new())).await.unwrap();
        assert_eq!(t.queue_depth(), 2);

        for n in 1..=3u64 {
            let started = tokio::time::Instant::now();
            let err = t.send(Packet::event("c", Fields::new())).await.unwrap_err();
            assert_eq!(err, TetherError::QueueSaturated);
            assert!(started.elapsed() <= Duration::from_millis(250));
            assert_eq!(t.stats().dropped_total(), n);
        }
        assert_eq!(t.queue_depth(), 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_discards_queue() {
        let t = FramedTransport::new(opts(4, 10));
        let _rx = t.install_stalled_session();
        t.send(Packet::event("a", Fields::new())).await.unwrap();

        t.disconnect().await;
        t.disconnect().await;
        assert_eq!(t.state(), LinkState::Disconnected);
        assert_eq!(t.queue_depth(), 0);
    }

    #[tokio::test]
    async fn disconnect_discards_queued_packets_without_writing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let t = FramedTransport::new(opts(64, 10));

        t.connect(&addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        for i in 0..20 {
            t.send(Packet::event(&format!("queued.{i}"), Fields::new()))
                .await
                .unwrap();
        }
        t.disconnect().await;

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty(), "{} bytes written after disconnect", received.len());
        assert_eq!(t.stats().frames_written(), 0);
    }
}
