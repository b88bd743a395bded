//! Authentication gate and request/response on top of the framed transport.
//!
//! Until the link is authenticated, only the auth request may leave the agent.
//! After authentication, the auth request is no longer allowed. Gated packets
//! are dropped without an error on the fire-and-forget path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};

use tether_core::error::{Result, TetherError};
use tether_core::packet::Packet;

use crate::obs::AgentMetrics;
use crate::rpc::CorrelationStore;
use crate::transport::framed::FramedTransport;

/// Store entries outlive the caller's deadline by this much; the caller's
/// timer always fires before the sweeper can evict.
const STORE_GRACE: Duration = Duration::from_secs(1);

pub struct TransportManager {
    transport: FramedTransport,
    store: Arc<CorrelationStore>,
    authenticated: AtomicBool,
    default_timeout: Duration,
    metrics: Arc<AgentMetrics>,
}

impl TransportManager {
    pub fn new(
        transport: FramedTransport,
        store: Arc<CorrelationStore>,
        default_timeout: Duration,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            transport,
            store,
            authenticated: AtomicBool::new(false),
            default_timeout,
            metrics,
        }
    }

    pub fn transport(&self) -> &FramedTransport {
        &self.transport
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn connect(&self, addr: &str) -> Result<()> {
        self.transport.connect(addr).await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, v: bool) {
        let prev = self.authenticated.swap(v, Ordering::AcqRel);
        if prev != v {
            tracing::debug!(authenticated = v, "auth gate changed");
        }
    }

    /// `Err(reason)` when the gate refuses `packet` in the current auth state.
    fn admit(&self, packet: &Packet) -> std::result::Result<(), &'static str> {
        match (self.is_authenticated(), packet.is_auth_packet()) {
            (false, false) => Err("not authenticated"),
            (true, true) => Err("already authenticated"),
            _ => Ok(()),
        }
    }

    /// Gate, then enqueue. A gated packet is dropped and reported as success.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if let Err(reason) = self.admit(&packet) {
            tracing::debug!(
                packet_id = %packet.id(),
                action = %packet.action(),
                reason,
                "packet dropped by auth gate"
            );
            self.metrics.gate_drops.inc(&[("reason", reason)]);
            return Ok(());
        }

        let kind = packet.kind().as_str();
        self.transport.send(packet).await?;
        self.metrics.packets_sent.inc(&[("kind", kind)]);
        Ok(())
    }

    /// Fire-and-forget `send` on a background task.
    pub fn send_async(self: &Arc<Self>, packet: Packet) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let id = packet.id().to_owned();
            if let Err(e) = this.send(packet).await {
                tracing::warn!(packet_id = %id, error = %e, "async send failed");
            }
        });
    }

    pub async fn request(&self, packet: Packet) -> Result<Packet> {
        self.request_with_timeout(packet, self.default_timeout).await
    }

    /// Send `packet` and wait for the response correlated to its id.
    ///
    /// A packet the gate would drop fails immediately with `Gated`. On
    /// timeout or send failure the pending entry is removed before returning.
    pub async fn request_with_timeout(&self, packet: Packet, wait: Duration) -> Result<Packet> {
        if let Err(reason) = self.admit(&packet) {
            self.metrics.gate_drops.inc(&[("reason", reason)]);
            return Err(TetherError::Gated(reason));
        }

        let id = packet.id().to_owned();
        let (tx, rx) = oneshot::channel();
        self.store
            .register(
                &id,
                Box::new(move |resp| {
                    let _ = tx.send(resp);
                }),
                wait + STORE_GRACE,
            )
            .await?;

        self.metrics.rpc_inflight.inc(&[]);
        let started = Instant::now();
        let outcome = self.exchange(&id, packet, rx, wait).await;
        self.metrics.rpc_inflight.dec(&[]);

        let label = match &outcome {
            Ok(_) => "ok",
            Err(TetherError::Timeout) => "timeout",
            Err(_) => "error",
        };
        self.metrics.rpc_requests.inc(&[("outcome", label)]);
        self.metrics
            .rpc_latency
            .observe(&[("outcome", label)], started.elapsed());
        outcome
    }

    async fn exchange(
        &self,
        id: &str,
        packet: Packet,
        rx: oneshot::Receiver<Packet>,
        wait: Duration,
    ) -> Result<Packet> {
        if let Err(e) = self.send(packet).await {
            self.store.remove(id).await;
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // entry was swept before the response arrived
            Ok(Err(_)) => Err(TetherError::Timeout),
            Err(_) => {
                self.store.remove(id).await;
                tracing::debug!(request_id = %id, ?wait, "request timed out");
                Err(TetherError::Timeout)
            }
        }
    }

    /// Send `response` correlated to `request`.
    pub async fn respond(&self, request: &Packet, response: Packet) -> Result<()> {
        self.send(response.with_correlation(request.id())).await
    }

    /// Route an inbound response to its waiter.
    pub async fn handle_response(&self, response: Packet) -> Result<()> {
        self.store.resolve(response).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::transport::framed::TransportOptions;
    use tether_core::packet::Fields;

    fn manager() -> TransportManager {
        TransportManager::new(
            FramedTransport::new(TransportOptions::default()),
            Arc::new(CorrelationStore::new()),
            Duration::from_millis(50),
            Arc::new(AgentMetrics::default()),
        )
    }

    #[tokio::test]
    async fn gate_drops_non_auth_packets_before_auth() {
        let m = manager();
        // not connected, but the gate decides first
        m.send(Packet::event("status", Fields::new())).await.unwrap();
        assert_eq!(m.metrics.gate_drops.get(&[("reason", "not authenticated")]), 1);
        assert_eq!(m.transport.stats().frames_written(), 0);
    }

    #[tokio::test]
    async fn gate_drops_auth_packet_after_auth() {
        let m = manager();
        m.set_authenticated(true);
        m.send(Packet::auth_request("t")).await.unwrap();
        assert_eq!(m.metrics.gate_drops.get(&[("reason", "already authenticated")]), 1);
    }

    #[tokio::test]
    async fn gated_request_fails_fast() {
        let m = manager();
        let err = m
            .request(Packet::request("plugin.ping", Fields::new()))
            .await
            .unwrap_err();
        assert_eq!(err, TetherError::Gated("not authenticated"));
        assert!(m.store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_send_leaves_no_pending_entry() {
        let m = manager();
        let err = m.request(Packet::auth_request("t")).await.unwrap_err();
        assert_eq!(err, TetherError::NotConnected);
        assert!(m.store.is_empty().await);
        assert_eq!(m.metrics.rpc_requests.get(&[("outcome", "error")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_is_removed_from_store() {
        let m = manager();
        let _rx = m.transport.install_stalled_session();
        m.set_authenticated(true);

        let req = Packet::request("plugin.ping", Fields::new());
        let id = req.id().to_owned();
        let err = m
            .request_with_timeout(req, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, TetherError::Timeout);
        assert!(!m.store.contains(&id).await);

        // a late response finds nothing
        let late = Packet::new(tether_core::PacketKind::Rpc, None, None).with_correlation(&id);
        assert_eq!(
            m.handle_response(late).await.unwrap_err(),
            TetherError::CorrelationNotFound(id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_expires_before_store_entry() {
        let m = manager();
        let _rx = m.transport.install_stalled_session();
        m.set_authenticated(true);

        let req = Packet::request("plugin.ping", Fields::new());
        let id = req.id().to_owned();
        let pending = m.request_with_timeout(req, Duration::from_millis(100));
        tokio::pin!(pending);

        tokio::select! {
            biased;
            _ = &mut pending => panic!("request finished before its deadline"),
            _ = tokio::time::sleep(Duration::from_millis(99)) => {}
        }
        tokio::time::advance(Duration::from_millis(2)).await;

        // past the caller's deadline, the sweeper still leaves the entry alone
        assert_eq!(m.store.sweep().await, 0);
        assert!(m.store.contains(&id).await);

        assert_eq!(pending.await.unwrap_err(), TetherError::Timeout);
        assert!(!m.store.contains(&id).await);
        assert_eq!(m.metrics.rpc_requests.get(&[("outcome", "timeout")]), 1);
    }
}
