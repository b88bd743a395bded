use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tether_core::error::{Result, TetherError};
use tether_core::packet::Packet;

/// Invoked at most once, with the matching response.
pub type ResponseCallback = Box<dyn FnOnce(Packet) + Send + Sync + 'static>;

struct PendingRequest {
    callback: ResponseCallback,
    timeout: Duration,
    created_at: Instant,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.timeout
    }
}

/// Table of in-flight requests keyed by request packet id.
///
/// Every path that touches the table removes from it, so all of them take the
/// write lock. Callbacks always run after the lock is released.
#[derive(Default)]
pub struct CorrelationStore {
    pending: RwLock<HashMap<String, PendingRequest>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request. A live entry with the same id is kept and
    /// the new registration is rejected.
    pub async fn register(
        &self,
        request_id: &str,
        callback: ResponseCallback,
        timeout: Duration,
    ) -> Result<()> {
        let mut pending = self.pending.write().await;
        if pending.contains_key(request_id) {
            return Err(TetherError::DuplicateCorrelation(request_id.to_owned()));
        }
        pending.insert(
            request_id.to_owned(),
            PendingRequest {
                callback,
                timeout,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Hand `response` to the handler registered for its correlation id.
    pub async fn resolve(&self, response: Packet) -> Result<()> {
        let Some(cid) = response.correlation_id().map(str::to_owned) else {
            return Err(TetherError::CorrelationNotFound(String::new()));
        };

        let entry = self.pending.write().await.remove(&cid);
        match entry {
            Some(p) => {
                (p.callback)(response);
                Ok(())
            }
            None => Err(TetherError::CorrelationNotFound(cid)),
        }
    }

    /// Drop a pending request without invoking it. Returns whether it was present.
    pub async fn remove(&self, request_id: &str) -> bool {
        self.pending.write().await.remove(request_id).is_some()
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.pending.write().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.pending.write().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict expired entries without invoking them; returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingRequest> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let n = expired.len();
        // dropping the callbacks releases any waiter blocked on them
        drop(expired);
        if n > 0 {
            tracing::debug!(evicted = n, "swept expired pending requests");
        }
        n
    }

    /// Run `sweep` every `every` until `stop` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        store.sweep().await;
                    }
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("correlation sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::packet::{Fields, PacketKind};

    fn response_to(id: &str) -> Packet {
        Packet::new(PacketKind::Rpc, None, None).with_correlation(id)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> ResponseCallback {
        let c = Arc::clone(counter);
        Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn resolve_fires_once_and_removes() {
        let store = CorrelationStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        store
            .register("r1", counting(&hits), Duration::from_secs(5))
            .await
            .unwrap();

        store.resolve(response_to("r1")).await.unwrap();
        let again = store.resolve(response_to("r1")).await.unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(again, TetherError::CorrelationNotFound("r1".into()));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_and_original_survives() {
        let store = CorrelationStore::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        store
            .register("dup", counting(&first), Duration::from_secs(5))
            .await
            .unwrap();
        let err = store
            .register("dup", counting(&second), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, TetherError::DuplicateCorrelation("dup".into()));
        assert_eq!(store.len().await, 1);

        store.resolve(response_to("dup")).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn response_without_correlation_is_not_found() {
        let store = CorrelationStore::new();
        let err = store
            .resolve(Packet::request("ping", Fields::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "CORRELATION_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_expired_without_invoking() {
        let store = CorrelationStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        store
            .register("short", counting(&hits), Duration::from_millis(100))
            .await
            .unwrap();
        store
            .register("long", counting(&hits), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.sweep().await, 0);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.sweep().await, 1);

        assert!(!store.contains("short").await);
        assert!(store.contains("long").await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn store_can_be_shared_across_tasks() {
        assert_send_sync::<CorrelationStore>();
        assert_send_sync::<Arc<CorrelationStore>>();
    }

    #[tokio::test]
    async fn pending_request_resolves_from_another_task() {
        let store = Arc::new(CorrelationStore::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        store
            .register(
                "x1",
                Box::new(move |resp| {
                    let _ = tx.send(resp);
                }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let remote = Arc::clone(&store);
        tokio::spawn(async move { remote.resolve(response_to("x1")).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.await.unwrap().correlation_id(), Some("x1"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = CorrelationStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        store
            .register("r", counting(&hits), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(store.remove("r").await);
        assert!(!store.remove("r").await);
    }
}
