use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

/// Link lifecycle as seen by the rest of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Authenticated = 3,
    Syncing = 4,
    Ready = 5,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Ready => "ready",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Authenticated,
            4 => ConnectionState::Syncing,
            5 => ConnectionState::Ready,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic state with change notification.
///
/// The atomic is authoritative; the watch channel mirrors it for subscribers.
pub struct StateCell {
    value: AtomicU8,
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            value: AtomicU8::new(ConnectionState::Disconnected as u8),
            tx,
        }
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move `from -> to` only if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let ok = self
            .value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.publish(from, to);
        }
        ok
    }

    /// Set `to` unconditionally; returns the previous state.
    pub fn force(&self, to: ConnectionState) -> ConnectionState {
        let prev = ConnectionState::from_u8(self.value.swap(to as u8, Ordering::AcqRel));
        if prev != to {
            self.publish(prev, to);
        }
        prev
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    fn publish(&self, from: ConnectionState, to: ConnectionState) {
        self.tx.send_replace(to);
        tracing::info!(%from, %to, "connection state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_requires_expected_state() {
        let cell = StateCell::default();
        assert!(!cell.transition(ConnectionState::Connected, ConnectionState::Authenticated));
        assert!(cell.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn subscribers_see_latest_state() {
        let cell = StateCell::default();
        let rx = cell.subscribe();
        cell.force(ConnectionState::Ready);
        assert_eq!(*rx.borrow(), ConnectionState::Ready);
        assert_eq!(cell.force(ConnectionState::Disconnected), ConnectionState::Ready);
    }
}
