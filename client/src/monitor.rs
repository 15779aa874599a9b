//! Connection monitor.
//!
//! Folds transport events into a connection state machine and publishes
//! every transition on a watch channel.

use crate::protocol::ConnectionState;
use crate::remote::TransportEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

type LogoutCallback = Box<dyn FnOnce() + Send>;

/// A change of connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Connected again after having been connected before
    pub reconnect: bool,
}

/// Tracks connection state and fires the logout callback on auth failure.
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
    ever_connected: AtomicBool,
    on_logout: Mutex<Option<LogoutCallback>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("state", &self.state())
            .field("ever_connected", &self.ever_connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            ever_connected: AtomicBool::new(false),
            on_logout: Mutex::new(None),
        }
    }

    /// Install the callback fired on logout or auth failure.
    ///
    /// Replaces a callback that has not fired yet.
    pub fn set_logout(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_logout.lock() = Some(Box::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply a transport event. Returns the transition if the state changed.
    pub fn observe(&self, event: TransportEvent) -> Option<Transition> {
        let current = self.state();
        if current == ConnectionState::Unauthorized {
            return None;
        }

        let next = match (current, event) {
            (_, TransportEvent::Unauthorized) => ConnectionState::Unauthorized,
            // The transport retries on its own after a drop
            (ConnectionState::Connected, TransportEvent::Disconnected) => {
                ConnectionState::Connecting
            }
            (_, TransportEvent::Disconnected) => ConnectionState::Disconnected,
            (_, TransportEvent::Connecting) => ConnectionState::Connecting,
            (_, TransportEvent::Connected) => ConnectionState::Connected,
        };
        if next == current {
            return None;
        }

        let reconnect =
            next == ConnectionState::Connected && self.ever_connected.swap(true, Ordering::AcqRel);
        self.state.send_replace(next);
        tracing::info!(from = ?current, to = ?next, "connection state changed");

        if next == ConnectionState::Unauthorized {
            self.fire_logout();
        }

        Some(Transition {
            from: current,
            to: next,
            reconnect,
        })
    }

    /// Fire the logout callback. Returns false if it already fired.
    pub fn fire_logout(&self) -> bool {
        let callback = self.on_logout.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}
