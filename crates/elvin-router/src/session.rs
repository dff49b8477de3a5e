//! Router-side state of one client connection.

use std::fmt;

use elvin_core::{
    Connection, ConnectionConfig, ConnectionState, PrimedKeys, Registry, Role, security::Side,
};
use parking_lot::{Mutex, MutexGuard};

use crate::config::ConnectionLimits;

/// Mutable per-connection state, guarded by the session lock.
#[derive(Debug)]
pub struct SessionState {
    /// Lifecycle state machine.
    pub connection: Connection,
    /// Subscriptions and quenches.
    pub registry: Registry,
    /// Connection-level notification keys (producer side).
    pub notification_keys: PrimedKeys,
    /// Connection-level subscription keys (consumer side).
    pub subscription_keys: PrimedKeys,
    /// Limits negotiated at connect time.
    pub limits: ConnectionLimits,
}

/// One client connection known to the router.
#[derive(Debug)]
pub struct Session {
    id: u32,
    peer: String,
    state: Mutex<SessionState>,
}

impl Session {
    /// Fresh session in the `New` state.
    pub fn new(
        id: u32,
        peer: String,
        now: std::time::Instant,
        limits: ConnectionLimits,
        connection: ConnectionConfig,
    ) -> Self {
        let state = SessionState {
            connection: Connection::new(Role::Router, now, connection),
            registry: Registry::new(id),
            notification_keys: PrimedKeys::empty(Side::Producer),
            subscription_keys: PrimedKeys::empty(Side::Consumer),
            limits,
        };
        Self { id, peer, state: Mutex::new(state) }
    }

    /// Connection id, the high half of every synthetic id it owns.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Peer address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Lock the session state. Never held across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Summary for the client-list dump.
    pub fn info(&self) -> SessionInfo {
        let state = self.lock();
        SessionInfo {
            id: self.id,
            peer: self.peer.clone(),
            state: state.connection.state(),
            subscriptions: state.registry.subscription_count(),
            quenches: state.registry.quench_count(),
        }
    }
}

/// Snapshot of a session for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Connection id.
    pub id: u32,
    /// Peer address.
    pub peer: String,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Live quenches.
    pub quenches: usize,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x} {} {:?} subs={} quenches={}",
            self.id, self.peer, self.state, self.subscriptions, self.quenches
        )
    }
}
