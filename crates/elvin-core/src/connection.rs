//! Connection state machine.
//!
//! Tracks the lifecycle of one Elvin connection on either side and decides
//! which packets are legal in which state.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as a parameter (no stored Environment)
//! - Methods return `Result<Vec<ConnectionAction>, ConnectionError>`
//! - Driver code executes the actions (send packets, close the transport)
//!
//! Request handling beyond lifecycle (subscriptions, notifications) is not
//! done here. The state machine only answers "is this packet legal now",
//! answers liveness checks and moves between states; the router or client
//! handles the rest.
//!
//! # State Machine
//!
//! ```text
//! Client:
//! ┌─────┐ ConnRqst ┌────────────┐ ConnRply ┌───────────┐ DisconnRqst ┌───────────────┐
//! │ New │─────────>│ Connecting │─────────>│ Connected │────────────>│ Disconnecting │
//! └─────┘          └────────────┘          └───────────┘             └───────────────┘
//!                        │ Nack/timeout          │ Disconn/error            │ DisconnRply
//!                        ↓                       ↓                          ↓
//!                   ┌────────┐              ┌────────┐                 ┌────────┐
//!                   │ Closed │              │ Closed │                 │ Closed │
//!                   └────────┘              └────────┘                 └────────┘
//!
//! Router:
//! ┌─────┐ ConnRqst accepted ┌───────────┐ DisconnRqst ┌───────────────┐
//! │ New │──────────────────>│ Connected │────────────>│ Disconnecting │──> Closed
//! └─────┘                   └───────────┘             └───────────────┘
//! ```
//!
//! TestConn, ConfConn, Nack and Disconn are legal in every state except
//! Closed.

use std::time::{Duration, Instant};

use elvin_proto::{
    Packet, PacketType,
    payloads::{ConnRqst, DisconnRply, DisconnRqst},
};

use crate::error::ConnectionError;

/// Which end of the connection this state machine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client library end.
    Client,
    /// Router end.
    Router,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, no ConnRqst yet.
    New,
    /// ConnRqst sent, waiting for the reply (client only).
    Connecting,
    /// Handshake complete.
    Connected,
    /// Graceful disconnect in progress.
    Disconnecting,
    /// Terminal.
    Closed,
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Send this packet to the peer.
    Send(Packet),

    /// Close the transport.
    Close {
        /// Reason for closing, for logs and local events.
        reason: String,
    },
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the handshake: from accept to ConnRqst on the router,
    /// from ConnRqst to its reply on the client.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { handshake_timeout: Duration::from_secs(10) }
    }
}

/// Connection state machine.
#[derive(Debug, Clone)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    config: ConnectionConfig,
    /// When the current state was entered.
    entered_at: Instant,
}

impl Connection {
    /// Create a connection in the `New` state.
    pub fn new(role: Role, now: Instant, config: ConnectionConfig) -> Self {
        Self { role, state: ConnectionState::New, config, entered_at: now }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Which end this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True once the handshake has completed and before any disconnect.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn enter(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.entered_at = now;
    }

    /// Start the handshake (client).
    ///
    /// # Errors
    ///
    /// `InvalidState` unless this is a client in `New`.
    pub fn connect(
        &mut self,
        request: ConnRqst,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.role != Role::Client || self.state != ConnectionState::New {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "connect" });
        }
        self.enter(ConnectionState::Connecting, now);
        Ok(vec![ConnectionAction::Send(request.into())])
    }

    /// Mark an accepted ConnRqst as complete (router).
    ///
    /// Called after the router has decided to answer with ConnRply.
    pub fn establish(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.role != Role::Router || self.state != ConnectionState::New {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "establish" });
        }
        self.enter(ConnectionState::Connected, now);
        Ok(())
    }

    /// Start a graceful disconnect (client).
    pub fn disconnect(
        &mut self,
        request: DisconnRqst,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.role != Role::Client || self.state != ConnectionState::Connected {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "disconnect" });
        }
        self.enter(ConnectionState::Disconnecting, now);
        Ok(vec![ConnectionAction::Send(request.into())])
    }

    /// Check that a locally built packet may be sent now.
    pub fn check_outgoing(&self, packet: &Packet) -> Result<(), ConnectionError> {
        let ty = packet.packet_type();
        let legal = match (self.role, self.state) {
            (_, ConnectionState::Closed) => false,
            (_, _) if is_universal(ty) => true,
            (Role::Client, ConnectionState::New) => ty == PacketType::UNotify,
            (Role::Client, ConnectionState::Connected) => client_request(ty),
            (Role::Router, ConnectionState::New) => {
                matches!(ty, PacketType::ConnRply | PacketType::Nack)
            },
            (Role::Router, ConnectionState::Connected | ConnectionState::Disconnecting) => {
                router_message(ty)
            },
            (Role::Client | Role::Router, _) => false,
        };
        if legal {
            Ok(())
        } else {
            Err(ConnectionError::InvalidState { state: self.state, operation: ty.name() })
        }
    }

    /// Process a packet received from the peer.
    ///
    /// Answers TestConn, applies lifecycle transitions and validates every
    /// other packet against the current state. On success the caller goes on
    /// to handle the packet itself.
    ///
    /// # Errors
    ///
    /// - `Closed` if the connection is already closed
    /// - `AlreadyConnected` for a ConnRqst on an established router connection
    /// - `UnexpectedPacket` for any other out-of-state packet
    pub fn receive(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let ty = packet.packet_type();

        match packet {
            Packet::TestConn => return Ok(vec![ConnectionAction::Send(Packet::ConfConn)]),
            Packet::ConfConn => return Ok(Vec::new()),
            Packet::Disconn(disconn) => {
                self.enter(ConnectionState::Closed, now);
                return Ok(vec![ConnectionAction::Close {
                    reason: format!("router disconnect (reason {})", disconn.reason.code()),
                }]);
            },
            Packet::Nack(nack) => {
                if self.role == Role::Client && self.state == ConnectionState::Connecting {
                    self.enter(ConnectionState::Closed, now);
                    return Ok(vec![ConnectionAction::Close {
                        reason: format!("connection refused: {}", nack.expanded_message()),
                    }]);
                }
                return Ok(Vec::new());
            },
            _ => {},
        }

        match (self.role, self.state) {
            (Role::Router, ConnectionState::New) => match ty {
                PacketType::ConnRqst | PacketType::UNotify => Ok(Vec::new()),
                _ => Err(ConnectionError::UnexpectedPacket { state: self.state, packet: ty }),
            },
            (Role::Router, ConnectionState::Connected) => match packet {
                Packet::ConnRqst(_) => Err(ConnectionError::AlreadyConnected),
                Packet::DisconnRqst(request) => {
                    self.enter(ConnectionState::Disconnecting, now);
                    Ok(vec![
                        ConnectionAction::Send(DisconnRply { xid: request.xid }.into()),
                        ConnectionAction::Close { reason: "client disconnected".to_owned() },
                    ])
                },
                _ if client_request(ty) => Ok(Vec::new()),
                _ => Err(ConnectionError::UnexpectedPacket { state: self.state, packet: ty }),
            },
            (Role::Client, ConnectionState::Connecting) => match ty {
                PacketType::ConnRply => {
                    self.enter(ConnectionState::Connected, now);
                    Ok(Vec::new())
                },
                _ => Err(ConnectionError::UnexpectedPacket { state: self.state, packet: ty }),
            },
            (Role::Client, ConnectionState::Connected) if router_message(ty) => Ok(Vec::new()),
            (Role::Client, ConnectionState::Disconnecting) => match ty {
                PacketType::DisconnRply => {
                    self.enter(ConnectionState::Closed, now);
                    Ok(vec![ConnectionAction::Close { reason: "disconnected".to_owned() }])
                },
                // Deliveries and replies already in flight.
                _ if router_message(ty) => Ok(Vec::new()),
                _ => Err(ConnectionError::UnexpectedPacket { state: self.state, packet: ty }),
            },
            (_, state) => Err(ConnectionError::UnexpectedPacket { state, packet: ty }),
        }
    }

    /// Time the handshake has been pending, once it reaches the timeout.
    pub fn check_timeout(&self, now: Instant) -> Option<Duration> {
        let pending = match self.role {
            Role::Router => self.state == ConnectionState::New,
            Role::Client => self.state == ConnectionState::Connecting,
        };
        if !pending {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.entered_at);
        (elapsed >= self.config.handshake_timeout).then_some(elapsed)
    }

    /// Close the connection if the handshake timed out.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.check_timeout(now) {
            Some(elapsed) => {
                self.enter(ConnectionState::Closed, now);
                vec![ConnectionAction::Close {
                    reason: ConnectionError::HandshakeTimeout(elapsed).to_string(),
                }]
            },
            None => Vec::new(),
        }
    }

    /// Transition to `Closed` (transport failure or local shutdown).
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

/// Packets legal in every open state, in both directions.
fn is_universal(ty: PacketType) -> bool {
    matches!(ty, PacketType::TestConn | PacketType::ConfConn | PacketType::Nack | PacketType::Disconn)
}

/// Packets a connected client may send to the router.
fn client_request(ty: PacketType) -> bool {
    matches!(
        ty,
        PacketType::UNotify
            | PacketType::NotifyEmit
            | PacketType::SecRqst
            | PacketType::SubAddRqst
            | PacketType::SubModRqst
            | PacketType::SubDelRqst
            | PacketType::QnchAddRqst
            | PacketType::QnchModRqst
            | PacketType::QnchDelRqst
            | PacketType::DisconnRqst
    )
}

/// Packets a router sends on an established connection.
fn router_message(ty: PacketType) -> bool {
    matches!(
        ty,
        PacketType::NotifyDeliver
            | PacketType::SubRply
            | PacketType::QnchRply
            | PacketType::SecRply
            | PacketType::DisconnRply
            | PacketType::DropWarn
            | PacketType::SubAddNotify
            | PacketType::SubModNotify
            | PacketType::SubDelNotify
    )
}

#[cfg(test)]
mod tests {
    use elvin_proto::{
        ConnectionOptions, NackCode, Notification,
        payloads::{ConnRply, Disconn, DisconnReason, Nack, NotifyEmit, SubRply},
    };

    use super::*;

    fn emit() -> Packet {
        NotifyEmit {
            attributes: Notification::new().with("x", 1),
            deliver_insecure: true,
            keys: Default::default(),
        }
        .into()
    }

    fn connected_client(now: Instant) -> Connection {
        let mut conn = Connection::new(Role::Client, now, ConnectionConfig::default());
        conn.connect(ConnRqst::new(1), now).unwrap();
        conn.receive(&ConnRply { xid: 1, options: ConnectionOptions::new() }.into(), now).unwrap();
        conn
    }

    #[test]
    fn client_lifecycle() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Client, t0, ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::New);

        let actions = conn.connect(ConnRqst::new(1), t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::Send(Packet::ConnRqst(_))]));
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.receive(&ConnRply { xid: 1, options: ConnectionOptions::new() }.into(), t0).unwrap();
        assert!(conn.is_connected());

        let actions = conn.disconnect(DisconnRqst { xid: 2 }, t0).unwrap();
        assert_eq!(actions, vec![ConnectionAction::Send(DisconnRqst { xid: 2 }.into())]);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        let actions = conn.receive(&DisconnRply { xid: 2 }.into(), t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::Close { .. }]));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn nack_while_connecting_closes() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Client, t0, ConnectionConfig::default());
        conn.connect(ConnRqst::new(1), t0).unwrap();

        let nack = Nack::new(1, NackCode::ProtocolIncompatible, Vec::new());
        let actions = conn.receive(&nack.into(), t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }] if reason.contains("refused")));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn handshake_timeout() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Client, t0, ConnectionConfig::default());
        conn.connect(ConnRqst::new(1), t0).unwrap();

        assert!(conn.tick(t0 + Duration::from_secs(5)).is_empty());
        let actions = conn.tick(t0 + Duration::from_secs(11));
        assert!(matches!(&actions[..], [ConnectionAction::Close { .. }]));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn router_times_out_silent_peer() {
        let t0 = Instant::now();
        let config = ConnectionConfig { handshake_timeout: Duration::from_secs(3) };
        let mut silent = Connection::new(Role::Router, t0, config.clone());
        assert!(silent.tick(t0 + Duration::from_secs(2)).is_empty());
        let actions = silent.tick(t0 + Duration::from_secs(3));
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }] if reason.contains("3s")));
        assert_eq!(silent.state(), ConnectionState::Closed);

        let mut greeted = Connection::new(Role::Router, t0, config);
        greeted.receive(&ConnRqst::new(1).into(), t0).unwrap();
        greeted.establish(t0).unwrap();
        assert!(greeted.tick(t0 + Duration::from_secs(60)).is_empty());
        assert!(greeted.is_connected());

        // An unstarted client has nothing to time out.
        let idle = Connection::new(Role::Client, t0, ConnectionConfig::default());
        assert_eq!(idle.check_timeout(t0 + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_conn_is_answered_in_any_open_state() {
        let t0 = Instant::now();
        for role in [Role::Client, Role::Router] {
            let mut conn = Connection::new(role, t0, ConnectionConfig::default());
            let actions = conn.receive(&Packet::TestConn, t0).unwrap();
            assert_eq!(actions, vec![ConnectionAction::Send(Packet::ConfConn)]);
        }
    }

    #[test]
    fn router_rejects_notify_before_connect() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Router, t0, ConnectionConfig::default());
        assert_eq!(
            conn.receive(&emit(), t0),
            Err(ConnectionError::UnexpectedPacket {
                state: ConnectionState::New,
                packet: PacketType::NotifyEmit
            })
        );
    }

    #[test]
    fn router_accepts_unotify_before_connect() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Router, t0, ConnectionConfig::default());
        let unotify = elvin_proto::payloads::UNotify {
            client_major: 4,
            client_minor: 0,
            attributes: Notification::new(),
            deliver_insecure: true,
            keys: Default::default(),
        };
        assert!(conn.receive(&unotify.into(), t0).unwrap().is_empty());
    }

    #[test]
    fn second_conn_rqst_is_already_connected() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Router, t0, ConnectionConfig::default());
        conn.receive(&ConnRqst::new(1).into(), t0).unwrap();
        conn.establish(t0).unwrap();

        assert_eq!(conn.receive(&ConnRqst::new(2).into(), t0), Err(ConnectionError::AlreadyConnected));
        assert!(conn.receive(&emit(), t0).unwrap().is_empty());
    }

    #[test]
    fn router_answers_disconn_rqst() {
        let t0 = Instant::now();
        let mut conn = Connection::new(Role::Router, t0, ConnectionConfig::default());
        conn.establish(t0).unwrap();

        let actions = conn.receive(&DisconnRqst { xid: 9 }.into(), t0).unwrap();
        assert_eq!(actions[0], ConnectionAction::Send(DisconnRply { xid: 9 }.into()));
        assert!(matches!(actions[1], ConnectionAction::Close { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn disconn_closes_from_any_state() {
        let t0 = Instant::now();
        let mut conn = connected_client(t0);
        let actions = conn.receive(&Disconn::new(DisconnReason::Shutdown).into(), t0).unwrap();
        assert!(matches!(&actions[..], [ConnectionAction::Close { .. }]));
        assert_eq!(conn.receive(&Packet::TestConn, t0), Err(ConnectionError::Closed));
    }

    #[test]
    fn client_rejects_router_bound_packets() {
        let t0 = Instant::now();
        let mut conn = connected_client(t0);
        assert!(conn.receive(&SubRply { xid: 1, subscription_id: 2 }.into(), t0).is_ok());
        assert!(matches!(
            conn.receive(&ConnRqst::new(3).into(), t0),
            Err(ConnectionError::UnexpectedPacket { .. })
        ));
    }

    #[test]
    fn outgoing_checks_follow_state() {
        let t0 = Instant::now();
        let conn = Connection::new(Role::Client, t0, ConnectionConfig::default());
        assert!(conn.check_outgoing(&emit()).is_err());

        let conn = connected_client(t0);
        assert!(conn.check_outgoing(&emit()).is_ok());
        assert!(conn.check_outgoing(&Packet::TestConn).is_ok());
    }
}
