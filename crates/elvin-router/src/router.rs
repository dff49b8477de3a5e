//! Sans-IO router core.
//!
//! [`RouterCore`] owns the session index and handles every packet a client
//! sends. It never touches sockets: each call returns [`RouterAction`]s for
//! the server to carry out.
//!
//! # Architecture
//!
//! ```text
//! reader task ──> handle_packet ──> Send / Close           ──> session queue
//!                                └> Dispatch               ──> notify dispatcher
//!                                └> SubscriptionChanged    ──> subscription sink
//!                                └> QuenchChanged          ──> quench sink
//!
//! sinks ──> resolve(action) ──> Deliver / Send ──> session queues
//! ```
//!
//! Deferred actions ([`RouterAction::Dispatch`] and the change events) are
//! expanded by [`RouterCore::resolve`] against a fresh snapshot of the
//! session index, off the reader's path.
//!
//! # Locking
//!
//! The index is behind a router-scoped `RwLock`; each session's state behind
//! its own `Mutex`. The index lock is released before any session lock is
//! taken, and no lock is ever held across I/O.

use std::{collections::HashMap, sync::Arc};

use elvin_core::{
    ConnectionAction, ConnectionConfig, ConnectionError, Environment, ExpressionEngine, PrimedKeys, RegistryError,
    registry::{QuenchChange, SubscriptionChange},
};
use elvin_proto::{
    NackCode, Packet, Value, Xid,
    payloads::{
        ConnRply, ConnRqst, Disconn, DisconnReason, Nack, NotifyEmit, PROTOCOL_MAJOR, QnchAddRqst,
        QnchDelRqst, QnchModRqst, QnchRply, SecRply, SecRqst, SubAddRqst, SubDelRqst, SubModRqst,
        SubRply, UNotify,
    },
};
use parking_lot::RwLock;

use crate::{
    config::RouterConfig,
    dispatch::{
        self, ChangeKind, NotifyRequest, QuenchEvent, SubscriptionEvent, quench_notices,
        subscription_notices,
    },
    session::{Session, SessionInfo, SessionState},
};

/// Work produced by the router core.
#[derive(Debug, Clone)]
pub enum RouterAction {
    /// Queue a packet that must not be dropped.
    Send {
        /// Target connection.
        session: u32,
        /// Packet to send.
        packet: Packet,
    },
    /// Queue a delivery; dropped if the connection's queue is full.
    Deliver {
        /// Target connection.
        session: u32,
        /// NotifyDeliver packet.
        packet: Packet,
    },
    /// Flush and close a connection.
    Close {
        /// Target connection.
        session: u32,
        /// Reason for logs.
        reason: String,
    },
    /// Fan a notification out to subscribers.
    Dispatch(NotifyRequest),
    /// Report a subscription change to quenchers.
    SubscriptionChanged(SubscriptionEvent),
    /// Report existing subscriptions to a new or modified quench.
    QuenchChanged(QuenchEvent),
}

impl RouterAction {
    /// True for actions that [`RouterCore::resolve`] expands.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Dispatch(_) | Self::SubscriptionChanged(_) | Self::QuenchChanged(_))
    }
}

/// Router state shared by every connection task.
#[derive(Debug)]
pub struct RouterCore<E: Environment, X: ExpressionEngine> {
    env: E,
    engine: X,
    config: RouterConfig,
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl<E: Environment, X: ExpressionEngine> RouterCore<E, X> {
    /// Empty router.
    pub fn new(env: E, engine: X, config: RouterConfig) -> Self {
        Self { env, engine, config, sessions: RwLock::new(HashMap::new()) }
    }

    /// Configuration in force.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Look up a session.
    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Ids of every open session.
    pub fn session_ids(&self) -> Vec<u32> {
        self.sessions.read().keys().copied().collect()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Register a newly accepted connection.
    ///
    /// Returns `None` when the connection limit is reached.
    pub fn open_session(&self, peer: String) -> Option<u32> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.config.max_connections {
            tracing::warn!(%peer, max = self.config.max_connections, "connection limit reached");
            return None;
        }
        let mut id = self.env.random_u32();
        while sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        let connection = ConnectionConfig { handshake_timeout: self.config.handshake_timeout };
        let session = Session::new(id, peer, self.env.now(), self.config.limits, connection);
        tracing::info!(session = %format_args!("{id:08x}"), peer = session.peer(), "connection opened");
        sessions.insert(id, Arc::new(session));
        Some(id)
    }

    /// Close a session that has not sent ConnRqst within the handshake
    /// timeout. Returns nothing once the session is connected or gone.
    pub fn expire_handshake(&self, id: u32) -> Vec<RouterAction> {
        let Some(session) = self.session(id) else {
            return Vec::new();
        };
        let actions = session.lock().connection.tick(self.env.now());
        actions
            .into_iter()
            .filter_map(|action| match action {
                ConnectionAction::Close { reason } => {
                    tracing::info!(session = %format_args!("{id:08x}"), %reason, "handshake timed out");
                    Some(RouterAction::Close { session: id, reason })
                },
                ConnectionAction::Send(_) => None,
            })
            .collect()
    }

    /// Largest frame accepted from a session.
    pub fn max_frame_length(&self, id: u32) -> usize {
        self.session(id)
            .map_or(self.config.limits.max_packet_length, |session| session.lock().limits.max_packet_length)
    }

    /// Remove a session from the index and drop its registrations.
    ///
    /// Returns the subscription removals to report to quenchers.
    pub fn close_session(&self, id: u32) -> Vec<RouterAction> {
        let Some(session) = self.sessions.write().remove(&id) else {
            return Vec::new();
        };
        let mut state = session.lock();
        state.connection.close();
        let (subscriptions, quenches) = state.registry.clear();
        let connection_keys = state.subscription_keys.clone();
        drop(state);

        tracing::info!(
            session = %format_args!("{id:08x}"),
            peer = session.peer(),
            subscriptions = subscriptions.len(),
            quenches = quenches.len(),
            "connection closed"
        );
        subscriptions
            .into_iter()
            .map(|subscription| {
                RouterAction::SubscriptionChanged(SubscriptionEvent {
                    kind: ChangeKind::Removed,
                    subscription,
                    connection_keys: connection_keys.clone(),
                })
            })
            .collect()
    }

    /// Summaries of every session, ordered by id.
    pub fn describe_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.snapshot().iter().map(|session| session.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Send `disconn` to every session and close them.
    pub fn broadcast_disconnect(&self, disconn: &Disconn) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        for id in self.session_ids() {
            actions.push(RouterAction::Send { session: id, packet: disconn.clone().into() });
            actions.push(RouterAction::Close {
                session: id,
                reason: format!("router disconnect (reason {})", disconn.reason.code()),
            });
        }
        actions
    }

    /// Expand a deferred action into packets. Other actions pass through.
    pub fn resolve(&self, action: RouterAction) -> Vec<RouterAction> {
        match action {
            RouterAction::Dispatch(request) => dispatch::dispatch(&self.snapshot(), &request),
            RouterAction::SubscriptionChanged(event) => subscription_notices(&self.snapshot(), &event),
            RouterAction::QuenchChanged(event) => quench_notices(&self.snapshot(), &event),
            other => vec![other],
        }
    }

    /// Handle one packet received on `id`.
    ///
    /// Packets for unknown sessions are ignored. A protocol violation answers
    /// with a Nack (when the packet has an xid), then `Disconn(4)`, and closes
    /// the connection.
    pub fn handle_packet(&self, id: u32, packet: Packet) -> Vec<RouterAction> {
        let Some(session) = self.session(id) else {
            return Vec::new();
        };
        let now = self.env.now();
        let mut state = session.lock();

        let lifecycle = match state.connection.receive(&packet, now) {
            Ok(lifecycle) => lifecycle,
            Err(ConnectionError::AlreadyConnected) => {
                tracing::warn!(session = %format_args!("{id:08x}"), "repeated ConnRqst");
                return vec![nack(id, packet.xid().unwrap_or(0), NackCode::ProtocolError, vec![
                    Value::from("already connected"),
                ])];
            },
            Err(error) => {
                tracing::warn!(session = %format_args!("{id:08x}"), %error, %packet, "protocol violation");
                state.connection.close();
                return violation(id, packet.xid(), &error);
            },
        };

        let mut actions: Vec<RouterAction> = lifecycle
            .into_iter()
            .map(|action| match action {
                ConnectionAction::Send(packet) => RouterAction::Send { session: id, packet },
                ConnectionAction::Close { reason } => RouterAction::Close { session: id, reason },
            })
            .collect();

        tracing::debug!(session = %format_args!("{id:08x}"), %packet, "received");
        match packet {
            Packet::ConnRqst(request) => actions.extend(self.connect(id, &mut state, request)),
            Packet::NotifyEmit(NotifyEmit { attributes, deliver_insecure, keys }) => {
                actions.push(RouterAction::Dispatch(NotifyRequest {
                    origin: id,
                    attributes,
                    deliver_insecure,
                    keys: PrimedKeys::producer(&keys),
                    connection_keys: state.notification_keys.clone(),
                }));
            },
            Packet::UNotify(UNotify { attributes, deliver_insecure, keys, .. }) => {
                actions.push(RouterAction::Dispatch(NotifyRequest {
                    origin: id,
                    attributes,
                    deliver_insecure,
                    keys: PrimedKeys::producer(&keys),
                    connection_keys: state.notification_keys.clone(),
                }));
            },
            Packet::SecRqst(request) => actions.push(change_security(id, &mut state, &request)),
            Packet::SubAddRqst(request) => actions.extend(self.add_subscription(id, &mut state, request)),
            Packet::SubModRqst(request) => actions.extend(self.modify_subscription(id, &mut state, request)),
            Packet::SubDelRqst(request) => actions.extend(remove_subscription(id, &mut state, request)),
            Packet::QnchAddRqst(request) => actions.extend(self.add_quench(id, &mut state, request)),
            Packet::QnchModRqst(request) => actions.extend(modify_quench(id, &mut state, request)),
            Packet::QnchDelRqst(request) => actions.push(remove_quench(id, &mut state, request)),
            _ => {},
        }
        actions
    }

    fn connect(&self, id: u32, state: &mut SessionState, request: ConnRqst) -> Vec<RouterAction> {
        if request.version_major != PROTOCOL_MAJOR {
            tracing::warn!(
                session = %format_args!("{id:08x}"),
                major = request.version_major,
                minor = request.version_minor,
                "incompatible protocol version"
            );
            state.connection.close();
            return vec![
                nack(id, request.xid, NackCode::ProtocolIncompatible, Vec::new()),
                RouterAction::Close { session: id, reason: "incompatible protocol version".to_owned() },
            ];
        }

        let (limits, options) = self.config.limits.negotiate(&request.options);
        state.limits = limits;
        state.notification_keys = PrimedKeys::producer(&request.notification_keys);
        state.subscription_keys = PrimedKeys::consumer(&request.subscription_keys);
        if let Err(error) = state.connection.establish(self.env.now()) {
            state.connection.close();
            return violation(id, Some(request.xid), &error);
        }
        tracing::info!(session = %format_args!("{id:08x}"), "connection established");
        vec![RouterAction::Send { session: id, packet: ConnRply { xid: request.xid, options }.into() }]
    }

    fn add_subscription(&self, id: u32, state: &mut SessionState, request: SubAddRqst) -> Vec<RouterAction> {
        let SubAddRqst { xid, expression, accept_insecure, keys } = request;
        if state.registry.subscription_count() >= state.limits.max_subscriptions {
            return vec![limit_nack(id, xid, "Subscription.Max-Count")];
        }
        if expression.len() > state.limits.max_subscription_length {
            return vec![limit_nack(id, xid, "Subscription.Max-Length")];
        }
        let filter = match self.engine.parse(&expression) {
            Ok(filter) => filter,
            Err(error) => {
                let (code, args) = error.to_nack();
                return vec![nack(id, xid, code, args)];
            },
        };

        let seed = self.env.random_u32();
        let added =
            state.registry.add_subscription(seed, expression, filter, accept_insecure, PrimedKeys::consumer(&keys));
        match added {
            Ok(subscription) => {
                let subscription_id = subscription.id.as_u64();
                let event = SubscriptionEvent {
                    kind: ChangeKind::Added,
                    subscription: subscription.clone(),
                    connection_keys: state.subscription_keys.clone(),
                };
                vec![
                    RouterAction::Send { session: id, packet: SubRply { xid, subscription_id }.into() },
                    RouterAction::SubscriptionChanged(event),
                ]
            },
            Err(error) => vec![registry_nack(id, xid, &error)],
        }
    }

    fn modify_subscription(&self, id: u32, state: &mut SessionState, request: SubModRqst) -> Vec<RouterAction> {
        let SubModRqst { xid, subscription_id, expression, accept_insecure, add_keys, del_keys } = request;
        if state.registry.subscription(subscription_id).is_none() {
            return vec![registry_nack(id, xid, &RegistryError::UnknownSubscription(subscription_id))];
        }

        let filter = if expression.is_empty() {
            None
        } else {
            if expression.len() > state.limits.max_subscription_length {
                return vec![limit_nack(id, xid, "Subscription.Max-Length")];
            }
            match self.engine.parse(&expression) {
                Ok(filter) => Some((expression, filter)),
                Err(error) => {
                    let (code, args) = error.to_nack();
                    return vec![nack(id, xid, code, args)];
                },
            }
        };

        let change = SubscriptionChange {
            filter,
            accept_insecure,
            add_keys: Some(&add_keys),
            del_keys: Some(&del_keys),
        };
        match state.registry.modify_subscription(subscription_id, change) {
            Ok(subscription) => {
                let event = SubscriptionEvent {
                    kind: ChangeKind::Modified,
                    subscription: subscription.clone(),
                    connection_keys: state.subscription_keys.clone(),
                };
                vec![
                    RouterAction::Send { session: id, packet: SubRply { xid, subscription_id }.into() },
                    RouterAction::SubscriptionChanged(event),
                ]
            },
            Err(error) => vec![registry_nack(id, xid, &error)],
        }
    }

    fn add_quench(&self, id: u32, state: &mut SessionState, request: QnchAddRqst) -> Vec<RouterAction> {
        let QnchAddRqst { xid, names, deliver_insecure, keys } = request;
        let seed = self.env.random_u32();
        let names = names.into_iter().collect();
        match state.registry.add_quench(seed, names, deliver_insecure, PrimedKeys::producer(&keys)) {
            Ok(quench) => {
                let quench_id = quench.id.as_u64();
                let event = QuenchEvent {
                    session: id,
                    quench: quench.clone(),
                    connection_keys: state.notification_keys.clone(),
                };
                vec![
                    RouterAction::Send { session: id, packet: QnchRply { xid, quench_id }.into() },
                    RouterAction::QuenchChanged(event),
                ]
            },
            Err(error) => vec![registry_nack(id, xid, &error)],
        }
    }
}

fn nack(session: u32, xid: Xid, code: NackCode, args: Vec<Value>) -> RouterAction {
    RouterAction::Send { session, packet: Nack::new(xid, code, args).into() }
}

fn limit_nack(session: u32, xid: Xid, limit: &str) -> RouterAction {
    nack(session, xid, NackCode::ImplementationLimit, vec![Value::from(limit)])
}

fn registry_nack(session: u32, xid: Xid, error: &RegistryError) -> RouterAction {
    let (code, args) = error.to_nack();
    nack(session, xid, code, args)
}

fn violation(session: u32, xid: Option<Xid>, error: &ConnectionError) -> Vec<RouterAction> {
    let mut actions = Vec::with_capacity(3);
    if let Some(xid) = xid {
        let (code, args) = error.to_nack();
        actions.push(nack(session, xid, code, args));
    }
    actions.push(RouterAction::Send {
        session,
        packet: Disconn::new(DisconnReason::ProtocolViolation).into(),
    });
    actions.push(RouterAction::Close { session, reason: error.to_string() });
    actions
}

fn change_security(session: u32, state: &mut SessionState, request: &SecRqst) -> RouterAction {
    state.notification_keys.add(&request.add_notification_keys);
    state.notification_keys.remove(&request.del_notification_keys);
    state.subscription_keys.add(&request.add_subscription_keys);
    state.subscription_keys.remove(&request.del_subscription_keys);
    RouterAction::Send { session, packet: SecRply { xid: request.xid }.into() }
}

fn remove_subscription(session: u32, state: &mut SessionState, request: SubDelRqst) -> Vec<RouterAction> {
    let SubDelRqst { xid, subscription_id } = request;
    match state.registry.remove_subscription(subscription_id) {
        Ok(subscription) => vec![
            RouterAction::Send { session, packet: SubRply { xid, subscription_id }.into() },
            RouterAction::SubscriptionChanged(SubscriptionEvent {
                kind: ChangeKind::Removed,
                subscription,
                connection_keys: state.subscription_keys.clone(),
            }),
        ],
        Err(error) => vec![registry_nack(session, xid, &error)],
    }
}

fn modify_quench(session: u32, state: &mut SessionState, request: QnchModRqst) -> Vec<RouterAction> {
    let QnchModRqst { xid, quench_id, add_names, del_names, deliver_insecure, add_keys, del_keys } = request;
    let change = QuenchChange {
        add_names: &add_names,
        del_names: &del_names,
        deliver_insecure,
        add_keys: Some(&add_keys),
        del_keys: Some(&del_keys),
    };
    match state.registry.modify_quench(quench_id, change) {
        Ok(quench) => {
            let event = QuenchEvent {
                session,
                quench: quench.clone(),
                connection_keys: state.notification_keys.clone(),
            };
            vec![
                RouterAction::Send { session, packet: QnchRply { xid, quench_id }.into() },
                RouterAction::QuenchChanged(event),
            ]
        },
        Err(error) => vec![registry_nack(session, xid, &error)],
    }
}

fn remove_quench(session: u32, state: &mut SessionState, request: QnchDelRqst) -> RouterAction {
    let QnchDelRqst { xid, quench_id } = request;
    match state.registry.remove_quench(quench_id) {
        Ok(_) => RouterAction::Send { session, packet: QnchRply { xid, quench_id }.into() },
        Err(error) => registry_nack(session, xid, &error),
    }
}
