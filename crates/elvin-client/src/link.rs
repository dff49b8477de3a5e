//! One router connection.
//!
//! A [`Link`] owns the connection state machine for a single transport and
//! the two tasks that move its packets:
//!
//! ```text
//!  Client ops ──request()──> pending[xid] ──┐
//!       │                                   │ oneshot
//!       └── mpsc<Outgoing> ──> writer task  │
//!                                           │
//!  reader task ── read_packet ──┬── reply ──┘
//!                               ├── NotifyDeliver / Sub*Notify ──> Tracker
//!                               ├── DropWarn ──> events
//!                               └── Disconn / EOF ──> LinkDown
//! ```
//!
//! Replies are matched to requests by xid. SubRply and QnchRply bind the
//! router id in the tracker before the waiting request is woken, so a
//! delivery that follows the reply on the wire is always routed.
//!
//! When the reader stops, every outstanding request fails with
//! `ConnectionLost` and a [`LinkDown`] carrying the link's generation goes to
//! the reconnect supervisor.

use std::{collections::HashMap, sync::Arc, time::Duration};

use elvin_core::{
    ActivitySignal, Connection, ConnectionAction, ConnectionConfig, ConnectionState, Environment,
    FrameError, Outgoing, Role, WriterExit, framing::read_packet, run_writer,
};
use elvin_proto::{
    Packet, PacketType, Xid,
    frame::DEFAULT_MAX_FRAME_LENGTH,
    payloads::{ConnRply, ConnRqst, DisconnRqst},
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
    task::{JoinError, JoinHandle},
};

use crate::{
    config::ClientConfig,
    error::ClientError,
    events::{ClientEvent, DisconnectReason},
    handle::QuenchNotice,
    tracked::{Route, Tracker},
};

/// A link's reader stopped.
#[derive(Debug)]
pub(crate) struct LinkDown {
    pub(crate) generation: u64,
    pub(crate) reason: DisconnectReason,
}

/// Client-wide state a link's reader feeds.
#[derive(Debug, Clone)]
pub(crate) struct LinkContext {
    pub(crate) tracker: Arc<Mutex<Tracker>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) down: mpsc::UnboundedSender<LinkDown>,
}

#[derive(Debug)]
struct Pending {
    reply: oneshot::Sender<Packet>,
    route: Option<Route>,
}

/// Everyone waiting on the reader.
#[derive(Debug, Default)]
struct Waiters {
    closed: bool,
    requests: HashMap<Xid, Pending>,
    test_conns: Vec<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct LinkShared {
    connection: Mutex<Connection>,
    waiters: Mutex<Waiters>,
}

/// A live router connection.
#[derive(Debug)]
pub(crate) struct Link {
    generation: u64,
    queue: mpsc::Sender<Outgoing>,
    shared: Arc<LinkShared>,
    task: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Link {
    /// Start the reader and writer for `stream`. The handshake is separate.
    pub(crate) fn open<S, E>(stream: S, generation: u64, env: E, config: &ClientConfig, context: LinkContext) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        E: Environment,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let activity = ActivitySignal::new();
        let connection = Connection::new(Role::Client, env.now(), ConnectionConfig {
            handshake_timeout: config.request_timeout,
        });
        let shared = Arc::new(LinkShared {
            connection: Mutex::new(connection),
            waiters: Mutex::new(Waiters::default()),
        });

        let writer = tokio::spawn(run_writer(writer, queue_rx, activity.clone(), config.keepalive, env.clone()));
        let reader_task = Reader { shared: Arc::clone(&shared), queue: queue.clone(), activity, env, context };
        let task = tokio::spawn(reader_task.run(reader, writer, generation));
        Self { generation, queue, shared, task }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.connection.lock().state()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn is_connected(&self) -> bool {
        self.shared.connection.lock().is_connected()
    }

    /// Send ConnRqst and wait for ConnRply.
    pub(crate) async fn handshake<E: Environment>(
        &self,
        request: ConnRqst,
        env: &E,
        timeout: Duration,
    ) -> Result<ConnRply, ClientError> {
        let xid = request.xid;
        let reply = self.register(xid, None)?;
        let started = self.shared.connection.lock().connect(request, env.now());
        let actions = match started {
            Ok(actions) => actions,
            Err(error) => {
                self.unregister(xid);
                return Err(error.into());
            },
        };
        self.execute(actions).await?;
        match self.await_reply(xid, reply, env, timeout).await? {
            Packet::ConnRply(reply) => Ok(reply),
            other => Err(ClientError::UnexpectedReply(other.packet_type())),
        }
    }

    /// Send DisconnRqst, wait for DisconnRply and close the transport.
    pub(crate) async fn disconnect<E: Environment>(
        &self,
        xid: Xid,
        env: &E,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let reply = self.register(xid, None)?;
        let started = self.shared.connection.lock().disconnect(DisconnRqst { xid }, env.now());
        let actions = match started {
            Ok(actions) => actions,
            Err(_) => {
                self.unregister(xid);
                self.close("disconnect while not connected").await;
                return Err(ClientError::NotConnected);
            },
        };
        self.execute(actions).await?;
        let reply = self.await_reply(xid, reply, env, timeout).await;
        self.close("disconnected").await;
        expect_reply(reply?, PacketType::DisconnRply)
    }

    /// Send a request and wait for the reply with the same xid.
    ///
    /// A Nack reply becomes [`ClientError::Nack`].
    pub(crate) async fn request<E: Environment>(
        &self,
        xid: Xid,
        packet: Packet,
        route: Option<Route>,
        env: &E,
        timeout: Duration,
    ) -> Result<Packet, ClientError> {
        self.check(&packet)?;
        let reply = self.register(xid, route)?;
        if self.queue.send(packet.into()).await.is_err() {
            self.unregister(xid);
            return Err(ClientError::ConnectionLost);
        }
        self.await_reply(xid, reply, env, timeout).await
    }

    /// Queue a packet that has no reply.
    pub(crate) async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        self.check(&packet)?;
        self.queue.send(packet.into()).await.map_err(|_| ClientError::ConnectionLost)
    }

    /// Send TestConn and wait for ConfConn.
    pub(crate) async fn test_conn<E: Environment>(&self, env: &E, timeout: Duration) -> Result<(), ClientError> {
        self.check(&Packet::TestConn)?;
        let (waiter, answered) = oneshot::channel();
        {
            let mut waiters = self.shared.waiters.lock();
            if waiters.closed {
                return Err(ClientError::ConnectionLost);
            }
            waiters.test_conns.push(waiter);
        }
        self.queue.send(Packet::TestConn.into()).await.map_err(|_| ClientError::ConnectionLost)?;
        tokio::select! {
            answered = answered => answered.map_err(|_| ClientError::ConnectionLost),
            () = env.sleep(timeout) => Err(ClientError::Timeout(timeout)),
        }
    }

    /// Flush the queue and close the transport.
    pub(crate) async fn close(&self, reason: &str) {
        let _ = self.queue.send(Outgoing::Close { reason: reason.to_owned() }).await;
    }

    fn check(&self, packet: &Packet) -> Result<(), ClientError> {
        let connection = self.shared.connection.lock();
        if !connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        connection.check_outgoing(packet)?;
        Ok(())
    }

    fn register(&self, xid: Xid, route: Option<Route>) -> Result<oneshot::Receiver<Packet>, ClientError> {
        let (reply, receiver) = oneshot::channel();
        let mut waiters = self.shared.waiters.lock();
        if waiters.closed {
            return Err(ClientError::ConnectionLost);
        }
        waiters.requests.insert(xid, Pending { reply, route });
        Ok(receiver)
    }

    fn unregister(&self, xid: Xid) {
        self.shared.waiters.lock().requests.remove(&xid);
    }

    async fn execute(&self, actions: Vec<ConnectionAction>) -> Result<(), ClientError> {
        for action in actions {
            match action {
                ConnectionAction::Send(packet) => {
                    self.queue.send(packet.into()).await.map_err(|_| ClientError::ConnectionLost)?;
                },
                ConnectionAction::Close { reason } => self.close(&reason).await,
            }
        }
        Ok(())
    }

    async fn await_reply<E: Environment>(
        &self,
        xid: Xid,
        reply: oneshot::Receiver<Packet>,
        env: &E,
        timeout: Duration,
    ) -> Result<Packet, ClientError> {
        let reply = tokio::select! {
            reply = reply => reply.map_err(|_| ClientError::ConnectionLost)?,
            () = env.sleep(timeout) => {
                self.unregister(xid);
                return Err(ClientError::Timeout(timeout));
            },
        };
        match reply {
            Packet::Nack(nack) => Err(ClientError::Nack { code: nack.code, message: nack.expanded_message() }),
            reply => Ok(reply),
        }
    }
}

/// Accept `reply` only if it has the expected type.
pub(crate) fn expect_reply(reply: Packet, expected: PacketType) -> Result<(), ClientError> {
    if reply.packet_type() == expected {
        Ok(())
    } else {
        Err(ClientError::UnexpectedReply(reply.packet_type()))
    }
}

struct Reader<E: Environment> {
    shared: Arc<LinkShared>,
    queue: mpsc::Sender<Outgoing>,
    activity: ActivitySignal,
    env: E,
    context: LinkContext,
}

impl<E: Environment> Reader<E> {
    async fn run<R>(self, mut reader: R, mut writer: JoinHandle<Result<WriterExit, FrameError>>, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        let reason = tokio::select! {
            reason = self.read_loop(&mut reader) => {
                writer.abort();
                reason
            },
            exit = &mut writer => writer_reason(exit),
        };

        self.shared.connection.lock().close();
        let waiters = std::mem::replace(&mut *self.shared.waiters.lock(), Waiters { closed: true, ..Waiters::default() });
        if !waiters.requests.is_empty() {
            tracing::debug!(outstanding = waiters.requests.len(), "failing requests on closed link");
        }
        drop(waiters);

        tracing::info!(generation, ?reason, "router connection closed");
        let _ = self.context.down.send(LinkDown { generation, reason });
    }

    async fn read_loop<R>(&self, reader: &mut R) -> DisconnectReason
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let packet = match read_packet(reader, DEFAULT_MAX_FRAME_LENGTH).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return self.end_of_stream(),
                Err(error @ (FrameError::Decode(_) | FrameError::TooLarge { .. })) => {
                    tracing::warn!(%error, "bad frame from router");
                    return DisconnectReason::ProtocolError;
                },
                Err(error) => {
                    tracing::debug!(%error, "router read failed");
                    return DisconnectReason::ConnectionLost;
                },
            };
            self.activity.mark();
            if let Some(reason) = self.handle(packet).await {
                return reason;
            }
        }
    }

    fn end_of_stream(&self) -> DisconnectReason {
        match self.shared.connection.lock().state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => DisconnectReason::Requested,
            _ => DisconnectReason::ConnectionLost,
        }
    }

    async fn handle(&self, packet: Packet) -> Option<DisconnectReason> {
        let ty = packet.packet_type();
        tracing::trace!(packet = ty.name(), "received");
        let received = self.shared.connection.lock().receive(&packet, self.env.now());
        let actions = match received {
            Ok(actions) => actions,
            Err(error) => {
                tracing::warn!(%error, "router sent an illegal packet");
                return Some(DisconnectReason::ProtocolError);
            },
        };

        let mut closing = None;
        for action in actions {
            match action {
                ConnectionAction::Send(reply) => {
                    let _ = self.queue.send(reply.into()).await;
                },
                ConnectionAction::Close { reason } => closing = Some(reason),
            }
        }

        if let Some(reason) = self.route(packet) {
            return Some(reason);
        }
        closing.map(|reason| {
            tracing::debug!(%reason, "connection closing");
            if ty == PacketType::DisconnRply {
                DisconnectReason::Requested
            } else {
                DisconnectReason::ProtocolError
            }
        })
    }

    fn route(&self, packet: Packet) -> Option<DisconnectReason> {
        match packet {
            Packet::NotifyDeliver(deliver) => {
                let delivered = self.context.tracker.lock().deliver(&deliver);
                tracing::trace!(delivered, "notification delivered");
            },
            Packet::SubAddNotify(notify) => {
                let notice = QuenchNotice::SubscriptionAdded {
                    term_id: notify.term_id,
                    expression: notify.expression,
                    insecure: notify.insecure,
                };
                self.context.tracker.lock().quench_notice(&notify.quench_ids, &notice);
            },
            Packet::SubModNotify(notify) => {
                let notice = QuenchNotice::SubscriptionModified {
                    term_id: notify.term_id,
                    expression: notify.expression,
                    insecure: notify.insecure,
                };
                self.context.tracker.lock().quench_notice(&notify.quench_ids, &notice);
            },
            Packet::SubDelNotify(notify) => {
                let notice = QuenchNotice::SubscriptionRemoved { term_id: notify.term_id };
                self.context.tracker.lock().quench_notice(&notify.quench_ids, &notice);
            },
            Packet::DropWarn => {
                tracing::warn!("router dropped deliveries to this client");
                let _ = self.context.events.send(ClientEvent::DropWarn);
            },
            Packet::ConfConn => {
                let waiters = std::mem::take(&mut self.shared.waiters.lock().test_conns);
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            },
            Packet::TestConn => {},
            Packet::Disconn(disconn) => return Some(DisconnectReason::from(&disconn)),
            reply => self.complete(reply),
        }
        None
    }

    fn complete(&self, reply: Packet) {
        let Some(xid) = reply.xid() else {
            tracing::debug!(packet = reply.packet_type().name(), "ignoring packet");
            return;
        };
        let pending = self.shared.waiters.lock().requests.remove(&xid);
        let Some(pending) = pending else {
            match &reply {
                Packet::Nack(nack) => tracing::warn!(xid, message = %nack.expanded_message(), "router nack"),
                _ => tracing::warn!(xid, packet = reply.packet_type().name(), "reply with no outstanding request"),
            }
            return;
        };
        if let Some((route, router_id)) = pending.route.and_then(|route| assigned_id(route, &reply)) {
            self.context.tracker.lock().bind(route, router_id);
        }
        let _ = pending.reply.send(reply);
    }
}

/// Router id carried by a reply that matches the request's route.
fn assigned_id(route: Route, reply: &Packet) -> Option<(Route, u64)> {
    match (route, reply) {
        (Route::Subscription(_), Packet::SubRply(reply)) => Some((route, reply.subscription_id)),
        (Route::Quench(_), Packet::QnchRply(reply)) => Some((route, reply.quench_id)),
        _ => None,
    }
}

fn writer_reason(exit: Result<Result<WriterExit, FrameError>, JoinError>) -> DisconnectReason {
    match exit {
        Ok(Ok(WriterExit::Closed { .. } | WriterExit::Drained)) => DisconnectReason::Requested,
        Ok(Ok(WriterExit::Unresponsive { reason })) => {
            tracing::warn!(%reason, "router unresponsive");
            DisconnectReason::ConnectionLost
        },
        Ok(Err(error)) => {
            tracing::error!(%error, "router write failed");
            DisconnectReason::ConnectionLost
        },
        Err(error) => {
            tracing::error!(%error, "writer task failed");
            DisconnectReason::ConnectionLost
        },
    }
}
