//! Async router runtime.
//!
//! [`RouterServer`] accepts connections from any [`Listener`] and runs two
//! tasks per connection around the shared [`RouterCore`]:
//!
//! - the reader decodes frames, feeds the core and executes its actions
//! - the writer ([`elvin_core::run_writer`]) drains the outbound queue and
//!   runs the keepalive timer
//!
//! Four background tasks block on their own channels: the connection-removal
//! sink, the notify dispatcher, the subscription-change sink and the
//! quench-change sink. Fan-out work therefore never runs on a reader task.
//!
//! A connection that sends no ConnRqst within the handshake timeout is
//! closed without a Disconn.
//!
//! Deliveries use `try_send`: a full queue drops the delivery and the next
//! delivery that fits is preceded by one DropWarn. Replies and lifecycle
//! packets wait for queue space.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use elvin_core::{
    ActivitySignal, Environment, ExpressionEngine, FrameError, Listener, Outgoing, WriterExit,
    framing::read_packet, run_writer,
};
use elvin_proto::{
    Packet,
    payloads::{Disconn, DisconnReason},
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::RouterConfig,
    error::RouterError,
    router::{RouterAction, RouterCore},
    session::SessionInfo,
};

/// Outbound side of one connection.
#[derive(Debug, Clone)]
struct Link {
    queue: mpsc::Sender<Outgoing>,
    dropped: Arc<AtomicBool>,
    kill: Arc<Notify>,
}

#[derive(Debug)]
struct Sinks {
    removals: mpsc::UnboundedSender<u32>,
    notify: mpsc::UnboundedSender<RouterAction>,
    subscriptions: mpsc::UnboundedSender<RouterAction>,
    quenches: mpsc::UnboundedSender<RouterAction>,
}

#[derive(Debug)]
struct Shared<E: Environment, X: ExpressionEngine> {
    core: RouterCore<E, X>,
    env: E,
    links: Mutex<HashMap<u32, Link>>,
    sinks: Sinks,
    shutdown: watch::Sender<bool>,
}

/// Router runtime handle.
///
/// Dropping the handle stops the background sinks; connection tasks already
/// running finish on their own.
#[derive(Debug)]
pub struct RouterServer<E: Environment, X: ExpressionEngine> {
    shared: Arc<Shared<E, X>>,
    sink_tasks: Vec<JoinHandle<()>>,
}

impl<E: Environment, X: ExpressionEngine> RouterServer<E, X> {
    /// Build the router and start its background sinks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(env: E, engine: X, config: RouterConfig) -> Self {
        let (removals, removal_rx) = mpsc::unbounded_channel();
        let (notify, notify_rx) = mpsc::unbounded_channel();
        let (subscriptions, subscription_rx) = mpsc::unbounded_channel();
        let (quenches, quench_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            core: RouterCore::new(env.clone(), engine, config),
            env,
            links: Mutex::new(HashMap::new()),
            sinks: Sinks { removals, notify, subscriptions, quenches },
            shutdown,
        });

        let sink_tasks = vec![
            tokio::spawn(Shared::run_removals(Arc::clone(&shared), removal_rx)),
            tokio::spawn(Shared::run_sink(Arc::clone(&shared), notify_rx)),
            tokio::spawn(Shared::run_sink(Arc::clone(&shared), subscription_rx)),
            tokio::spawn(Shared::run_sink(Arc::clone(&shared), quench_rx)),
        ];
        Self { shared, sink_tasks }
    }

    /// The sans-IO core.
    pub fn core(&self) -> &RouterCore<E, X> {
        &self.shared.core
    }

    /// Accept connections from `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<(), RouterError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        tracing::info!(address = %listener.local_addr()?, "listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tokio::spawn(Shared::run_connection(Arc::clone(&self.shared), stream, peer));
                },
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    tracing::info!("listener stopped");
                    return Ok(());
                },
            }
        }
    }

    /// Send `Disconn(1)` to every client and stop accepting.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.shared.core.session_count(), "shutting down");
        let actions = self.shared.core.broadcast_disconnect(&Disconn::new(DisconnReason::Shutdown));
        self.shared.execute_all(actions).await;
        self.shared.shutdown.send_replace(true);
    }

    /// Redirect every client to the configured failover address.
    ///
    /// Returns `false` when no failover address is configured.
    pub async fn redirect_all(&self) -> bool {
        let Some(address) = self.shared.core.config().failover.clone() else {
            tracing::warn!("redirect requested but no failover address is configured");
            return false;
        };
        tracing::info!(%address, "redirecting clients");
        let actions = self.shared.core.broadcast_disconnect(&Disconn::redirect(address));
        self.shared.execute_all(actions).await;
        true
    }

    /// Log one line per session and return the same summaries.
    pub fn dump_clients(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.core.describe_sessions();
        tracing::info!(count = sessions.len(), "client list");
        for info in &sessions {
            tracing::info!(
                session = %format_args!("{:08x}", info.id),
                peer = %info.peer,
                state = ?info.state,
                subscriptions = info.subscriptions,
                quenches = info.quenches,
                "client"
            );
        }
        sessions
    }

    /// Close a session's transport without a Disconn.
    pub fn abort(&self, session: u32) -> bool {
        let link = self.shared.links.lock().get(&session).cloned();
        link.is_some_and(|link| {
            tracing::info!(session = %format_args!("{session:08x}"), "aborting connection");
            link.kill.notify_one();
            true
        })
    }

    /// Close every session's transport.
    pub fn abort_all(&self) {
        let links: Vec<Link> = self.shared.links.lock().values().cloned().collect();
        for link in links {
            link.kill.notify_one();
        }
    }
}

impl<E: Environment, X: ExpressionEngine> Drop for RouterServer<E, X> {
    fn drop(&mut self) {
        for task in &self.sink_tasks {
            task.abort();
        }
    }
}

impl<E: Environment, X: ExpressionEngine> Shared<E, X> {
    fn link(&self, session: u32) -> Option<Link> {
        self.links.lock().get(&session).cloned()
    }

    async fn execute_all(&self, actions: Vec<RouterAction>) {
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&self, action: RouterAction) {
        match action {
            RouterAction::Send { session, packet } => {
                if let Some(link) = self.link(session) {
                    if link.queue.send(packet.into()).await.is_err() {
                        tracing::debug!(session = %format_args!("{session:08x}"), "send after writer exit");
                    }
                }
            },
            RouterAction::Deliver { session, packet } => {
                if let Some(link) = self.link(session) {
                    deliver(session, &link, packet);
                }
            },
            RouterAction::Close { session, reason } => {
                if let Some(link) = self.link(session) {
                    let _ = link.queue.send(Outgoing::Close { reason }).await;
                }
            },
            RouterAction::Dispatch(_) => forward(&self.sinks.notify, action),
            RouterAction::SubscriptionChanged(_) => forward(&self.sinks.subscriptions, action),
            RouterAction::QuenchChanged(_) => forward(&self.sinks.quenches, action),
        }
    }

    async fn run_sink(self: Arc<Self>, mut actions: mpsc::UnboundedReceiver<RouterAction>) {
        while let Some(action) = actions.recv().await {
            let resolved = self.core.resolve(action);
            self.execute_all(resolved).await;
        }
    }

    async fn run_removals(self: Arc<Self>, mut removals: mpsc::UnboundedReceiver<u32>) {
        while let Some(session) = removals.recv().await {
            let actions = self.core.close_session(session);
            self.execute_all(actions).await;
        }
    }

    async fn run_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(id) = self.core.open_session(peer) else {
            return;
        };
        let (mut reader, writer) = tokio::io::split(stream);
        let (queue, queue_rx) = mpsc::channel(self.core.config().queue_capacity.max(1));
        let link = Link { queue, dropped: Arc::new(AtomicBool::new(false)), kill: Arc::new(Notify::new()) };
        let kill = Arc::clone(&link.kill);
        self.links.lock().insert(id, link);

        let activity = ActivitySignal::new();
        let mut writer_task = tokio::spawn(run_writer(
            writer,
            queue_rx,
            activity.clone(),
            self.core.config().keepalive,
            self.env.clone(),
        ));

        let reason = tokio::select! {
            reason = self.read_loop(id, &mut reader, &activity) => {
                // Let the writer flush what the reader queued last.
                self.links.lock().remove(&id);
                let grace = self.core.config().shutdown_grace;
                tokio::select! {
                    _ = &mut writer_task => {},
                    () = self.env.sleep(grace) => writer_task.abort(),
                }
                reason
            },
            exit = &mut writer_task => match exit {
                Ok(Ok(WriterExit::Closed { reason } | WriterExit::Unresponsive { reason })) => reason,
                Ok(Ok(WriterExit::Drained)) => "queue closed".to_owned(),
                Ok(Err(error)) => {
                    tracing::error!(session = %format_args!("{id:08x}"), %error, "write failed");
                    error.to_string()
                },
                Err(error) => error.to_string(),
            },
            () = kill.notified() => {
                writer_task.abort();
                "aborted".to_owned()
            },
            reason = self.handshake_deadline(id) => {
                writer_task.abort();
                reason
            },
        };

        self.links.lock().remove(&id);
        tracing::debug!(session = %format_args!("{id:08x}"), %reason, "connection task ending");
        let _ = self.sinks.removals.send(id);
    }

    /// Resolves only if the session is still waiting for ConnRqst when the
    /// handshake timeout expires.
    async fn handshake_deadline(&self, id: u32) -> String {
        self.env.sleep(self.core.config().handshake_timeout).await;
        match self.core.expire_handshake(id).into_iter().next() {
            Some(RouterAction::Close { reason, .. }) => reason,
            _ => std::future::pending().await,
        }
    }

    async fn read_loop<R>(&self, id: u32, reader: &mut R, activity: &ActivitySignal) -> String
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let max_len = self.core.max_frame_length(id);
            let packet = match read_packet(reader, max_len).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return "end of stream".to_owned(),
                Err(error @ (FrameError::Decode(_) | FrameError::TooLarge { .. })) => {
                    tracing::warn!(session = %format_args!("{id:08x}"), %error, "bad frame");
                    let disconn = Packet::from(Disconn::new(DisconnReason::ProtocolViolation));
                    self.execute(RouterAction::Send { session: id, packet: disconn }).await;
                    return error.to_string();
                },
                Err(error) => {
                    tracing::error!(session = %format_args!("{id:08x}"), %error, "read failed");
                    return error.to_string();
                },
            };
            activity.mark();
            let actions = self.core.handle_packet(id, packet);
            self.execute_all(actions).await;
        }
    }
}

fn forward(sink: &mpsc::UnboundedSender<RouterAction>, action: RouterAction) {
    if sink.send(action).is_err() {
        tracing::error!("router sink stopped");
    }
}

fn deliver(session: u32, link: &Link, packet: Packet) {
    if link.dropped.load(Ordering::Acquire) {
        if link.queue.try_send(Packet::DropWarn.into()).is_err() {
            return;
        }
        link.dropped.store(false, Ordering::Release);
    }
    match link.queue.try_send(packet.into()) {
        Ok(()) => {},
        Err(mpsc::error::TrySendError::Full(_)) => {
            if !link.dropped.swap(true, Ordering::AcqRel) {
                tracing::warn!(session = %format_args!("{session:08x}"), "outbound queue full, dropping deliveries");
            }
        },
        Err(mpsc::error::TrySendError::Closed(_)) => {},
    }
}
