//! Public client handle.

use std::sync::Arc;

use elvin_core::{ConnectionState, Environment, Transport};
use elvin_proto::{
    ConnectionOptions, KeyBlock, Notification, Packet, PacketType, Xid, XidSource,
    payloads::{
        ConnRqst, NotifyEmit, QnchAddRqst, QnchDelRqst, QnchModRqst, SecRqst, SubAddRqst, SubDelRqst,
        SubModRqst,
    },
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::ClientConfig,
    error::ClientError,
    events::{ClientEvent, DisconnectReason},
    handle::{KeyChanges, Quench, QuenchUpdate, Subscription, SubscriptionUpdate},
    link::{Link, LinkContext, LinkDown, expect_reply},
    reconnect,
    tracked::{Route, Tracker},
};

/// Mutable connection bookkeeping.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) address: String,
    pub(crate) link: Option<Arc<Link>>,
    pub(crate) generation: u64,
    pub(crate) options: ConnectionOptions,
    pub(crate) notification_keys: KeyBlock,
    pub(crate) subscription_keys: KeyBlock,
    /// Set by [`Client::disconnect`]; stops reconnection.
    pub(crate) closing: bool,
}

#[derive(Debug)]
pub(crate) struct Inner<T: Transport, E: Environment> {
    pub(crate) transport: T,
    pub(crate) env: E,
    pub(crate) config: ClientConfig,
    pub(crate) xids: XidSource,
    pub(crate) tracker: Arc<Mutex<Tracker>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) slot: Mutex<Slot>,
    down: mpsc::UnboundedSender<LinkDown>,
}

impl<T: Transport, E: Environment> Inner<T, E> {
    fn current_link(&self) -> Result<Arc<Link>, ClientError> {
        self.slot.lock().link.clone().ok_or(ClientError::NotConnected)
    }

    pub(crate) fn address(&self) -> String {
        self.slot.lock().address.clone()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.slot.lock().closing
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Open a transport to `address` and complete the handshake.
    ///
    /// The new link is not installed; deliveries for routes it binds are
    /// still handed to the tracker.
    pub(crate) async fn establish(&self, address: &str) -> Result<(Link, ConnectionOptions), ClientError> {
        let stream = self.transport.connect(address).await?;
        let (generation, request) = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            let request = ConnRqst {
                options: self.config.options.clone(),
                notification_keys: slot.notification_keys.clone(),
                subscription_keys: slot.subscription_keys.clone(),
                ..ConnRqst::new(self.xids.next_xid())
            };
            (slot.generation, request)
        };

        let context = LinkContext {
            tracker: Arc::clone(&self.tracker),
            events: self.events.clone(),
            down: self.down.clone(),
        };
        let link = Link::open(stream, generation, self.env.clone(), &self.config, context);
        match link.handshake(request, &self.env, self.config.request_timeout).await {
            Ok(reply) => {
                tracing::info!(%address, generation, "connected to router");
                Ok((link, reply.options))
            },
            Err(error) => {
                link.close("handshake failed").await;
                Err(error)
            },
        }
    }

    /// Make `link` the live connection.
    pub(crate) fn install(&self, link: Link, options: ConnectionOptions) {
        let mut slot = self.slot.lock();
        slot.link = Some(Arc::new(link));
        slot.options = options;
    }

    /// Take the live link if it has the given generation.
    pub(crate) fn detach(&self, generation: u64) -> Option<Arc<Link>> {
        let mut slot = self.slot.lock();
        if slot.link.as_ref().is_some_and(|link| link.generation() == generation) {
            slot.link.take()
        } else {
            None
        }
    }

    pub(crate) fn set_address(&self, address: &str) {
        self.slot.lock().address = address.to_owned();
    }
}

/// Elvin client.
///
/// Cloning is cheap; clones share one router connection. The connection is
/// closed when the last clone is dropped.
///
/// # Reconnection
///
/// When the connection is lost or the router shuts down, the client
/// reconnects according to [`crate::ReconnectPolicy`] and replays every
/// live subscription and quench. A redirect reconnects straight away to the
/// address the router named. Handles keep working across a reconnect; their
/// `id()` changes to the new router-assigned id.
#[derive(Debug)]
pub struct Client<T: Transport, E: Environment> {
    inner: Arc<Inner<T, E>>,
}

impl<T: Transport, E: Environment> Clone for Client<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Transport, E: Environment> Client<T, E> {
    /// Connect to the router at `address`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn connect(transport: T, env: E, address: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (down, down_rx) = mpsc::unbounded_channel();
        let slot = Slot {
            address: address.to_owned(),
            link: None,
            generation: 0,
            options: ConnectionOptions::new(),
            notification_keys: config.notification_keys.clone(),
            subscription_keys: config.subscription_keys.clone(),
            closing: false,
        };
        let inner = Arc::new(Inner {
            transport,
            env,
            config,
            xids: XidSource::new(),
            tracker: Arc::new(Mutex::new(Tracker::default())),
            events,
            slot: Mutex::new(slot),
            down,
        });

        let (link, options) = inner.establish(address).await?;
        inner.install(link, options);
        tokio::spawn(reconnect::supervise(Arc::downgrade(&inner), down_rx));
        Ok(Self { inner })
    }

    /// Close the connection gracefully and stop reconnecting.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let link = {
            let mut slot = self.inner.slot.lock();
            slot.closing = true;
            slot.link.take()
        };
        let link = link.ok_or(ClientError::NotConnected)?;
        let timeout = self.inner.config.request_timeout;
        let result = link.disconnect(self.inner.xids.next_xid(), &self.inner.env, timeout).await;
        tracing::info!("disconnected from router");
        self.inner.emit(ClientEvent::Disconnected { reason: DisconnectReason::Requested });
        result
    }

    /// Ask the router for a ConfConn and wait for its answer.
    pub async fn test_conn(&self) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        link.test_conn(&self.inner.env, self.inner.config.request_timeout).await
    }

    /// Emit a notification.
    ///
    /// The router sends no reply; this returns once the packet is queued.
    pub async fn notify(&self, attributes: Notification, deliver_insecure: bool, keys: KeyBlock) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        link.send(NotifyEmit { attributes, deliver_insecure, keys }.into()).await
    }

    /// Register a subscription.
    pub async fn subscribe(&self, expression: &str, accept_insecure: bool, keys: KeyBlock) -> Result<Subscription, ClientError> {
        let link = self.inner.current_link()?;
        let subscription = self.inner.tracker.lock().track_subscription(expression, accept_insecure, &keys);
        let route = Route::Subscription(subscription.key);
        let xid = self.inner.xids.next_xid();
        let request = SubAddRqst { xid, expression: expression.to_owned(), accept_insecure, keys };

        let reply = self.request(&link, xid, request.into(), Some(route)).await;
        match reply.and_then(|reply| expect_reply(reply, PacketType::SubRply)) {
            Ok(()) => {
                tracing::debug!(id = subscription.id(), %expression, "subscribed");
                Ok(subscription)
            },
            Err(error) => {
                self.inner.tracker.lock().forget(route);
                Err(error)
            },
        }
    }

    /// Change a subscription.
    ///
    /// An empty or absent expression leaves the filter unchanged.
    pub async fn subscription_modify(&self, subscription: &Subscription, update: SubscriptionUpdate) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        let xid = self.inner.xids.next_xid();
        let request = SubModRqst {
            expression: update.expression.clone().unwrap_or_default(),
            accept_insecure: update.accept_insecure,
            add_keys: update.add_keys.clone(),
            del_keys: update.del_keys.clone(),
            ..SubModRqst::new(xid, subscription.id())
        };
        let route = Route::Subscription(subscription.key);
        let reply = self.request(&link, xid, request.into(), Some(route)).await?;
        expect_reply(reply, PacketType::SubRply)?;
        self.inner.tracker.lock().update_subscription(subscription.key, &update);
        Ok(())
    }

    /// Remove a subscription. Its handle's stream ends.
    pub async fn subscription_delete(&self, subscription: &Subscription) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        let xid = self.inner.xids.next_xid();
        let request = SubDelRqst { xid, subscription_id: subscription.id() };
        let reply = self.request(&link, xid, request.into(), None).await?;
        expect_reply(reply, PacketType::SubRply)?;
        self.inner.tracker.lock().forget(Route::Subscription(subscription.key));
        Ok(())
    }

    /// Register a quench over the named attributes.
    pub async fn quench(&self, names: &[String], deliver_insecure: bool, keys: KeyBlock) -> Result<Quench, ClientError> {
        let link = self.inner.current_link()?;
        let quench = self.inner.tracker.lock().track_quench(names, deliver_insecure, &keys);
        let route = Route::Quench(quench.key);
        let xid = self.inner.xids.next_xid();
        let request = QnchAddRqst { xid, names: names.to_vec(), deliver_insecure, keys };

        let reply = self.request(&link, xid, request.into(), Some(route)).await;
        match reply.and_then(|reply| expect_reply(reply, PacketType::QnchRply)) {
            Ok(()) => {
                tracing::debug!(id = quench.id(), ?names, "quench placed");
                Ok(quench)
            },
            Err(error) => {
                self.inner.tracker.lock().forget(route);
                Err(error)
            },
        }
    }

    /// Change a quench.
    pub async fn quench_modify(&self, quench: &Quench, update: QuenchUpdate) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        let xid = self.inner.xids.next_xid();
        let request = QnchModRqst {
            add_names: update.add_names.clone(),
            del_names: update.del_names.clone(),
            deliver_insecure: update.deliver_insecure,
            add_keys: update.add_keys.clone(),
            del_keys: update.del_keys.clone(),
            ..QnchModRqst::new(xid, quench.id())
        };
        let route = Route::Quench(quench.key);
        let reply = self.request(&link, xid, request.into(), Some(route)).await?;
        expect_reply(reply, PacketType::QnchRply)?;
        self.inner.tracker.lock().update_quench(quench.key, &update);
        Ok(())
    }

    /// Remove a quench. Its handle's stream ends.
    pub async fn quench_delete(&self, quench: &Quench) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        let xid = self.inner.xids.next_xid();
        let request = QnchDelRqst { xid, quench_id: quench.id() };
        let reply = self.request(&link, xid, request.into(), None).await?;
        expect_reply(reply, PacketType::QnchRply)?;
        self.inner.tracker.lock().forget(Route::Quench(quench.key));
        Ok(())
    }

    /// Change the connection-level keys.
    ///
    /// The new keys are also used for every later reconnect.
    pub async fn set_keys(&self, changes: KeyChanges) -> Result<(), ClientError> {
        let link = self.inner.current_link()?;
        let xid = self.inner.xids.next_xid();
        let request = SecRqst {
            xid,
            add_notification_keys: changes.add_notification_keys.clone(),
            del_notification_keys: changes.del_notification_keys.clone(),
            add_subscription_keys: changes.add_subscription_keys.clone(),
            del_subscription_keys: changes.del_subscription_keys.clone(),
        };
        let reply = self.request(&link, xid, request.into(), None).await?;
        expect_reply(reply, PacketType::SecRply)?;

        let mut slot = self.inner.slot.lock();
        slot.notification_keys.add(&changes.add_notification_keys);
        slot.notification_keys.remove(&changes.del_notification_keys);
        slot.subscription_keys.add(&changes.add_subscription_keys);
        slot.subscription_keys.remove(&changes.del_subscription_keys);
        Ok(())
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// State of the current connection; `Closed` while none is open.
    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().link.as_ref().map_or(ConnectionState::Closed, |link| link.state())
    }

    /// Router address in use, updated by redirects.
    pub fn address(&self) -> String {
        self.inner.address()
    }

    /// Connection options the router accepted.
    pub fn options(&self) -> ConnectionOptions {
        self.inner.slot.lock().options.clone()
    }

    async fn request(&self, link: &Link, xid: Xid, packet: Packet, route: Option<Route>) -> Result<Packet, ClientError> {
        link.request(xid, packet, route, &self.inner.env, self.inner.config.request_timeout).await
    }
}
