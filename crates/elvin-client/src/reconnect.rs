//! Reconnect supervisor.
//!
//! One task per client waits for [`LinkDown`] reports. A report for the live
//! link raises `Disconnected` and, depending on the reason, starts a
//! reconnect sequence:
//!
//! | reason                          | action                               |
//! |---------------------------------|--------------------------------------|
//! | connection lost, router shutdown| backoff loop, if the policy allows   |
//! | redirect                        | immediate attempt at the new address |
//! | protocol error or violation     | stay disconnected                    |
//!
//! A new link only becomes live after every tracked subscription and quench
//! has been replayed on it. If any replay fails, the tracker's routes and ids
//! are restored, the new link is disconnected and `ReconnectFailed` is
//! raised.
//!
//! The supervisor holds a `Weak` reference, so dropping the last
//! [`crate::Client`] ends it.

use std::sync::Weak;

use elvin_core::{Environment, Transport};
use elvin_proto::{ConnectionOptions, PacketType};
use tokio::sync::mpsc;

use crate::{
    backoff::Backoff,
    client::Inner,
    events::{ClientEvent, DisconnectReason},
    link::{Link, LinkDown, expect_reply},
    tracked::Route,
};

pub(crate) async fn supervise<T: Transport, E: Environment>(
    inner: Weak<Inner<T, E>>,
    mut down: mpsc::UnboundedReceiver<LinkDown>,
) {
    while let Some(LinkDown { generation, reason }) = down.recv().await {
        let Some(client) = inner.upgrade() else {
            return;
        };
        if client.detach(generation).is_none() {
            tracing::trace!(generation, "ignoring report from a retired link");
            continue;
        }
        tracing::info!(generation, ?reason, "lost router connection");
        client.emit(ClientEvent::Disconnected { reason: reason.clone() });

        let policy = client.config.reconnect;
        let redirected = match &reason {
            DisconnectReason::Redirect(address) => {
                tracing::info!(%address, "router redirected client");
                client.set_address(address);
                true
            },
            _ => false,
        };
        drop(client);

        if redirected || (policy.enabled && reason.is_recoverable()) {
            reconnect(&inner, redirected).await;
        }
    }
}

async fn reconnect<T: Transport, E: Environment>(inner: &Weak<Inner<T, E>>, redirected: bool) {
    let Some(client) = inner.upgrade() else {
        return;
    };
    let env = client.env.clone();
    let policy = client.config.reconnect;
    drop(client);

    let mut backoff = Backoff::new(policy);
    let mut immediate = redirected;
    loop {
        if !immediate {
            let Some(delay) = backoff.next_delay(&env) else {
                tracing::warn!(attempts = backoff.attempts(), "giving up on reconnecting");
                if let Some(client) = inner.upgrade() {
                    client.emit(ClientEvent::ReconnectFailed);
                }
                return;
            };
            tracing::debug!(?delay, attempt = backoff.attempts(), "waiting to reconnect");
            env.sleep(delay).await;
        }
        immediate = false;

        let Some(client) = inner.upgrade() else {
            return;
        };
        if client.is_closing() {
            return;
        }
        let address = client.address();
        match client.establish(&address).await {
            Ok((link, options)) => {
                resume(&client, link, options).await;
                return;
            },
            Err(error) if policy.enabled => {
                tracing::info!(%address, %error, "reconnect attempt failed");
            },
            Err(error) => {
                tracing::warn!(%address, %error, "redirect failed");
                client.emit(ClientEvent::ReconnectFailed);
                return;
            },
        }
    }
}

/// Replay every registration on `link`, then make it live.
async fn resume<T: Transport, E: Environment>(client: &Inner<T, E>, link: Link, options: ConnectionOptions) {
    let (snapshot, requests) = {
        let mut tracker = client.tracker.lock();
        let snapshot = tracker.snapshot();
        tracker.clear_routes();
        (snapshot, tracker.replay_requests(&client.xids))
    };
    let replayed = requests.len();

    for (route, xid, request) in requests {
        let expected = match route {
            Route::Subscription(_) => PacketType::SubRply,
            Route::Quench(_) => PacketType::QnchRply,
        };
        let reply = link.request(xid, request, Some(route), &client.env, client.config.request_timeout).await;
        if let Err(error) = reply.and_then(|reply| expect_reply(reply, expected)) {
            tracing::warn!(%error, "replay failed, rolling back");
            client.tracker.lock().restore(snapshot);
            abandon(client, &link).await;
            client.emit(ClientEvent::ReconnectFailed);
            return;
        }
    }

    if client.is_closing() {
        abandon(client, &link).await;
        return;
    }
    client.install(link, options);
    tracing::info!(replayed, "reconnected");
    client.emit(ClientEvent::Reconnected);
}

async fn abandon<T: Transport, E: Environment>(client: &Inner<T, E>, link: &Link) {
    let disconnected = link.disconnect(client.xids.next_xid(), &client.env, client.config.request_timeout).await;
    if let Err(error) = disconnected {
        tracing::debug!(%error, "disconnect of abandoned link failed");
    }
}
