//! Notification fan-out and quench change notices.
//!
//! Both run over a snapshot of the session index. Each session is locked on
//! its own while it is examined, so a registration racing with a dispatch
//! may or may not see that notification.
//!
//! # Delivery buckets
//!
//! A subscription whose filter accepts a notification is checked against the
//! security rules. A key match puts its id in `secure_matches`; a match that
//! only the insecure flags allowed puts it in `insecure_matches`. One
//! NotifyDeliver goes to each connection with at least one match.

use std::sync::Arc;

use elvin_core::{Delivery, PrimedKeys, Quench, Subscription, security::classify};
use elvin_proto::{
    Notification, Packet,
    payloads::{NotifyDeliver, SubAddNotify, SubDelNotify, SubModNotify},
};

use crate::{router::RouterAction, session::Session};

/// A notification waiting to be fanned out.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    /// Connection the notification arrived on.
    pub origin: u32,
    /// Notification content.
    pub attributes: Notification,
    /// Producer allows delivery without a key match.
    pub deliver_insecure: bool,
    /// Keys carried on the notification, primed on arrival.
    pub keys: PrimedKeys,
    /// Producing connection's notification keys at the time of arrival.
    pub connection_keys: PrimedKeys,
}

/// What happened to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// SubAddRqst succeeded.
    Added,
    /// SubModRqst succeeded.
    Modified,
    /// SubDelRqst or connection teardown.
    Removed,
}

/// A subscription change to report to quenchers.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Subscription after the change (before it, for removals).
    pub subscription: Subscription,
    /// Owning connection's subscription keys.
    pub connection_keys: PrimedKeys,
}

/// A new or modified quench that should learn about existing subscriptions.
#[derive(Debug, Clone)]
pub struct QuenchEvent {
    /// Connection owning the quench.
    pub session: u32,
    /// Quench after the change.
    pub quench: Quench,
    /// Owning connection's notification keys.
    pub connection_keys: PrimedKeys,
}

/// Evaluate `request` against every connected session.
pub fn dispatch(sessions: &[Arc<Session>], request: &NotifyRequest) -> Vec<RouterAction> {
    let producer = [&request.keys, &request.connection_keys];
    let mut actions = Vec::new();

    for session in sessions {
        let state = session.lock();
        if !state.connection.is_connected() {
            continue;
        }

        let mut secure_matches = Vec::new();
        let mut insecure_matches = Vec::new();
        for subscription in state.registry.subscriptions() {
            if !subscription.filter.evaluate(&request.attributes) {
                continue;
            }
            let consumer = [&subscription.keys, &state.subscription_keys];
            match classify(request.deliver_insecure, &producer, subscription.accept_insecure, &consumer) {
                Delivery::Secure => secure_matches.push(subscription.id.as_u64()),
                Delivery::Insecure => insecure_matches.push(subscription.id.as_u64()),
                Delivery::Denied => {},
            }
        }
        drop(state);

        if secure_matches.is_empty() && insecure_matches.is_empty() {
            continue;
        }
        let packet = NotifyDeliver {
            attributes: request.attributes.clone(),
            secure_matches,
            insecure_matches,
        };
        actions.push(RouterAction::Deliver { session: session.id(), packet: packet.into() });
    }

    tracing::debug!(origin = request.origin, receivers = actions.len(), "dispatched notification");
    actions
}

/// Quench-side view of the security rules, quench as producer.
fn quench_match(
    quench: &Quench,
    quench_connection: &PrimedKeys,
    subscription: &Subscription,
    subscription_connection: &PrimedKeys,
) -> Option<Delivery> {
    let names = subscription.filter.attribute_names();
    if quench.names.is_disjoint(&names) {
        return None;
    }
    let delivery = classify(
        quench.deliver_insecure,
        &[&quench.keys, quench_connection],
        subscription.accept_insecure,
        &[&subscription.keys, subscription_connection],
    );
    delivery.is_delivered().then_some(delivery)
}

fn notice(kind: ChangeKind, quench_ids: Vec<u64>, subscription: &Subscription, insecure: bool) -> Packet {
    let term_id = subscription.id.as_u64();
    let expression = subscription.expression.clone();
    match kind {
        ChangeKind::Added => SubAddNotify { quench_ids, term_id, expression, insecure }.into(),
        ChangeKind::Modified => SubModNotify { quench_ids, term_id, expression, insecure }.into(),
        ChangeKind::Removed => SubDelNotify { quench_ids, term_id }.into(),
    }
}

/// Tell every interested quencher about a subscription change.
///
/// Sends at most one notice per quenching connection, listing all of its
/// quenches that match. The notice is marked insecure unless every listed
/// quench matched through keys.
pub fn subscription_notices(sessions: &[Arc<Session>], event: &SubscriptionEvent) -> Vec<RouterAction> {
    let mut actions = Vec::new();
    for session in sessions {
        let state = session.lock();
        if !state.connection.is_connected() {
            continue;
        }
        let mut quench_ids = Vec::new();
        let mut insecure = false;
        for quench in state.registry.quenches() {
            let matched =
                quench_match(quench, &state.notification_keys, &event.subscription, &event.connection_keys);
            if let Some(delivery) = matched {
                quench_ids.push(quench.id.as_u64());
                insecure |= delivery == Delivery::Insecure;
            }
        }
        drop(state);

        if !quench_ids.is_empty() {
            let packet = notice(event.kind, quench_ids, &event.subscription, insecure);
            actions.push(RouterAction::Send { session: session.id(), packet });
        }
    }
    actions
}

/// Tell a new or modified quench about every matching subscription.
pub fn quench_notices(sessions: &[Arc<Session>], event: &QuenchEvent) -> Vec<RouterAction> {
    let mut actions = Vec::new();
    for session in sessions {
        let state = session.lock();
        for subscription in state.registry.subscriptions() {
            let matched =
                quench_match(&event.quench, &event.connection_keys, subscription, &state.subscription_keys);
            if let Some(delivery) = matched {
                let insecure = delivery == Delivery::Insecure;
                let packet = notice(ChangeKind::Added, vec![event.quench.id.as_u64()], subscription, insecure);
                actions.push(RouterAction::Send { session: event.session, packet });
            }
        }
    }
    actions
}
