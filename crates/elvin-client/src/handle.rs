//! Subscription and quench handles.
//!
//! A handle is the application's end of a registration. Its `id()` reads
//! the router-assigned id, which changes when the client reconnects and
//! replays the registration. Deliveries queue on an unbounded channel until
//! `next()` takes them.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use elvin_proto::{KeyBlock, Notification};
use tokio::sync::mpsc;

/// Client-side identity of a registration, stable across reconnects.
pub(crate) type LocalKey = u64;

/// A notification delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notified {
    /// Notification content.
    pub attributes: Notification,
    /// True when a key match authorized the delivery.
    pub secure: bool,
}

/// Router report about a subscription whose attributes a quench covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuenchNotice {
    /// A matching subscription was added, or existed when the quench was
    /// placed.
    SubscriptionAdded {
        /// Router id of the subscription.
        term_id: u64,
        /// Subscription expression.
        expression: String,
        /// Only the insecure flags allowed the match.
        insecure: bool,
    },
    /// A matching subscription changed.
    SubscriptionModified {
        /// Router id of the subscription.
        term_id: u64,
        /// New expression.
        expression: String,
        /// Only the insecure flags allowed the match.
        insecure: bool,
    },
    /// A matching subscription went away.
    SubscriptionRemoved {
        /// Router id of the subscription.
        term_id: u64,
    },
}

/// Changes to apply with [`crate::Client::subscription_modify`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    /// Replacement expression.
    pub expression: Option<String>,
    /// New insecure-delivery flag.
    pub accept_insecure: Option<bool>,
    /// Keys to add.
    pub add_keys: KeyBlock,
    /// Keys to remove.
    pub del_keys: KeyBlock,
}

/// Changes to apply with [`crate::Client::quench_modify`].
#[derive(Debug, Clone, Default)]
pub struct QuenchUpdate {
    /// Attribute names to add.
    pub add_names: Vec<String>,
    /// Attribute names to remove.
    pub del_names: Vec<String>,
    /// New insecure flag.
    pub deliver_insecure: Option<bool>,
    /// Keys to add.
    pub add_keys: KeyBlock,
    /// Keys to remove.
    pub del_keys: KeyBlock,
}

/// Changes to the connection-level keys, applied with
/// [`crate::Client::set_keys`].
#[derive(Debug, Clone, Default)]
pub struct KeyChanges {
    /// Notification keys to add.
    pub add_notification_keys: KeyBlock,
    /// Notification keys to remove.
    pub del_notification_keys: KeyBlock,
    /// Subscription keys to add.
    pub add_subscription_keys: KeyBlock,
    /// Subscription keys to remove.
    pub del_subscription_keys: KeyBlock,
}

/// A live subscription.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) key: LocalKey,
    pub(crate) id: Arc<AtomicU64>,
    pub(crate) deliveries: mpsc::UnboundedReceiver<Notified>,
}

impl Subscription {
    /// Current router-assigned id.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the subscription is deleted or the client is
    /// dropped.
    pub async fn next(&mut self) -> Option<Notified> {
        self.deliveries.recv().await
    }

    /// Take a delivery that has already arrived.
    pub fn try_next(&mut self) -> Option<Notified> {
        self.deliveries.try_recv().ok()
    }
}

/// A live quench.
#[derive(Debug)]
pub struct Quench {
    pub(crate) key: LocalKey,
    pub(crate) id: Arc<AtomicU64>,
    pub(crate) notices: mpsc::UnboundedReceiver<QuenchNotice>,
}

impl Quench {
    /// Current router-assigned id.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Wait for the next change notice.
    pub async fn next(&mut self) -> Option<QuenchNotice> {
        self.notices.recv().await
    }

    /// Take a notice that has already arrived.
    pub fn try_next(&mut self) -> Option<QuenchNotice> {
        self.notices.try_recv().ok()
    }
}

pub(crate) fn name_set(names: &[String]) -> BTreeSet<String> {
    names.iter().cloned().collect()
}
