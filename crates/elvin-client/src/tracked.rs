//! Client-side record of every live subscription and quench.
//!
//! The tracker outlives individual router connections. It keeps what each
//! registration was created with, so it can be replayed on a new connection,
//! and maps router ids back to handles so the reader can route deliveries.
//!
//! ```text
//! router id ──routes──> LocalKey ──entries──> tracked registration ──> handle
//! ```
//!
//! Routes belong to one connection. Reconnection snapshots them, clears them
//! and rebuilds them from the replayed replies; a failed replay restores the
//! snapshot.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use elvin_proto::{
    KeyBlock, Packet, Xid, XidSource,
    payloads::{NotifyDeliver, QnchAddRqst, SubAddRqst},
};
use tokio::sync::mpsc;

use crate::handle::{
    LocalKey, Notified, Quench, QuenchNotice, QuenchUpdate, Subscription, SubscriptionUpdate,
    name_set,
};

/// Which registration a reply binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Subscription(LocalKey),
    Quench(LocalKey),
}

#[derive(Debug)]
struct TrackedSubscription {
    expression: String,
    accept_insecure: bool,
    keys: KeyBlock,
    id: Arc<AtomicU64>,
    deliveries: mpsc::UnboundedSender<Notified>,
}

#[derive(Debug)]
struct TrackedQuench {
    names: BTreeSet<String>,
    deliver_insecure: bool,
    keys: KeyBlock,
    id: Arc<AtomicU64>,
    notices: mpsc::UnboundedSender<QuenchNotice>,
}

/// Route state saved before a replay.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    subscription_routes: HashMap<u64, LocalKey>,
    quench_routes: HashMap<u64, LocalKey>,
    ids: Vec<(Route, u64)>,
}

#[derive(Debug, Default)]
pub(crate) struct Tracker {
    next_key: LocalKey,
    subscriptions: HashMap<LocalKey, TrackedSubscription>,
    quenches: HashMap<LocalKey, TrackedQuench>,
    subscription_routes: HashMap<u64, LocalKey>,
    quench_routes: HashMap<u64, LocalKey>,
}

impl Tracker {
    fn allocate(&mut self) -> LocalKey {
        self.next_key += 1;
        self.next_key
    }

    /// Start tracking a subscription. It receives nothing until bound.
    pub(crate) fn track_subscription(
        &mut self,
        expression: &str,
        accept_insecure: bool,
        keys: &KeyBlock,
    ) -> Subscription {
        let key = self.allocate();
        let id = Arc::new(AtomicU64::new(0));
        let (deliveries, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(key, TrackedSubscription {
            expression: expression.to_owned(),
            accept_insecure,
            keys: keys.clone(),
            id: Arc::clone(&id),
            deliveries,
        });
        Subscription { key, id, deliveries: rx }
    }

    /// Start tracking a quench. It receives nothing until bound.
    pub(crate) fn track_quench(&mut self, names: &[String], deliver_insecure: bool, keys: &KeyBlock) -> Quench {
        let key = self.allocate();
        let id = Arc::new(AtomicU64::new(0));
        let (notices, rx) = mpsc::unbounded_channel();
        self.quenches.insert(key, TrackedQuench {
            names: name_set(names),
            deliver_insecure,
            keys: keys.clone(),
            id: Arc::clone(&id),
            notices,
        });
        Quench { key, id, notices: rx }
    }

    /// Point `router_id` at a registration, replacing its previous route.
    pub(crate) fn bind(&mut self, route: Route, router_id: u64) {
        match route {
            Route::Subscription(key) => {
                let Some(entry) = self.subscriptions.get(&key) else {
                    return;
                };
                let previous = entry.id.swap(router_id, Ordering::AcqRel);
                if self.subscription_routes.get(&previous) == Some(&key) {
                    self.subscription_routes.remove(&previous);
                }
                self.subscription_routes.insert(router_id, key);
            },
            Route::Quench(key) => {
                let Some(entry) = self.quenches.get(&key) else {
                    return;
                };
                let previous = entry.id.swap(router_id, Ordering::AcqRel);
                if self.quench_routes.get(&previous) == Some(&key) {
                    self.quench_routes.remove(&previous);
                }
                self.quench_routes.insert(router_id, key);
            },
        }
    }

    /// Stop tracking a registration. Its handle sees the end of its stream.
    pub(crate) fn forget(&mut self, route: Route) {
        match route {
            Route::Subscription(key) => {
                self.subscription_routes.retain(|_, routed| *routed != key);
                self.subscriptions.remove(&key);
            },
            Route::Quench(key) => {
                self.quench_routes.retain(|_, routed| *routed != key);
                self.quenches.remove(&key);
            },
        }
    }

    /// Record a modification the router accepted.
    pub(crate) fn update_subscription(&mut self, key: LocalKey, update: &SubscriptionUpdate) {
        let Some(entry) = self.subscriptions.get_mut(&key) else {
            return;
        };
        if let Some(expression) = update.expression.as_ref().filter(|expression| !expression.is_empty()) {
            entry.expression.clone_from(expression);
        }
        if let Some(accept_insecure) = update.accept_insecure {
            entry.accept_insecure = accept_insecure;
        }
        entry.keys.add(&update.add_keys);
        entry.keys.remove(&update.del_keys);
    }

    /// Record a modification the router accepted.
    pub(crate) fn update_quench(&mut self, key: LocalKey, update: &QuenchUpdate) {
        let Some(entry) = self.quenches.get_mut(&key) else {
            return;
        };
        entry.names.extend(update.add_names.iter().cloned());
        for name in &update.del_names {
            entry.names.remove(name);
        }
        if let Some(deliver_insecure) = update.deliver_insecure {
            entry.deliver_insecure = deliver_insecure;
        }
        entry.keys.add(&update.add_keys);
        entry.keys.remove(&update.del_keys);
    }

    /// Hand a delivery to each matched subscription. Returns how many took it.
    ///
    /// Ids with no route (a registration deleted while the delivery was in
    /// flight) are skipped.
    pub(crate) fn deliver(&self, deliver: &NotifyDeliver) -> usize {
        let secure = deliver.secure_matches.iter().map(|id| (*id, true));
        let insecure = deliver.insecure_matches.iter().map(|id| (*id, false));
        let mut seen = BTreeSet::new();
        let mut delivered = 0;
        for (router_id, secure) in secure.chain(insecure) {
            let Some(key) = self.subscription_routes.get(&router_id) else {
                tracing::debug!(router_id, "delivery for unknown subscription");
                continue;
            };
            if !seen.insert(*key) {
                continue;
            }
            let Some(entry) = self.subscriptions.get(key) else {
                continue;
            };
            let notified = Notified { attributes: deliver.attributes.clone(), secure };
            if entry.deliveries.send(notified).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Hand a change notice to each listed quench.
    pub(crate) fn quench_notice(&self, quench_ids: &[u64], notice: &QuenchNotice) {
        for router_id in quench_ids {
            let entry = self.quench_routes.get(router_id).and_then(|key| self.quenches.get(key));
            match entry {
                Some(entry) => {
                    let _ = entry.notices.send(notice.clone());
                },
                None => tracing::debug!(router_id, "notice for unknown quench"),
            }
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    #[allow(dead_code)]
    pub(crate) fn quench_count(&self) -> usize {
        self.quenches.len()
    }

    /// Save the current routes and ids.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let subscription_ids = self
            .subscriptions
            .iter()
            .map(|(key, entry)| (Route::Subscription(*key), entry.id.load(Ordering::Acquire)));
        let quench_ids =
            self.quenches.iter().map(|(key, entry)| (Route::Quench(*key), entry.id.load(Ordering::Acquire)));
        Snapshot {
            subscription_routes: self.subscription_routes.clone(),
            quench_routes: self.quench_routes.clone(),
            ids: subscription_ids.chain(quench_ids).collect(),
        }
    }

    /// Put back routes and ids saved by [`snapshot`](Self::snapshot).
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.subscription_routes = snapshot.subscription_routes;
        self.quench_routes = snapshot.quench_routes;
        for (route, id) in snapshot.ids {
            let entry_id = match route {
                Route::Subscription(key) => self.subscriptions.get(&key).map(|entry| &entry.id),
                Route::Quench(key) => self.quenches.get(&key).map(|entry| &entry.id),
            };
            if let Some(entry_id) = entry_id {
                entry_id.store(id, Ordering::Release);
            }
        }
    }

    /// Drop every route; the ids they named belong to a dead connection.
    pub(crate) fn clear_routes(&mut self) {
        self.subscription_routes.clear();
        self.quench_routes.clear();
    }

    /// Add requests recreating every registration, each with a fresh xid.
    pub(crate) fn replay_requests(&self, xids: &XidSource) -> Vec<(Route, Xid, Packet)> {
        let mut requests = Vec::with_capacity(self.subscriptions.len() + self.quenches.len());
        let mut subscriptions: Vec<_> = self.subscriptions.iter().collect();
        subscriptions.sort_by_key(|(key, _)| **key);
        for (key, entry) in subscriptions {
            let xid = xids.next_xid();
            let request = SubAddRqst {
                xid,
                expression: entry.expression.clone(),
                accept_insecure: entry.accept_insecure,
                keys: entry.keys.clone(),
            };
            requests.push((Route::Subscription(*key), xid, request.into()));
        }
        let mut quenches: Vec<_> = self.quenches.iter().collect();
        quenches.sort_by_key(|(key, _)| **key);
        for (key, entry) in quenches {
            let xid = xids.next_xid();
            let request = QnchAddRqst {
                xid,
                names: entry.names.iter().cloned().collect(),
                deliver_insecure: entry.deliver_insecure,
                keys: entry.keys.clone(),
            };
            requests.push((Route::Quench(*key), xid, request.into()));
        }
        requests
    }
}
