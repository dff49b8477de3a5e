//! Per-connection subscription and quench registries.
//!
//! Each connection owns two slot maps keyed by a 32-bit slot. New slots start
//! at a random value and scan linearly to the next free one. The id handed
//! to the client is `(connection_id << 32) | slot`, so an id also names the
//! connection that owns it.
//!
//! Slots are retired rather than freed on removal: an id is never handed out
//! twice while its connection is alive.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use elvin_proto::KeyBlock;

use crate::{error::RegistryError, expr::Filter, security::PrimedKeys};

/// Router-assigned id of a subscription or quench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyntheticId(u64);

impl SyntheticId {
    /// Combine a connection id and a slot.
    pub fn new(connection_id: u32, slot: u32) -> Self {
        Self((u64::from(connection_id) << 32) | u64::from(slot))
    }

    /// Owning connection.
    pub fn connection_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Slot within the connection.
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    /// Wire form.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SyntheticId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SyntheticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Slot-indexed storage with random-start linear probing.
#[derive(Debug)]
pub struct SlotMap<T> {
    entries: HashMap<u32, T>,
    retired: HashSet<u32>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self { entries: HashMap::new(), retired: HashSet::new() }
    }
}

impl<T> SlotMap<T> {
    /// Store `value` in the first free slot at or after `seed`.
    pub fn insert(&mut self, seed: u32, value: T) -> Result<u32, RegistryError> {
        let used = self.entries.len() + self.retired.len();
        if used > u32::MAX as usize {
            return Err(RegistryError::Exhausted);
        }
        let mut slot = seed;
        while self.entries.contains_key(&slot) || self.retired.contains(&slot) {
            slot = slot.wrapping_add(1);
        }
        self.entries.insert(slot, value);
        Ok(slot)
    }

    /// Look up a slot.
    pub fn get(&self, slot: u32) -> Option<&T> {
        self.entries.get(&slot)
    }

    /// Look up a slot mutably.
    pub fn get_mut(&mut self, slot: u32) -> Option<&mut T> {
        self.entries.get_mut(&slot)
    }

    /// Remove a slot and retire it.
    pub fn remove(&mut self, slot: u32) -> Option<T> {
        let value = self.entries.remove(&slot)?;
        self.retired.insert(slot);
        Some(value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entries in no particular order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Remove and return every live entry.
    pub fn drain(&mut self) -> Vec<T> {
        let slots: Vec<u32> = self.entries.keys().copied().collect();
        self.retired.extend(&slots);
        self.entries.drain().map(|(_, value)| value).collect()
    }
}

/// A registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Router-assigned id.
    pub id: SyntheticId,
    /// Expression source text.
    pub expression: String,
    /// Compiled filter.
    pub filter: Arc<dyn Filter>,
    /// Accept notifications delivered without a key match.
    pub accept_insecure: bool,
    /// Subscription keys, primed for the consumer side.
    pub keys: PrimedKeys,
}

/// Partial update of a subscription.
#[derive(Debug, Default)]
pub struct SubscriptionChange<'a> {
    /// New expression source and filter.
    pub filter: Option<(String, Arc<dyn Filter>)>,
    /// New accept-insecure flag.
    pub accept_insecure: Option<bool>,
    /// Raw keys to add.
    pub add_keys: Option<&'a KeyBlock>,
    /// Raw keys to remove.
    pub del_keys: Option<&'a KeyBlock>,
}

/// A registered quench.
#[derive(Debug, Clone)]
pub struct Quench {
    /// Router-assigned id.
    pub id: SyntheticId,
    /// Attribute names of interest.
    pub names: BTreeSet<String>,
    /// Accept subscription notices without a key match.
    pub deliver_insecure: bool,
    /// Quench keys, primed for the producer side.
    pub keys: PrimedKeys,
}

/// Partial update of a quench.
#[derive(Debug, Default)]
pub struct QuenchChange<'a> {
    /// Names to add.
    pub add_names: &'a [String],
    /// Names to remove.
    pub del_names: &'a [String],
    /// New deliver-insecure flag.
    pub deliver_insecure: Option<bool>,
    /// Raw keys to add.
    pub add_keys: Option<&'a KeyBlock>,
    /// Raw keys to remove.
    pub del_keys: Option<&'a KeyBlock>,
}

/// Subscriptions and quenches owned by one connection.
#[derive(Debug)]
pub struct Registry {
    connection_id: u32,
    subscriptions: SlotMap<Subscription>,
    quenches: SlotMap<Quench>,
}

impl Registry {
    /// Empty registry for `connection_id`.
    pub fn new(connection_id: u32) -> Self {
        Self { connection_id, subscriptions: SlotMap::default(), quenches: SlotMap::default() }
    }

    /// Owning connection.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    fn own_slot(&self, id: u64) -> Option<u32> {
        let id = SyntheticId::from(id);
        (id.connection_id() == self.connection_id).then_some(id.slot())
    }

    /// Register a subscription. `seed` picks the starting slot.
    pub fn add_subscription(
        &mut self,
        seed: u32,
        expression: String,
        filter: Arc<dyn Filter>,
        accept_insecure: bool,
        keys: PrimedKeys,
    ) -> Result<&Subscription, RegistryError> {
        let placeholder = SyntheticId::new(self.connection_id, 0);
        let slot = self.subscriptions.insert(
            seed,
            Subscription { id: placeholder, expression, filter, accept_insecure, keys },
        )?;
        let id = SyntheticId::new(self.connection_id, slot);
        let subscription = self.subscriptions.get_mut(slot).ok_or(RegistryError::Exhausted)?;
        subscription.id = id;
        Ok(subscription)
    }

    /// Apply a partial update. Unknown ids change nothing.
    pub fn modify_subscription(
        &mut self,
        id: u64,
        change: SubscriptionChange<'_>,
    ) -> Result<&Subscription, RegistryError> {
        let subscription = self
            .own_slot(id)
            .and_then(|slot| self.subscriptions.get_mut(slot))
            .ok_or(RegistryError::UnknownSubscription(id))?;
        if let Some((expression, filter)) = change.filter {
            subscription.expression = expression;
            subscription.filter = filter;
        }
        if let Some(accept_insecure) = change.accept_insecure {
            subscription.accept_insecure = accept_insecure;
        }
        if let Some(add) = change.add_keys {
            subscription.keys.add(add);
        }
        if let Some(del) = change.del_keys {
            subscription.keys.remove(del);
        }
        Ok(subscription)
    }

    /// Remove a subscription.
    pub fn remove_subscription(&mut self, id: u64) -> Result<Subscription, RegistryError> {
        self.own_slot(id)
            .and_then(|slot| self.subscriptions.remove(slot))
            .ok_or(RegistryError::UnknownSubscription(id))
    }

    /// Look up a subscription.
    pub fn subscription(&self, id: u64) -> Option<&Subscription> {
        self.own_slot(id).and_then(|slot| self.subscriptions.get(slot))
    }

    /// All live subscriptions.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Register a quench. `seed` picks the starting slot.
    pub fn add_quench(
        &mut self,
        seed: u32,
        names: BTreeSet<String>,
        deliver_insecure: bool,
        keys: PrimedKeys,
    ) -> Result<&Quench, RegistryError> {
        let placeholder = SyntheticId::new(self.connection_id, 0);
        let slot =
            self.quenches.insert(seed, Quench { id: placeholder, names, deliver_insecure, keys })?;
        let id = SyntheticId::new(self.connection_id, slot);
        let quench = self.quenches.get_mut(slot).ok_or(RegistryError::Exhausted)?;
        quench.id = id;
        Ok(quench)
    }

    /// Apply a partial update. Unknown ids change nothing.
    pub fn modify_quench(
        &mut self,
        id: u64,
        change: QuenchChange<'_>,
    ) -> Result<&Quench, RegistryError> {
        let quench = self
            .own_slot(id)
            .and_then(|slot| self.quenches.get_mut(slot))
            .ok_or(RegistryError::UnknownQuench(id))?;
        quench.names.extend(change.add_names.iter().cloned());
        for name in change.del_names {
            quench.names.remove(name);
        }
        if let Some(deliver_insecure) = change.deliver_insecure {
            quench.deliver_insecure = deliver_insecure;
        }
        if let Some(add) = change.add_keys {
            quench.keys.add(add);
        }
        if let Some(del) = change.del_keys {
            quench.keys.remove(del);
        }
        Ok(quench)
    }

    /// Remove a quench.
    pub fn remove_quench(&mut self, id: u64) -> Result<Quench, RegistryError> {
        self.own_slot(id)
            .and_then(|slot| self.quenches.remove(slot))
            .ok_or(RegistryError::UnknownQuench(id))
    }

    /// All live quenches.
    pub fn quenches(&self) -> impl Iterator<Item = &Quench> {
        self.quenches.values()
    }

    /// Number of live quenches.
    pub fn quench_count(&self) -> usize {
        self.quenches.len()
    }

    /// Remove everything, for connection teardown.
    pub fn clear(&mut self) -> (Vec<Subscription>, Vec<Quench>) {
        (self.subscriptions.drain(), self.quenches.drain())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        expr::{BasicExpressions, ExpressionEngine},
        security::Side,
    };

    fn filter(source: &str) -> Arc<dyn Filter> {
        BasicExpressions.parse(source).unwrap()
    }

    fn add(registry: &mut Registry, seed: u32, source: &str) -> u64 {
        registry
            .add_subscription(seed, source.into(), filter(source), true, PrimedKeys::empty(Side::Consumer))
            .unwrap()
            .id
            .as_u64()
    }

    #[test]
    fn id_layout() {
        let id = SyntheticId::new(0xaabb_ccdd, 0x1122_3344);
        assert_eq!(id.as_u64(), 0xaabb_ccdd_1122_3344);
        assert_eq!(id.connection_id(), 0xaabb_ccdd);
        assert_eq!(id.slot(), 0x1122_3344);
    }

    #[test]
    fn add_then_delete_leaves_registry_empty() {
        let mut registry = Registry::new(7);
        let id = add(&mut registry, 100, "require(Group)");
        assert_eq!(SyntheticId::from(id).connection_id(), 7);
        assert_eq!(registry.subscription_count(), 1);

        registry.remove_subscription(id).unwrap();
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.remove_subscription(id).unwrap_err(), RegistryError::UnknownSubscription(id));
    }

    #[test]
    fn colliding_seeds_scan_forward() {
        let mut registry = Registry::new(1);
        let first = add(&mut registry, u32::MAX, "true");
        let second = add(&mut registry, u32::MAX, "true");
        assert_eq!(SyntheticId::from(first).slot(), u32::MAX);
        assert_eq!(SyntheticId::from(second).slot(), 0);
    }

    #[test]
    fn removed_slots_are_not_reused() {
        let mut registry = Registry::new(1);
        let first = add(&mut registry, 5, "true");
        registry.remove_subscription(first).unwrap();
        let second = add(&mut registry, 5, "true");
        assert_ne!(first, second);
    }

    #[test]
    fn modify_without_filter_keeps_expression() {
        let mut registry = Registry::new(3);
        let id = add(&mut registry, 0, "require(Group)");
        let change = SubscriptionChange { accept_insecure: Some(false), ..Default::default() };
        let subscription = registry.modify_subscription(id, change).unwrap();
        assert_eq!(subscription.expression, "require(Group)");
        assert!(!subscription.accept_insecure);
    }

    #[test]
    fn modify_unknown_id_changes_nothing() {
        let mut registry = Registry::new(3);
        let id = add(&mut registry, 0, "require(Group)");
        let foreign = SyntheticId::new(4, SyntheticId::from(id).slot()).as_u64();

        let change = SubscriptionChange {
            filter: Some(("true".into(), filter("true"))),
            ..Default::default()
        };
        assert_eq!(
            registry.modify_subscription(foreign, change).unwrap_err(),
            RegistryError::UnknownSubscription(foreign)
        );
        assert_eq!(registry.subscription(id).unwrap().expression, "require(Group)");
    }

    #[test]
    fn quench_names_are_set_operations() {
        let mut registry = Registry::new(2);
        let names = ["a", "b"].into_iter().map(String::from).collect();
        let id = registry.add_quench(9, names, false, PrimedKeys::empty(Side::Producer)).unwrap().id.as_u64();

        let add_names = vec!["c".to_owned(), "a".to_owned()];
        let del_names = vec!["b".to_owned(), "zz".to_owned()];
        let change = QuenchChange { add_names: &add_names, del_names: &del_names, ..Default::default() };
        let quench = registry.modify_quench(id, change).unwrap();
        assert_eq!(quench.names.iter().map(String::as_str).collect::<Vec<_>>(), vec!["a", "c"]);

        assert!(matches!(registry.modify_quench(id + 1, QuenchChange::default()), Err(RegistryError::UnknownQuench(_))));
    }

    #[test]
    fn clear_returns_everything() {
        let mut registry = Registry::new(2);
        add(&mut registry, 1, "true");
        add(&mut registry, 2, "false");
        registry.add_quench(3, BTreeSet::new(), true, PrimedKeys::empty(Side::Producer)).unwrap();

        let (subscriptions, quenches) = registry.clear();
        assert_eq!((subscriptions.len(), quenches.len()), (2, 1));
        assert_eq!(registry.subscription_count() + registry.quench_count(), 0);
    }

    proptest! {
        #[test]
        fn ids_stay_unique(seeds in proptest::collection::vec(any::<u32>(), 1..64)) {
            let mut registry = Registry::new(11);
            let mut seen = HashSet::new();
            for seed in seeds {
                let id = add(&mut registry, seed, "true");
                prop_assert!(seen.insert(id));
                prop_assert_eq!(SyntheticId::from(id).connection_id(), 11);
            }
        }
    }
}
