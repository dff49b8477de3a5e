//! Key priming and delivery authorization.
//!
//! Keys travel raw (private) or primed (hashed, public). Each side primes the
//! keys it owns the secret for, so a match means one party hashed a secret
//! and got the public value the other party was given:
//!
//! - producing side primes producer-scheme keys and position 0 of dual sets
//! - consuming side primes consumer-scheme keys and position 0 of dual sets
//!
//! Priming happens once, when keys arrive in a request; [`PrimedKeys`] can
//! only be built from a raw [`KeyBlock`], so primed keys are never hashed
//! twice.
//!
//! # Authorization
//!
//! Given the producer's keys (notification plus connection) and the
//! consumer's keys (subscription plus connection):
//!
//! 1. `deliver_insecure && accept_insecure` matches
//! 2. a producer with no keys at all matches iff `accept_insecure`
//! 3. a consumer with no keys at all matches iff `deliver_insecure`
//! 4. otherwise any producer block matching any consumer block authorizes
//! 5. otherwise the delivery is denied
//!
//! A match through step 4 is secure; steps 1 to 3 are insecure.

use elvin_proto::{
    KeyBlock, KeySet, SchemeKind,
    keys::{Key, KeyHash},
};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Which side of a delivery owns a key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Notification and producer connection keys.
    Producer,
    /// Subscription and consumer connection keys.
    Consumer,
}

/// Hash a raw key with the scheme's digest.
pub fn prime_key(hash: KeyHash, key: &Key) -> Key {
    match hash {
        KeyHash::Sha1 => Key::from(Sha1::digest(key.as_bytes()).to_vec()),
        KeyHash::Sha256 => Key::from(Sha256::digest(key.as_bytes()).to_vec()),
    }
}

fn primes_position(side: Side, kind: SchemeKind, index: usize) -> bool {
    match (side, kind) {
        (_, SchemeKind::Dual) => index == 0,
        (Side::Producer, SchemeKind::Producer) | (Side::Consumer, SchemeKind::Consumer) => true,
        (Side::Producer, SchemeKind::Consumer) | (Side::Consumer, SchemeKind::Producer) => false,
    }
}

fn prime_block(side: Side, raw: &KeyBlock) -> KeyBlock {
    raw.map_keys(|scheme, index, key| {
        if primes_position(side, scheme.kind(), index) {
            prime_key(scheme.hash(), key)
        } else {
            key.clone()
        }
    })
}

/// A key block primed for one side of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimedKeys {
    side: Side,
    block: KeyBlock,
}

impl PrimedKeys {
    /// No keys.
    pub fn empty(side: Side) -> Self {
        Self { side, block: KeyBlock::new() }
    }

    /// Prime raw keys held by a producer.
    pub fn producer(raw: &KeyBlock) -> Self {
        Self { side: Side::Producer, block: prime_block(Side::Producer, raw) }
    }

    /// Prime raw keys held by a consumer.
    pub fn consumer(raw: &KeyBlock) -> Self {
        Self { side: Side::Consumer, block: prime_block(Side::Consumer, raw) }
    }

    /// Side these keys belong to.
    pub fn side(&self) -> Side {
        self.side
    }

    /// The primed block.
    pub fn block(&self) -> &KeyBlock {
        &self.block
    }

    /// True when no keys are held.
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// Prime and add raw keys.
    pub fn add(&mut self, raw: &KeyBlock) {
        self.block.add(&prime_block(self.side, raw));
    }

    /// Prime raw keys and remove them by primed value.
    pub fn remove(&mut self, raw: &KeyBlock) {
        self.block.remove(&prime_block(self.side, raw));
    }
}

/// Outcome of the authorization rules for one producer/consumer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Authorized by a key match.
    Secure,
    /// Allowed without a key match.
    Insecure,
    /// Not delivered.
    Denied,
}

impl Delivery {
    /// True unless denied.
    pub fn is_delivered(self) -> bool {
        self != Self::Denied
    }
}

fn first(sets: &[KeySet]) -> Option<&KeySet> {
    sets.first()
}

fn second(sets: &[KeySet]) -> Option<&KeySet> {
    sets.get(1)
}

fn intersects(a: Option<&KeySet>, b: Option<&KeySet>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a.intersects(b))
}

/// Block predicate: does any scheme present in both blocks match?
pub fn blocks_match(producer: &KeyBlock, consumer: &KeyBlock) -> bool {
    producer.iter().any(|(scheme, producer_sets)| {
        let Some(consumer_sets) = consumer.key_sets(scheme) else {
            return false;
        };
        match scheme.kind() {
            SchemeKind::Producer | SchemeKind::Consumer => {
                intersects(first(producer_sets), first(consumer_sets))
            },
            SchemeKind::Dual => {
                intersects(first(producer_sets), second(consumer_sets))
                    && intersects(second(producer_sets), first(consumer_sets))
            },
        }
    })
}

/// Apply the authorization rules.
///
/// `producer` holds the notification's keys and the producing connection's
/// keys; `consumer` the subscription's keys and the consuming connection's.
pub fn classify(
    deliver_insecure: bool,
    producer: &[&PrimedKeys],
    accept_insecure: bool,
    consumer: &[&PrimedKeys],
) -> Delivery {
    let allow_insecure = |allowed: bool| if allowed { Delivery::Insecure } else { Delivery::Denied };

    if deliver_insecure && accept_insecure {
        return Delivery::Insecure;
    }
    if producer.iter().all(|keys| keys.is_empty()) {
        return allow_insecure(accept_insecure);
    }
    if consumer.iter().all(|keys| keys.is_empty()) {
        return allow_insecure(deliver_insecure);
    }

    let secure = producer.iter().filter(|keys| !keys.is_empty()).any(|p| {
        consumer.iter().filter(|keys| !keys.is_empty()).any(|c| blocks_match(p.block(), c.block()))
    });
    if secure { Delivery::Secure } else { Delivery::Denied }
}
