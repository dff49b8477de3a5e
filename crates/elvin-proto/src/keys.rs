//! Security keys and key blocks.
//!
//! A [`KeyBlock`] maps each key scheme to a fixed number of key sets: two for
//! dual schemes (producer position 0, consumer position 1) and one for
//! producer-only and consumer-only schemes. The codec only validates shape;
//! hashing and matching live in `elvin-core`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    xdr::{Decode, Encode, WORD, XdrBufMut, XdrReader},
};

/// An opaque key, either raw (private) or primed (hashed, public).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Bytes);

impl Key {
    /// Wrap raw key bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0))
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Self(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

/// Unordered set of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet(BTreeSet<Key>);

impl KeySet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key; returns false if it was already present.
    pub fn insert(&mut self, key: Key) -> bool {
        self.0.insert(key)
    }

    /// Remove a key; returns false if it was absent.
    pub fn remove(&mut self, key: &Key) -> bool {
        self.0.remove(key)
    }

    /// Membership test.
    pub fn contains(&self, key: &Key) -> bool {
        self.0.contains(key)
    }

    /// True when the two sets share at least one byte-equal key.
    pub fn intersects(&self, other: &KeySet) -> bool {
        // Walk the smaller set.
        let (small, large) = if self.len() <= other.len() { (self, other) } else { (other, self) };
        small.0.iter().any(|key| large.0.contains(key))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys in byte order.
    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }
}

impl FromIterator<Key> for KeySet {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Role of a key scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemeKind {
    /// Two sets: producer keys at position 0, consumer keys at position 1.
    Dual,
    /// One set of keys held raw by producers, primed by consumers.
    Producer,
    /// One set of keys held raw by consumers, primed by producers.
    Consumer,
}

/// Hash function used to prime keys of a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyHash {
    /// SHA-1, 20-byte digests.
    Sha1,
    /// SHA-256, 32-byte digests.
    Sha256,
}

/// Key scheme identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum KeyScheme {
    /// SHA-1 dual (deprecated).
    Sha1Dual = 1,
    /// SHA-1 producer (deprecated).
    Sha1Producer = 2,
    /// SHA-1 consumer (deprecated).
    Sha1Consumer = 3,
    /// SHA-256 dual.
    Sha256Dual = 7,
    /// SHA-256 producer.
    Sha256Producer = 8,
    /// SHA-256 consumer.
    Sha256Consumer = 9,
}

impl KeyScheme {
    /// Every scheme, in id order.
    pub const ALL: [KeyScheme; 6] = [
        Self::Sha1Dual,
        Self::Sha1Producer,
        Self::Sha1Consumer,
        Self::Sha256Dual,
        Self::Sha256Producer,
        Self::Sha256Consumer,
    ];

    /// Wire id.
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Look up a scheme by wire id.
    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|scheme| scheme.id() == id)
    }

    /// Dual, producer or consumer.
    pub fn kind(self) -> SchemeKind {
        match self {
            Self::Sha1Dual | Self::Sha256Dual => SchemeKind::Dual,
            Self::Sha1Producer | Self::Sha256Producer => SchemeKind::Producer,
            Self::Sha1Consumer | Self::Sha256Consumer => SchemeKind::Consumer,
        }
    }

    /// Hash used for priming.
    pub fn hash(self) -> KeyHash {
        match self {
            Self::Sha1Dual | Self::Sha1Producer | Self::Sha1Consumer => KeyHash::Sha1,
            Self::Sha256Dual | Self::Sha256Producer | Self::Sha256Consumer => KeyHash::Sha256,
        }
    }

    /// Number of key sets a block carries for this scheme.
    pub fn set_count(self) -> usize {
        match self.kind() {
            SchemeKind::Dual => 2,
            SchemeKind::Producer | SchemeKind::Consumer => 1,
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sha1Dual => "SHA-1 dual",
            Self::Sha1Producer => "SHA-1 producer",
            Self::Sha1Consumer => "SHA-1 consumer",
            Self::Sha256Dual => "SHA-256 dual",
            Self::Sha256Producer => "SHA-256 producer",
            Self::Sha256Consumer => "SHA-256 consumer",
        };
        f.write_str(name)
    }
}

/// Scheme id mapped to that scheme's key sets.
///
/// Schemes whose sets are all empty are dropped, so [`KeyBlock::is_empty`]
/// means "no keys at all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBlock {
    schemes: BTreeMap<KeyScheme, Vec<KeySet>>,
}

impl KeyBlock {
    /// Empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`KeyBlock::insert_key`].
    pub fn with_key(mut self, scheme: KeyScheme, index: usize, key: impl Into<Key>) -> Result<Self> {
        self.insert_key(scheme, index, key.into())?;
        Ok(self)
    }

    /// Add `key` to set `index` of `scheme`.
    pub fn insert_key(&mut self, scheme: KeyScheme, index: usize, key: Key) -> Result<()> {
        if index >= scheme.set_count() {
            return Err(ProtocolError::BadKeySetIndex { scheme: scheme.id(), index });
        }
        let sets = self.schemes.entry(scheme).or_insert_with(|| vec![KeySet::new(); scheme.set_count()]);
        sets[index].insert(key);
        Ok(())
    }

    /// Key sets for `scheme`, if any keys are held under it.
    pub fn key_sets(&self, scheme: KeyScheme) -> Option<&[KeySet]> {
        self.schemes.get(&scheme).map(Vec::as_slice)
    }

    /// Schemes and their sets, in scheme id order.
    pub fn iter(&self) -> impl Iterator<Item = (KeyScheme, &[KeySet])> {
        self.schemes.iter().map(|(scheme, sets)| (*scheme, sets.as_slice()))
    }

    /// True when the block holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }

    /// Total number of keys across all schemes and sets.
    pub fn key_count(&self) -> usize {
        self.schemes.values().flatten().map(KeySet::len).sum()
    }

    /// Union `other` into this block.
    pub fn add(&mut self, other: &KeyBlock) {
        for (scheme, sets) in other.iter() {
            let ours = self.schemes.entry(scheme).or_insert_with(|| vec![KeySet::new(); scheme.set_count()]);
            for (target, source) in ours.iter_mut().zip(sets) {
                for key in source.iter() {
                    target.insert(key.clone());
                }
            }
        }
        self.normalize();
    }

    /// Remove every key in `other` from this block.
    pub fn remove(&mut self, other: &KeyBlock) {
        for (scheme, sets) in other.iter() {
            if let Some(ours) = self.schemes.get_mut(&scheme) {
                for (target, source) in ours.iter_mut().zip(sets) {
                    for key in source.iter() {
                        target.remove(key);
                    }
                }
            }
        }
        self.normalize();
    }

    /// Build a new block by transforming every key, keeping its position.
    pub fn map_keys(&self, mut f: impl FnMut(KeyScheme, usize, &Key) -> Key) -> KeyBlock {
        let schemes = self
            .schemes
            .iter()
            .map(|(scheme, sets)| {
                let mapped = sets
                    .iter()
                    .enumerate()
                    .map(|(index, set)| set.iter().map(|key| f(*scheme, index, key)).collect())
                    .collect();
                (*scheme, mapped)
            })
            .collect();
        KeyBlock { schemes }
    }

    fn normalize(&mut self) {
        self.schemes.retain(|_, sets| sets.iter().any(|set| !set.is_empty()));
    }
}

impl Encode for KeyBlock {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_xdr_count(self.schemes.len());
        for (scheme, sets) in &self.schemes {
            buf.put_i32(scheme.id());
            buf.put_xdr_count(sets.len());
            for set in sets {
                buf.put_xdr_count(set.len());
                for key in set.iter() {
                    buf.put_xdr_opaque(key.as_bytes());
                }
            }
        }
    }
}

impl Decode for KeyBlock {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        let mut block = KeyBlock::new();
        // Each scheme entry is at least an id and a set count.
        let scheme_count = reader.read_count(2 * WORD)?;
        for _ in 0..scheme_count {
            let id = reader.read_i32()?;
            let scheme = KeyScheme::from_id(id).ok_or(ProtocolError::UnknownKeyScheme(id))?;
            let set_count = reader.read_count(WORD)?;
            if set_count != scheme.set_count() {
                return Err(ProtocolError::BadKeySetCount {
                    scheme: id,
                    expected: scheme.set_count(),
                    actual: set_count,
                });
            }
            for index in 0..set_count {
                let key_count = reader.read_count(WORD)?;
                for _ in 0..key_count {
                    block.insert_key(scheme, index, Key(reader.read_bytes()?))?;
                }
            }
        }
        block.normalize();
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::xdr::decode_from;

    #[test]
    fn dual_block_round_trips() {
        let block = KeyBlock::new()
            .with_key(KeyScheme::Sha256Dual, 0, "producer")
            .unwrap()
            .with_key(KeyScheme::Sha256Dual, 1, "consumer")
            .unwrap()
            .with_key(KeyScheme::Sha1Consumer, 0, "c")
            .unwrap();

        let bytes = block.to_bytes();
        let (decoded, used) = decode_from::<KeyBlock>(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.key_count(), 3);
    }

    #[test]
    fn producer_block_layout() {
        let block = KeyBlock::new().with_key(KeyScheme::Sha1Producer, 0, "ab").unwrap();
        assert_eq!(
            &block.to_bytes()[..],
            &hex!(
                "00 00 00 01"  // one scheme
                "00 00 00 02"  // SHA-1 producer
                "00 00 00 01"  // one set
                "00 00 00 01"  // one key
                "00 00 00 02 61 62 00 00"
            )
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let input = hex!("00 00 00 01 00 00 00 05 00 00 00 01 00 00 00 00");
        assert_eq!(decode_from::<KeyBlock>(&input).unwrap_err(), ProtocolError::UnknownKeyScheme(5));
    }

    #[test]
    fn dual_scheme_needs_two_sets() {
        let input = hex!("00 00 00 01 00 00 00 07 00 00 00 01 00 00 00 00");
        assert_eq!(
            decode_from::<KeyBlock>(&input).unwrap_err(),
            ProtocolError::BadKeySetCount { scheme: 7, expected: 2, actual: 1 }
        );
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut block = KeyBlock::new();
        assert_eq!(
            block.insert_key(KeyScheme::Sha256Consumer, 1, Key::from("k")),
            Err(ProtocolError::BadKeySetIndex { scheme: 9, index: 1 })
        );
        assert!(block.is_empty());
    }

    #[test]
    fn empty_schemes_are_dropped() {
        let input = hex!("00 00 00 01 00 00 00 07 00 00 00 02 00 00 00 00 00 00 00 00");
        let (block, _) = decode_from::<KeyBlock>(&input).unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn add_and_remove_are_set_operations() {
        let mut block = KeyBlock::new().with_key(KeyScheme::Sha256Producer, 0, "a").unwrap();
        let extra = KeyBlock::new()
            .with_key(KeyScheme::Sha256Producer, 0, "b")
            .unwrap()
            .with_key(KeyScheme::Sha256Dual, 1, "d")
            .unwrap();

        block.add(&extra);
        assert_eq!(block.key_count(), 3);

        block.remove(&extra);
        let expected = KeyBlock::new().with_key(KeyScheme::Sha256Producer, 0, "a").unwrap();
        assert_eq!(block, expected);
    }

    #[test]
    fn intersection_is_byte_equality() {
        let left: KeySet = [Key::from("x"), Key::from("y")].into_iter().collect();
        let right: KeySet = [Key::from("y")].into_iter().collect();
        let other: KeySet = [Key::from("Y")].into_iter().collect();
        assert!(left.intersects(&right));
        assert!(!left.intersects(&other));
        assert!(!left.intersects(&KeySet::new()));
    }
}
