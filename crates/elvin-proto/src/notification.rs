//! Name/value maps: notifications and connection options.

use std::{collections::BTreeMap, fmt};

use bytes::BytesMut;

use crate::{
    errors::{ProtocolError, Result},
    value::Value,
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
};

fn put_name_values(buf: &mut BytesMut, entries: &BTreeMap<String, Value>) {
    buf.put_xdr_count(entries.len());
    for (name, value) in entries {
        buf.put_xdr_string(name);
        value.encode(buf);
    }
}

fn read_name_values(reader: &mut XdrReader<'_>) -> Result<BTreeMap<String, Value>> {
    // Smallest entry is an empty name plus a tagged 32-bit value.
    let count = reader.read_count(12)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let name = reader.read_string()?;
        let value = Value::decode(reader)?;
        if entries.contains_key(&name) {
            return Err(ProtocolError::DuplicateName(name));
        }
        entries.insert(name, value);
    }
    Ok(entries)
}

/// A published notification: unique attribute names mapped to typed values.
///
/// Attribute order carries no meaning; the encoder writes names in sorted
/// order.
///
/// ```
/// use elvin_proto::{Notification, Value};
///
/// let ntfn = Notification::new().with("Group", "eng").with("count", 7);
/// assert_eq!(ntfn.get("count"), Some(&Value::Int32(7)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notification {
    attributes: BTreeMap<String, Value>,
}

impl Notification {
    /// Create an empty notification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set an attribute, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Look up an attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// True when the attribute is present.
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True when there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Encode for Notification {
    fn encode(&self, buf: &mut BytesMut) {
        put_name_values(buf, &self.attributes);
    }
}

impl Decode for Notification {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        read_name_values(reader).map(|attributes| Self { attributes })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (name, value)) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Notification {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().map(|(name, value)| (name.into(), value.into())).collect(),
        }
    }
}

/// Connection options exchanged in ConnRqst / ConnRply.
///
/// Same wire form as a notification. The router answers with the subset of
/// options it understood, each clamped to what it is willing to grant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionOptions {
    options: BTreeMap<String, Value>,
}

impl ConnectionOptions {
    /// Maximum packet length in bytes.
    pub const PACKET_MAX_LENGTH: &'static str = "Packet.Max-Length";
    /// Maximum number of subscriptions on the connection.
    pub const SUBSCRIPTION_MAX_COUNT: &'static str = "Subscription.Max-Count";
    /// Maximum length of one subscription expression.
    pub const SUBSCRIPTION_MAX_LENGTH: &'static str = "Subscription.Max-Length";

    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Set an option.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.options.insert(name.into(), value.into());
    }

    /// Look up an option.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Look up an integer option.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// True when no options are set.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Options in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.options.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Encode for ConnectionOptions {
    fn encode(&self, buf: &mut BytesMut) {
        put_name_values(buf, &self.options);
    }
}

impl Decode for ConnectionOptions {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        read_name_values(reader).map(|options| Self { options })
    }
}
