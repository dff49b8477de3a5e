//! Notification packets.

use bytes::{BufMut, BytesMut};

use crate::{
    errors::Result,
    keys::KeyBlock,
    notification::Notification,
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
};

/// Notification published on a connected session.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyEmit {
    /// Attributes to match against subscriptions.
    pub attributes: Notification,
    /// Allow delivery to subscriptions that accept insecure notifications.
    pub deliver_insecure: bool,
    /// Raw keys for this notification only.
    pub keys: KeyBlock,
}

impl Encode for NotifyEmit {
    fn encode(&self, buf: &mut BytesMut) {
        self.attributes.encode(buf);
        buf.put_xdr_bool(self.deliver_insecure);
        self.keys.encode(buf);
    }
}

impl Decode for NotifyEmit {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            attributes: Notification::decode(reader)?,
            deliver_insecure: reader.read_bool()?,
            keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Notification sent without first connecting.
///
/// Routers accept it on a fresh connection as well as an established one.
#[derive(Debug, Clone, PartialEq)]
pub struct UNotify {
    /// Client protocol major version.
    pub client_major: i32,
    /// Client protocol minor version.
    pub client_minor: i32,
    /// Attributes to match against subscriptions.
    pub attributes: Notification,
    /// Allow delivery to subscriptions that accept insecure notifications.
    pub deliver_insecure: bool,
    /// Raw keys for this notification.
    pub keys: KeyBlock,
}

impl Encode for UNotify {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.client_major);
        buf.put_i32(self.client_minor);
        self.attributes.encode(buf);
        buf.put_xdr_bool(self.deliver_insecure);
        self.keys.encode(buf);
    }
}

impl Decode for UNotify {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            client_major: reader.read_i32()?,
            client_minor: reader.read_i32()?,
            attributes: Notification::decode(reader)?,
            deliver_insecure: reader.read_bool()?,
            keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Notification routed to one subscriber connection.
///
/// Lists every subscription on the receiving connection that matched,
/// split by whether the match was authorized by keys.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyDeliver {
    /// Attributes of the published notification.
    pub attributes: Notification,
    /// Subscriptions matched through a key match.
    pub secure_matches: Vec<u64>,
    /// Subscriptions matched without keys.
    pub insecure_matches: Vec<u64>,
}

impl NotifyDeliver {
    /// All matched subscription ids.
    pub fn matches(&self) -> impl Iterator<Item = u64> + '_ {
        self.secure_matches.iter().chain(&self.insecure_matches).copied()
    }
}

impl Encode for NotifyDeliver {
    fn encode(&self, buf: &mut BytesMut) {
        self.attributes.encode(buf);
        buf.put_xdr_u64_array(&self.secure_matches);
        buf.put_xdr_u64_array(&self.insecure_matches);
    }
}

impl Decode for NotifyDeliver {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            attributes: Notification::decode(reader)?,
            secure_matches: reader.read_u64_array()?,
            insecure_matches: reader.read_u64_array()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdr::decode_from;

    #[test]
    fn deliver_lists_both_buckets() {
        let deliver = NotifyDeliver {
            attributes: Notification::new().with("Group", "eng"),
            secure_matches: vec![1 << 32 | 5],
            insecure_matches: vec![2, 3],
        };
        let bytes = deliver.to_bytes();
        let (decoded, used) = decode_from::<NotifyDeliver>(&bytes).unwrap();
        assert_eq!(decoded, deliver);
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.matches().collect::<Vec<_>>(), vec![1 << 32 | 5, 2, 3]);
    }

    #[test]
    fn emit_rejects_non_boolean_flag() {
        let mut buf = BytesMut::new();
        Notification::new().encode(&mut buf);
        buf.put_i32(3);
        KeyBlock::new().encode(&mut buf);
        assert!(decode_from::<NotifyEmit>(&buf).is_err());
    }
}
