//! Quench requests and the subscription change notices sent to quenchers.
//!
//! A quench tells the router which attribute names a producer can emit. The
//! router then keeps the producer informed about subscriptions that could
//! match them, so it can stay quiet when nobody is listening.

use bytes::{BufMut, BytesMut};

use crate::{
    errors::Result,
    keys::KeyBlock,
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
    xid::Xid,
};

/// Register a quench over a set of attribute names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QnchAddRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Attribute names of interest.
    pub names: Vec<String>,
    /// Accept subscription notices that were not authorized by keys.
    pub deliver_insecure: bool,
    /// Raw keys for this quench.
    pub keys: KeyBlock,
}

impl Encode for QnchAddRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_xdr_string_array(&self.names);
        buf.put_xdr_bool(self.deliver_insecure);
        self.keys.encode(buf);
    }
}

impl Decode for QnchAddRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            names: reader.read_string_array()?,
            deliver_insecure: reader.read_bool()?,
            keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Modify a quench in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QnchModRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Quench to modify.
    pub quench_id: u64,
    /// Names to add.
    pub add_names: Vec<String>,
    /// Names to remove.
    pub del_names: Vec<String>,
    /// New deliver-insecure flag, if changing.
    pub deliver_insecure: Option<bool>,
    /// Raw keys to add.
    pub add_keys: KeyBlock,
    /// Raw keys to remove.
    pub del_keys: KeyBlock,
}

impl QnchModRqst {
    /// Modification that changes nothing.
    pub fn new(xid: Xid, quench_id: u64) -> Self {
        Self {
            xid,
            quench_id,
            add_names: Vec::new(),
            del_names: Vec::new(),
            deliver_insecure: None,
            add_keys: KeyBlock::new(),
            del_keys: KeyBlock::new(),
        }
    }
}

impl Encode for QnchModRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.quench_id);
        buf.put_xdr_string_array(&self.add_names);
        buf.put_xdr_string_array(&self.del_names);
        buf.put_xdr_optional_bool(self.deliver_insecure);
        self.add_keys.encode(buf);
        self.del_keys.encode(buf);
    }
}

impl Decode for QnchModRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            quench_id: reader.read_u64()?,
            add_names: reader.read_string_array()?,
            del_names: reader.read_string_array()?,
            deliver_insecure: reader.read_optional_bool()?,
            add_keys: KeyBlock::decode(reader)?,
            del_keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Remove a quench.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QnchDelRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Quench to remove.
    pub quench_id: u64,
}

/// Reply to any quench request, carrying the quench id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QnchRply {
    /// Transaction id of the request.
    pub xid: Xid,
    /// Assigned or affected quench id.
    pub quench_id: u64,
}

impl Encode for QnchDelRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.quench_id);
    }
}

impl Decode for QnchDelRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { xid: reader.read_i32()?, quench_id: reader.read_u64()? })
    }
}

impl Encode for QnchRply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.quench_id);
    }
}

impl Decode for QnchRply {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { xid: reader.read_i32()?, quench_id: reader.read_u64()? })
    }
}

/// A subscription matching some quenches was added.
///
/// `term_id` is the subscription id; `insecure` is true when no quench in
/// `quench_ids` was authorized by keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAddNotify {
    /// Quenches on the receiving connection that match.
    pub quench_ids: Vec<u64>,
    /// Subscription id.
    pub term_id: u64,
    /// Subscription expression source.
    pub expression: String,
    /// Match was not authorized by keys.
    pub insecure: bool,
}

/// A subscription matching some quenches was modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubModNotify {
    /// Quenches on the receiving connection that match.
    pub quench_ids: Vec<u64>,
    /// Subscription id.
    pub term_id: u64,
    /// Current expression source.
    pub expression: String,
    /// Match was not authorized by keys.
    pub insecure: bool,
}

macro_rules! sub_change_body {
    ($($name:ident),+) => {$(
        impl Encode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_xdr_u64_array(&self.quench_ids);
                buf.put_u64(self.term_id);
                buf.put_xdr_string(&self.expression);
                buf.put_xdr_bool(self.insecure);
            }
        }

        impl Decode for $name {
            fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
                Ok(Self {
                    quench_ids: reader.read_u64_array()?,
                    term_id: reader.read_u64()?,
                    expression: reader.read_string()?,
                    insecure: reader.read_bool()?,
                })
            }
        }
    )+};
}

sub_change_body!(SubAddNotify, SubModNotify);

/// A subscription previously announced to these quenches went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDelNotify {
    /// Quenches on the receiving connection that were told about it.
    pub quench_ids: Vec<u64>,
    /// Subscription id.
    pub term_id: u64,
}

impl Encode for SubDelNotify {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_xdr_u64_array(&self.quench_ids);
        buf.put_u64(self.term_id);
    }
}

impl Decode for SubDelNotify {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { quench_ids: reader.read_u64_array()?, term_id: reader.read_u64()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::KeyScheme, xdr::decode_from};

    #[test]
    fn quench_mod_round_trip() {
        let mut rqst = QnchModRqst::new(9, 77);
        rqst.add_names = vec!["Group".into(), "count".into()];
        rqst.del_names = vec![String::new()];
        rqst.deliver_insecure = Some(false);
        rqst.add_keys.insert_key(KeyScheme::Sha1Dual, 1, "k".into()).unwrap();

        let bytes = rqst.to_bytes();
        let (decoded, used) = decode_from::<QnchModRqst>(&bytes).unwrap();
        assert_eq!(decoded, rqst);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn sub_add_notify_round_trip() {
        let notice = SubAddNotify {
            quench_ids: vec![1, 2],
            term_id: 3,
            expression: "require(x)".into(),
            insecure: true,
        };
        let (decoded, _) = decode_from::<SubAddNotify>(&notice.to_bytes()).unwrap();
        assert_eq!(decoded, notice);
    }
}
