//! Subscription requests and replies.

use bytes::{BufMut, BytesMut};

use crate::{
    errors::Result,
    keys::KeyBlock,
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
    xid::Xid,
};

/// Register a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAddRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Filter expression source.
    pub expression: String,
    /// Accept notifications delivered without a key match.
    pub accept_insecure: bool,
    /// Raw keys for this subscription.
    pub keys: KeyBlock,
}

impl Encode for SubAddRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_xdr_string(&self.expression);
        buf.put_xdr_bool(self.accept_insecure);
        self.keys.encode(buf);
    }
}

impl Decode for SubAddRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            expression: reader.read_string()?,
            accept_insecure: reader.read_bool()?,
            keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Modify a subscription in place.
///
/// An empty expression leaves the filter unchanged, an absent flag leaves
/// the flag unchanged, and the key blocks are applied as add then remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubModRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Subscription to modify.
    pub subscription_id: u64,
    /// New filter expression, or empty to keep the current one.
    pub expression: String,
    /// New accept-insecure flag, if changing.
    pub accept_insecure: Option<bool>,
    /// Raw keys to add.
    pub add_keys: KeyBlock,
    /// Raw keys to remove.
    pub del_keys: KeyBlock,
}

impl SubModRqst {
    /// Modification that changes nothing.
    pub fn new(xid: Xid, subscription_id: u64) -> Self {
        Self {
            xid,
            subscription_id,
            expression: String::new(),
            accept_insecure: None,
            add_keys: KeyBlock::new(),
            del_keys: KeyBlock::new(),
        }
    }
}

impl Encode for SubModRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.subscription_id);
        buf.put_xdr_string(&self.expression);
        buf.put_xdr_optional_bool(self.accept_insecure);
        self.add_keys.encode(buf);
        self.del_keys.encode(buf);
    }
}

impl Decode for SubModRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            subscription_id: reader.read_u64()?,
            expression: reader.read_string()?,
            accept_insecure: reader.read_optional_bool()?,
            add_keys: KeyBlock::decode(reader)?,
            del_keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Remove a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubDelRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Subscription to remove.
    pub subscription_id: u64,
}

/// Reply to any subscription request, carrying the subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRply {
    /// Transaction id of the request.
    pub xid: Xid,
    /// Assigned or affected subscription id.
    pub subscription_id: u64,
}

impl Encode for SubDelRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.subscription_id);
    }
}

impl Decode for SubDelRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { xid: reader.read_i32()?, subscription_id: reader.read_u64()? })
    }
}

impl Encode for SubRply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_u64(self.subscription_id);
    }
}

impl Decode for SubRply {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { xid: reader.read_i32()?, subscription_id: reader.read_u64()? })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::{errors::ProtocolError, xdr::decode_from};

    #[test]
    fn sub_add_layout() {
        let rqst = SubAddRqst {
            xid: 1,
            expression: "require(Group)".into(),
            accept_insecure: true,
            keys: KeyBlock::new(),
        };
        assert_eq!(
            &rqst.to_bytes()[..],
            &hex!(
                "00 00 00 01"
                "00 00 00 0e 72 65 71 75 69 72 65 28 47 72 6f 75 70 29 00 00"
                "00 00 00 01"
                "00 00 00 00"
            )
        );
    }

    #[test]
    fn sub_mod_keeps_absent_flag_absent() {
        let rqst = SubModRqst::new(4, 0xdead_beef_0000_0001);
        let bytes = rqst.to_bytes();
        let (decoded, used) = decode_from::<SubModRqst>(&bytes).unwrap();
        assert_eq!(decoded.accept_insecure, None);
        assert_eq!(decoded, rqst);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let input = hex!("00 00 00 01 00 00 00 00 00 00");
        assert!(matches!(decode_from::<SubRply>(&input), Err(ProtocolError::Truncated { .. })));
    }
}
