//! The closed set of protocol packets.
//!
//! A packet body on the wire is `[type:int32][fields...]`. Decoding looks the
//! type up in [`DECODERS`] and requires the body to be consumed exactly.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    payloads::{
        ConnRply, ConnRqst, Disconn, DisconnRply, DisconnRqst, Nack, NotifyDeliver, NotifyEmit,
        QnchAddRqst, QnchDelRqst, QnchModRqst, QnchRply, SecRply, SecRqst, SubAddNotify,
        SubAddRqst, SubDelNotify, SubDelRqst, SubModNotify, SubModRqst, SubRply, UNotify,
    },
    xdr::{Decode, Encode, XdrReader},
    xid::Xid,
};

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PacketType {
    /// Unconnected notification.
    UNotify = 32,
    /// Negative acknowledgement.
    Nack = 48,
    /// Connection request.
    ConnRqst = 49,
    /// Connection reply.
    ConnRply = 50,
    /// Disconnect request.
    DisconnRqst = 51,
    /// Disconnect reply.
    DisconnRply = 52,
    /// Router-initiated disconnect.
    Disconn = 53,
    /// Security key change request.
    SecRqst = 54,
    /// Security key change reply.
    SecRply = 55,
    /// Notification published by a client.
    NotifyEmit = 56,
    /// Notification delivered to a subscriber.
    NotifyDeliver = 57,
    /// Add subscription.
    SubAddRqst = 58,
    /// Modify subscription.
    SubModRqst = 59,
    /// Delete subscription.
    SubDelRqst = 60,
    /// Subscription reply.
    SubRply = 61,
    /// Deliveries were dropped.
    DropWarn = 62,
    /// Liveness check.
    TestConn = 63,
    /// Liveness check response.
    ConfConn = 64,
    /// Add quench.
    QnchAddRqst = 80,
    /// Modify quench.
    QnchModRqst = 81,
    /// Delete quench.
    QnchDelRqst = 82,
    /// Quench reply.
    QnchRply = 83,
    /// Subscription added notice.
    SubAddNotify = 84,
    /// Subscription modified notice.
    SubModNotify = 85,
    /// Subscription deleted notice.
    SubDelNotify = 86,
}

impl PacketType {
    /// Wire id.
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Look up a packet type by wire id.
    pub fn from_id(id: i32) -> Option<Self> {
        DECODERS.iter().find(|(ty, _)| ty.id() == id).map(|(ty, _)| *ty)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::UNotify => "UNotify",
            Self::Nack => "Nack",
            Self::ConnRqst => "ConnRqst",
            Self::ConnRply => "ConnRply",
            Self::DisconnRqst => "DisconnRqst",
            Self::DisconnRply => "DisconnRply",
            Self::Disconn => "Disconn",
            Self::SecRqst => "SecRqst",
            Self::SecRply => "SecRply",
            Self::NotifyEmit => "NotifyEmit",
            Self::NotifyDeliver => "NotifyDeliver",
            Self::SubAddRqst => "SubAddRqst",
            Self::SubModRqst => "SubModRqst",
            Self::SubDelRqst => "SubDelRqst",
            Self::SubRply => "SubRply",
            Self::DropWarn => "DropWarn",
            Self::TestConn => "TestConn",
            Self::ConfConn => "ConfConn",
            Self::QnchAddRqst => "QnchAddRqst",
            Self::QnchModRqst => "QnchModRqst",
            Self::QnchDelRqst => "QnchDelRqst",
            Self::QnchRply => "QnchRply",
            Self::SubAddNotify => "SubAddNotify",
            Self::SubModNotify => "SubModNotify",
            Self::SubDelNotify => "SubDelNotify",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reads one packet body (everything after the type id).
pub type DecodeFn = fn(&mut XdrReader<'_>) -> Result<Packet>;

/// Packet type to body decoder.
pub static DECODERS: [(PacketType, DecodeFn); 25] = [
    (PacketType::UNotify, |r| UNotify::decode(r).map(Packet::UNotify)),
    (PacketType::Nack, |r| Nack::decode(r).map(Packet::Nack)),
    (PacketType::ConnRqst, |r| ConnRqst::decode(r).map(Packet::ConnRqst)),
    (PacketType::ConnRply, |r| ConnRply::decode(r).map(Packet::ConnRply)),
    (PacketType::DisconnRqst, |r| DisconnRqst::decode(r).map(Packet::DisconnRqst)),
    (PacketType::DisconnRply, |r| DisconnRply::decode(r).map(Packet::DisconnRply)),
    (PacketType::Disconn, |r| Disconn::decode(r).map(Packet::Disconn)),
    (PacketType::SecRqst, |r| SecRqst::decode(r).map(Packet::SecRqst)),
    (PacketType::SecRply, |r| SecRply::decode(r).map(Packet::SecRply)),
    (PacketType::NotifyEmit, |r| NotifyEmit::decode(r).map(Packet::NotifyEmit)),
    (PacketType::NotifyDeliver, |r| NotifyDeliver::decode(r).map(Packet::NotifyDeliver)),
    (PacketType::SubAddRqst, |r| SubAddRqst::decode(r).map(Packet::SubAddRqst)),
    (PacketType::SubModRqst, |r| SubModRqst::decode(r).map(Packet::SubModRqst)),
    (PacketType::SubDelRqst, |r| SubDelRqst::decode(r).map(Packet::SubDelRqst)),
    (PacketType::SubRply, |r| SubRply::decode(r).map(Packet::SubRply)),
    (PacketType::DropWarn, |_| Ok(Packet::DropWarn)),
    (PacketType::TestConn, |_| Ok(Packet::TestConn)),
    (PacketType::ConfConn, |_| Ok(Packet::ConfConn)),
    (PacketType::QnchAddRqst, |r| QnchAddRqst::decode(r).map(Packet::QnchAddRqst)),
    (PacketType::QnchModRqst, |r| QnchModRqst::decode(r).map(Packet::QnchModRqst)),
    (PacketType::QnchDelRqst, |r| QnchDelRqst::decode(r).map(Packet::QnchDelRqst)),
    (PacketType::QnchRply, |r| QnchRply::decode(r).map(Packet::QnchRply)),
    (PacketType::SubAddNotify, |r| SubAddNotify::decode(r).map(Packet::SubAddNotify)),
    (PacketType::SubModNotify, |r| SubModNotify::decode(r).map(Packet::SubModNotify)),
    (PacketType::SubDelNotify, |r| SubDelNotify::decode(r).map(Packet::SubDelNotify)),
];

/// Read the packet type id without decoding the body.
pub fn packet_id(bytes: &[u8]) -> Result<i32> {
    XdrReader::new(bytes).read_i32()
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Packet {
    UNotify(UNotify),
    Nack(Nack),
    ConnRqst(ConnRqst),
    ConnRply(ConnRply),
    DisconnRqst(DisconnRqst),
    DisconnRply(DisconnRply),
    Disconn(Disconn),
    SecRqst(SecRqst),
    SecRply(SecRply),
    NotifyEmit(NotifyEmit),
    NotifyDeliver(NotifyDeliver),
    SubAddRqst(SubAddRqst),
    SubModRqst(SubModRqst),
    SubDelRqst(SubDelRqst),
    SubRply(SubRply),
    DropWarn,
    TestConn,
    ConfConn,
    QnchAddRqst(QnchAddRqst),
    QnchModRqst(QnchModRqst),
    QnchDelRqst(QnchDelRqst),
    QnchRply(QnchRply),
    SubAddNotify(SubAddNotify),
    SubModNotify(SubModNotify),
    SubDelNotify(SubDelNotify),
}

impl Packet {
    /// Type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::UNotify(_) => PacketType::UNotify,
            Self::Nack(_) => PacketType::Nack,
            Self::ConnRqst(_) => PacketType::ConnRqst,
            Self::ConnRply(_) => PacketType::ConnRply,
            Self::DisconnRqst(_) => PacketType::DisconnRqst,
            Self::DisconnRply(_) => PacketType::DisconnRply,
            Self::Disconn(_) => PacketType::Disconn,
            Self::SecRqst(_) => PacketType::SecRqst,
            Self::SecRply(_) => PacketType::SecRply,
            Self::NotifyEmit(_) => PacketType::NotifyEmit,
            Self::NotifyDeliver(_) => PacketType::NotifyDeliver,
            Self::SubAddRqst(_) => PacketType::SubAddRqst,
            Self::SubModRqst(_) => PacketType::SubModRqst,
            Self::SubDelRqst(_) => PacketType::SubDelRqst,
            Self::SubRply(_) => PacketType::SubRply,
            Self::DropWarn => PacketType::DropWarn,
            Self::TestConn => PacketType::TestConn,
            Self::ConfConn => PacketType::ConfConn,
            Self::QnchAddRqst(_) => PacketType::QnchAddRqst,
            Self::QnchModRqst(_) => PacketType::QnchModRqst,
            Self::QnchDelRqst(_) => PacketType::QnchDelRqst,
            Self::QnchRply(_) => PacketType::QnchRply,
            Self::SubAddNotify(_) => PacketType::SubAddNotify,
            Self::SubModNotify(_) => PacketType::SubModNotify,
            Self::SubDelNotify(_) => PacketType::SubDelNotify,
        }
    }

    /// Human-readable packet name.
    pub fn name(&self) -> &'static str {
        self.packet_type().name()
    }

    /// Transaction id for requests, their replies and Nacks.
    pub fn xid(&self) -> Option<Xid> {
        match self {
            Self::Nack(p) => Some(p.xid),
            Self::ConnRqst(p) => Some(p.xid),
            Self::ConnRply(p) => Some(p.xid),
            Self::DisconnRqst(p) => Some(p.xid),
            Self::DisconnRply(p) => Some(p.xid),
            Self::SecRqst(p) => Some(p.xid),
            Self::SecRply(p) => Some(p.xid),
            Self::SubAddRqst(p) => Some(p.xid),
            Self::SubModRqst(p) => Some(p.xid),
            Self::SubDelRqst(p) => Some(p.xid),
            Self::SubRply(p) => Some(p.xid),
            Self::QnchAddRqst(p) => Some(p.xid),
            Self::QnchModRqst(p) => Some(p.xid),
            Self::QnchDelRqst(p) => Some(p.xid),
            Self::QnchRply(p) => Some(p.xid),
            Self::UNotify(_)
            | Self::Disconn(_)
            | Self::NotifyEmit(_)
            | Self::NotifyDeliver(_)
            | Self::DropWarn
            | Self::TestConn
            | Self::ConfConn
            | Self::SubAddNotify(_)
            | Self::SubModNotify(_)
            | Self::SubDelNotify(_) => None,
        }
    }

    /// Append the type id and body to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32(self.packet_type().id());
        match self {
            Self::UNotify(p) => p.encode(buf),
            Self::Nack(p) => p.encode(buf),
            Self::ConnRqst(p) => p.encode(buf),
            Self::ConnRply(p) => p.encode(buf),
            Self::DisconnRqst(p) => p.encode(buf),
            Self::DisconnRply(p) => p.encode(buf),
            Self::Disconn(p) => p.encode(buf),
            Self::SecRqst(p) => p.encode(buf),
            Self::SecRply(p) => p.encode(buf),
            Self::NotifyEmit(p) => p.encode(buf),
            Self::NotifyDeliver(p) => p.encode(buf),
            Self::SubAddRqst(p) => p.encode(buf),
            Self::SubModRqst(p) => p.encode(buf),
            Self::SubDelRqst(p) => p.encode(buf),
            Self::SubRply(p) => p.encode(buf),
            Self::DropWarn | Self::TestConn | Self::ConfConn => {},
            Self::QnchAddRqst(p) => p.encode(buf),
            Self::QnchModRqst(p) => p.encode(buf),
            Self::QnchDelRqst(p) => p.encode(buf),
            Self::QnchRply(p) => p.encode(buf),
            Self::SubAddNotify(p) => p.encode(buf),
            Self::SubModNotify(p) => p.encode(buf),
            Self::SubDelNotify(p) => p.encode(buf),
        }
    }

    /// Encode to a packet body (type id plus fields, no frame header).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode a complete packet body.
    ///
    /// # Errors
    ///
    /// - `UnknownPacket` if the type id is not in [`DECODERS`]
    /// - `TrailingBytes` if the body is longer than its fields
    /// - any field-level decode error
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = XdrReader::new(bytes);
        let id = reader.read_i32()?;
        let decode = DECODERS
            .iter()
            .find(|(ty, _)| ty.id() == id)
            .map(|(_, decode)| *decode)
            .ok_or(ProtocolError::UnknownPacket(id))?;
        let packet = decode(&mut reader)?;
        reader.finish()?;
        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Self::UNotify(p) => write!(f, " {} insecure={}", p.attributes, p.deliver_insecure),
            Self::Nack(p) => {
                write!(f, " xid={} code={} \"{}\"", p.xid, p.code, p.expanded_message())
            },
            Self::ConnRqst(p) => write!(
                f,
                " xid={} version={}.{} options={}",
                p.xid,
                p.version_major,
                p.version_minor,
                p.options.len()
            ),
            Self::ConnRply(p) => write!(f, " xid={} options={}", p.xid, p.options.len()),
            Self::DisconnRqst(DisconnRqst { xid })
            | Self::DisconnRply(DisconnRply { xid })
            | Self::SecRply(SecRply { xid }) => write!(f, " xid={xid}"),
            Self::Disconn(p) => write!(f, " reason={} args={:?}", p.reason.code(), p.args),
            Self::SecRqst(p) => write!(
                f,
                " xid={} +ntfn={} -ntfn={} +sub={} -sub={}",
                p.xid,
                p.add_notification_keys.key_count(),
                p.del_notification_keys.key_count(),
                p.add_subscription_keys.key_count(),
                p.del_subscription_keys.key_count()
            ),
            Self::NotifyEmit(p) => write!(f, " {} insecure={}", p.attributes, p.deliver_insecure),
            Self::NotifyDeliver(p) => write!(
                f,
                " {} secure={:x?} insecure={:x?}",
                p.attributes, p.secure_matches, p.insecure_matches
            ),
            Self::SubAddRqst(p) => {
                write!(f, " xid={} {:?} insecure={}", p.xid, p.expression, p.accept_insecure)
            },
            Self::SubModRqst(p) => {
                write!(f, " xid={} id={:x} {:?}", p.xid, p.subscription_id, p.expression)
            },
            Self::SubDelRqst(p) => write!(f, " xid={} id={:x}", p.xid, p.subscription_id),
            Self::SubRply(p) => write!(f, " xid={} id={:x}", p.xid, p.subscription_id),
            Self::DropWarn | Self::TestConn | Self::ConfConn => Ok(()),
            Self::QnchAddRqst(p) => write!(f, " xid={} names={:?}", p.xid, p.names),
            Self::QnchModRqst(p) => write!(
                f,
                " xid={} id={:x} +{:?} -{:?}",
                p.xid, p.quench_id, p.add_names, p.del_names
            ),
            Self::QnchDelRqst(p) => write!(f, " xid={} id={:x}", p.xid, p.quench_id),
            Self::QnchRply(p) => write!(f, " xid={} id={:x}", p.xid, p.quench_id),
            Self::SubAddNotify(p) => {
                write!(f, " quenches={:x?} term={:x} {:?}", p.quench_ids, p.term_id, p.expression)
            },
            Self::SubModNotify(p) => {
                write!(f, " quenches={:x?} term={:x} {:?}", p.quench_ids, p.term_id, p.expression)
            },
            Self::SubDelNotify(p) => write!(f, " quenches={:x?} term={:x}", p.quench_ids, p.term_id),
        }
    }
}

macro_rules! packet_from {
    ($($variant:ident),+) => {$(
        impl From<$variant> for Packet {
            fn from(body: $variant) -> Self {
                Self::$variant(body)
            }
        }
    )+};
}

packet_from!(
    UNotify,
    Nack,
    ConnRqst,
    ConnRply,
    DisconnRqst,
    DisconnRply,
    Disconn,
    SecRqst,
    SecRply,
    NotifyEmit,
    NotifyDeliver,
    SubAddRqst,
    SubModRqst,
    SubDelRqst,
    SubRply,
    QnchAddRqst,
    QnchModRqst,
    QnchDelRqst,
    QnchRply,
    SubAddNotify,
    SubModNotify,
    SubDelNotify
);

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        keys::{KeyBlock, KeyScheme},
        nack::NackCode,
        notification::Notification,
        payloads::DisconnReason,
        value::Value,
    };

    fn samples() -> Vec<Packet> {
        let keys = KeyBlock::new().with_key(KeyScheme::Sha256Producer, 0, "secret").unwrap();
        vec![
            ConnRqst::new(1).into(),
            Nack::new(2, NackCode::ParseError, vec![Value::from("==")]).into(),
            Disconn::new(DisconnReason::Shutdown).into(),
            NotifyEmit {
                attributes: Notification::new().with("Group", "eng").with("count", 7),
                deliver_insecure: true,
                keys,
            }
            .into(),
            SubRply { xid: 3, subscription_id: 42 }.into(),
            Packet::TestConn,
            Packet::ConfConn,
            Packet::DropWarn,
            SubDelNotify { quench_ids: vec![5], term_id: 6 }.into(),
        ]
    }

    #[test]
    fn every_sample_round_trips() {
        for packet in samples() {
            let bytes = packet.encode();
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
            assert_eq!(packet_id(&bytes).unwrap(), packet.packet_type().id());
        }
    }

    #[test]
    fn decoder_table_covers_every_type_once() {
        for (index, (ty, _)) in DECODERS.iter().enumerate() {
            assert_eq!(PacketType::from_id(ty.id()), Some(*ty));
            assert!(DECODERS[index + 1..].iter().all(|(other, _)| other != ty));
        }
    }

    #[test]
    fn test_conn_is_bare_type() {
        assert_eq!(&Packet::TestConn.encode()[..], &hex!("00 00 00 3f"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let input = hex!("00 00 00 63");
        assert_eq!(Packet::decode(&input), Err(ProtocolError::UnknownPacket(99)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let input = hex!("00 00 00 3f 00 00 00 00");
        assert_eq!(Packet::decode(&input), Err(ProtocolError::TrailingBytes(4)));
    }

    #[test]
    fn packet_id_only_needs_four_bytes() {
        let input = hex!("00 00 00 38 ff");
        assert_eq!(packet_id(&input), Ok(56));
        assert!(packet_id(&input[..3]).is_err());
    }

    #[test]
    fn display_names_the_packet() {
        let packet: Packet = SubRply { xid: 3, subscription_id: 0x2a }.into();
        assert_eq!(packet.to_string(), "SubRply xid=3 id=2a");
        assert_eq!(packet.xid(), Some(3));
        assert_eq!(Packet::TestConn.xid(), None);
    }

    proptest! {
        #[test]
        fn arbitrary_input_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Packet::decode(&bytes);
        }

        #[test]
        fn valid_type_with_garbage_never_panics(
            index in 0..DECODERS.len(),
            tail in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut bytes = DECODERS[index].0.id().to_be_bytes().to_vec();
            bytes.extend_from_slice(&tail);
            let _ = Packet::decode(&bytes);
        }
    }
}
