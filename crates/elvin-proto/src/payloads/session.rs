//! Session packets: connect, disconnect, security changes and Nack.

use bytes::{BufMut, BytesMut};

use crate::{
    errors::Result,
    keys::KeyBlock,
    nack::{NackCode, expand_message},
    notification::ConnectionOptions,
    value::{Value, put_values, read_values},
    xdr::{Decode, Encode, XdrBufMut, XdrReader},
    xid::Xid,
};

/// Protocol major version spoken by this library.
pub const PROTOCOL_MAJOR: i32 = 4;
/// Protocol minor version spoken by this library.
pub const PROTOCOL_MINOR: i32 = 0;

/// Connection request.
///
/// # Protocol Flow
///
/// First packet a client sends. The router answers with [`ConnRply`] carrying
/// the options it accepted, or a [`Nack`] if the version or an option is
/// unacceptable. The key blocks become the connection-level notification and
/// subscription keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Client protocol major version.
    pub version_major: i32,
    /// Client protocol minor version.
    pub version_minor: i32,
    /// Requested connection options.
    pub options: ConnectionOptions,
    /// Raw keys applied to every notification this connection emits.
    pub notification_keys: KeyBlock,
    /// Raw keys applied to every subscription this connection holds.
    pub subscription_keys: KeyBlock,
}

impl ConnRqst {
    /// Request at the current protocol version with no options or keys.
    pub fn new(xid: Xid) -> Self {
        Self {
            xid,
            version_major: PROTOCOL_MAJOR,
            version_minor: PROTOCOL_MINOR,
            options: ConnectionOptions::new(),
            notification_keys: KeyBlock::new(),
            subscription_keys: KeyBlock::new(),
        }
    }
}

impl Encode for ConnRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i32(self.version_major);
        buf.put_i32(self.version_minor);
        self.options.encode(buf);
        self.notification_keys.encode(buf);
        self.subscription_keys.encode(buf);
    }
}

impl Decode for ConnRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            version_major: reader.read_i32()?,
            version_minor: reader.read_i32()?,
            options: ConnectionOptions::decode(reader)?,
            notification_keys: KeyBlock::decode(reader)?,
            subscription_keys: KeyBlock::decode(reader)?,
        })
    }
}

/// Connection reply carrying the options the router granted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnRply {
    /// Transaction id of the ConnRqst.
    pub xid: Xid,
    /// Accepted options with their granted values.
    pub options: ConnectionOptions,
}

impl Encode for ConnRply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        self.options.encode(buf);
    }
}

impl Decode for ConnRply {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { xid: reader.read_i32()?, options: ConnectionOptions::decode(reader)? })
    }
}

/// Client-initiated graceful disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnRqst {
    /// Transaction id.
    pub xid: Xid,
}

/// Router acknowledgement of a [`DisconnRqst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnRply {
    /// Transaction id of the DisconnRqst.
    pub xid: Xid,
}

/// Router acknowledgement of a [`SecRqst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecRply {
    /// Transaction id of the SecRqst.
    pub xid: Xid,
}

macro_rules! xid_only_body {
    ($($name:ident),+) => {$(
        impl Encode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_i32(self.xid);
            }
        }

        impl Decode for $name {
            fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
                Ok(Self { xid: reader.read_i32()? })
            }
        }
    )+};
}

xid_only_body!(DisconnRqst, DisconnRply, SecRply);

/// Why the router is dropping a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnReason {
    /// Router is shutting down.
    Shutdown,
    /// Client should reconnect to the address in the Disconn arguments.
    Redirect,
    /// Router detected a protocol error from this client.
    ProtocolViolation,
    /// Any other reason code.
    Other(i32),
}

impl DisconnReason {
    /// Wire code.
    pub fn code(self) -> i32 {
        match self {
            Self::Shutdown => 1,
            Self::Redirect => 2,
            Self::ProtocolViolation => 4,
            Self::Other(code) => code,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Shutdown,
            2 => Self::Redirect,
            4 => Self::ProtocolViolation,
            other => Self::Other(other),
        }
    }
}

/// Unsolicited router-initiated disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconn {
    /// Reason code.
    pub reason: DisconnReason,
    /// Reason arguments; the new router address for a redirect.
    pub args: String,
}

impl Disconn {
    /// Disconnect with no arguments.
    pub fn new(reason: DisconnReason) -> Self {
        Self { reason, args: String::new() }
    }

    /// Redirect to `address`.
    pub fn redirect(address: impl Into<String>) -> Self {
        Self { reason: DisconnReason::Redirect, args: address.into() }
    }
}

impl Encode for Disconn {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.reason.code());
        buf.put_xdr_string(&self.args);
    }
}

impl Decode for Disconn {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self { reason: DisconnReason::from_code(reader.read_i32()?), args: reader.read_string()? })
    }
}

/// Negative acknowledgement of a request.
///
/// `message` may contain `%1`, `%2`, ... placeholders referring to `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct Nack {
    /// Transaction id of the failed request, 0 when there was none.
    pub xid: Xid,
    /// Error code.
    pub code: NackCode,
    /// Message template.
    pub message: String,
    /// Substitution arguments.
    pub args: Vec<Value>,
}

impl Nack {
    /// Nack with the code's default message.
    pub fn new(xid: Xid, code: NackCode, args: Vec<Value>) -> Self {
        Self { xid, code, message: code.default_message().to_owned(), args }
    }

    /// Message with placeholders filled in.
    pub fn expanded_message(&self) -> String {
        expand_message(&self.message, &self.args)
    }
}

impl Encode for Nack {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_xdr_u16(self.code.code() as u16);
        buf.put_xdr_string(&self.message);
        put_values(buf, &self.args);
    }
}

impl Decode for Nack {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            code: NackCode::from_code(i32::from(reader.read_u16()?)),
            message: reader.read_string()?,
            args: read_values(reader)?,
        })
    }
}

/// Change the connection-level key blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecRqst {
    /// Transaction id.
    pub xid: Xid,
    /// Notification keys to add.
    pub add_notification_keys: KeyBlock,
    /// Notification keys to remove.
    pub del_notification_keys: KeyBlock,
    /// Subscription keys to add.
    pub add_subscription_keys: KeyBlock,
    /// Subscription keys to remove.
    pub del_subscription_keys: KeyBlock,
}

impl Encode for SecRqst {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        self.add_notification_keys.encode(buf);
        self.del_notification_keys.encode(buf);
        self.add_subscription_keys.encode(buf);
        self.del_subscription_keys.encode(buf);
    }
}

impl Decode for SecRqst {
    fn decode(reader: &mut XdrReader<'_>) -> Result<Self> {
        Ok(Self {
            xid: reader.read_i32()?,
            add_notification_keys: KeyBlock::decode(reader)?,
            del_notification_keys: KeyBlock::decode(reader)?,
            add_subscription_keys: KeyBlock::decode(reader)?,
            del_subscription_keys: KeyBlock::decode(reader)?,
        })
    }
}
