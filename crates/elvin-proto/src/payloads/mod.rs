//! Packet bodies.
//!
//! Each body type encodes and decodes only its own fields; the packet type
//! id in front of it is handled by [`crate::Packet`].
//!
//! # Organization
//!
//! - [`session`]: connection lifecycle, security changes, errors
//! - [`notify`]: notification emission and delivery
//! - [`subscription`]: subscription add/modify/delete
//! - [`quench`]: quench add/modify/delete and subscription change notices

pub mod notify;
pub mod quench;
pub mod session;
pub mod subscription;

pub use notify::{NotifyDeliver, NotifyEmit, UNotify};
pub use quench::{
    QnchAddRqst, QnchDelRqst, QnchModRqst, QnchRply, SubAddNotify, SubDelNotify, SubModNotify,
};
pub use session::{
    ConnRply, ConnRqst, Disconn, DisconnReason, DisconnRply, DisconnRqst, Nack, PROTOCOL_MAJOR,
    PROTOCOL_MINOR, SecRply, SecRqst,
};
pub use subscription::{SubAddRqst, SubDelRqst, SubModRqst, SubRply};
