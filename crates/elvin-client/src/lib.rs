//! Elvin client library.
//!
//! Connects to an Elvin router, emits notifications and manages
//! subscriptions and quenches, surviving router restarts and redirects.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  ops   ┌──────┐  mpsc<Outgoing>  ┌─────────────┐
//!  │ Client       │───────>│ Link │─────────────────>│ writer task │──> router
//!  │  (handles)   │<─┐     │      │                  └─────────────┘
//!  └──────────────┘  │     │      │  read_packet     ┌─────────────┐
//!         ↑          └─────│ pending replies <───────│ reader task │<── router
//!         │                └──────┘                  └─────────────┘
//!  ┌──────────────┐ LinkDown  │                              │
//!  │ supervisor   │<──────────┘      deliveries, notices     │
//!  │  (reconnect) │                 ┌─────────┐<─────────────┘
//!  └──────────────┘                 │ Tracker │──> Subscription / Quench
//!                                   └─────────┘
//! ```
//!
//! - [`Client`]: public operations; each request waits for its reply with a
//!   timeout
//! - `link`: one router connection, its reader and writer tasks
//! - `tracked`: registrations that outlive a connection, and reply routing
//! - `reconnect`: backoff, replay and rollback after a lost connection
//!
//! Connection legality checks and keepalive come from `elvin-core`; this
//! crate only decides what to do with what the router sends.

mod backoff;
mod client;
mod config;
mod error;
mod events;
mod handle;
mod link;
mod reconnect;
mod tracked;

pub use backoff::Backoff;
pub use client::Client;
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::ClientError;
pub use events::{ClientEvent, DisconnectReason};
pub use handle::{KeyChanges, Notified, Quench, QuenchNotice, QuenchUpdate, Subscription, SubscriptionUpdate};
