//! Elvin router.
//!
//! Routes notifications from producers to the subscriptions whose filter and
//! security keys accept them.
//!
//! # Architecture
//!
//! - [`router`]: sans-IO request handling; returns [`RouterAction`]s
//! - [`dispatch`]: notification fan-out and quench change notices
//! - [`session`]: per-connection state behind a connection-scoped lock
//! - [`server`]: async runtime (accept loop, reader/writer tasks, sinks)
//! - [`config`]: router configuration and option negotiation
//!
//! ```text
//! Listener ──> RouterServer ──> reader task ──> RouterCore::handle_packet
//!                                   │                   │
//!                                   │            RouterAction
//!                                   ↓                   ↓
//!                              writer task <── outbound queue / sinks
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod router;
pub mod server;
pub mod session;

pub use config::{ConnectionLimits, RouterConfig};
pub use dispatch::{ChangeKind, NotifyRequest, QuenchEvent, SubscriptionEvent};
pub use error::RouterError;
pub use router::{RouterAction, RouterCore};
pub use server::RouterServer;
pub use session::{Session, SessionInfo, SessionState};
