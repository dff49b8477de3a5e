//! Elvin protocol core logic
//!
//! State machines and matching rules shared by the router and the client
//! library, plus the small async layer both use to move packets over a
//! byte stream.
//!
//! # Architecture
//!
//! Protocol decisions live in deterministic state machines that never touch
//! sockets, clocks or random number generators directly. Time is passed in
//! as `now: Instant`, randomness comes from an [`env::Environment`], and
//! transitions return declarative actions that a driver executes.
//!
//! The async pieces ([`framing`], [`driver`], [`transport`]) are thin: they
//! read and write frames and run the keepalive timer, and hand every decision
//! back to the state machines.
//!
//! # Components
//!
//! - [`connection`]: connection lifecycle and per-state packet legality
//! - [`keepalive`]: liveness probing
//! - [`security`]: key priming and the delivery authorization rules
//! - [`registry`]: per-connection subscription and quench slot maps
//! - [`expr`]: subscription expression engine interface and a basic engine
//! - [`framing`]: async frame reader and writer
//! - [`driver`]: per-connection writer task and outbound queue
//! - [`mod@env`]: environment abstraction (time, RNG)
//! - [`transport`]: transport abstraction (byte streams)
//! - [`error`]: error types

pub mod connection;
pub mod driver;
pub mod env;
pub mod error;
pub mod expr;
pub mod framing;
pub mod keepalive;
pub mod registry;
pub mod security;
pub mod transport;

pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState, Role};
pub use driver::{ActivitySignal, Outgoing, WriterExit, run_writer};
pub use env::{Environment, SystemEnv};
pub use error::{ConnectionError, FrameError, RegistryError};
pub use expr::{BasicExpressions, ExpressionEngine, ExpressionError, Filter};
pub use keepalive::{Keepalive, KeepaliveAction, KeepaliveConfig, KeepaliveState};
pub use registry::{Quench, QuenchChange, Registry, Subscription, SubscriptionChange, SyntheticId};
pub use security::{Delivery, PrimedKeys, Side};
pub use transport::{Listener, TcpAcceptor, TcpTransport, Transport};
