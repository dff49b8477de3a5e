//! Deterministic simulation harness for Elvin router and client testing.
//!
//! Seeded implementations of the [`elvin_core::Environment`] trait and two
//! network backends for the [`elvin_core::Transport`] and
//! [`elvin_core::Listener`] traits:
//!
//! - [`SimTransport`] / [`SimListener`]: turmoil TCP, for multi-host
//!   scenarios with partitions and virtual time
//! - [`MemoryNetwork`]: tokio duplex pipes, for fast single-process
//!   end-to-end tests
//!
//! [`SimRouter`] runs a [`elvin_router::RouterServer`] on any listener.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;
pub mod sim_env;
pub mod sim_router;
pub mod sim_transport;

pub use memory::{MemoryListener, MemoryNetwork, MemoryTransport};
pub use sim_env::SimEnv;
pub use sim_router::SimRouter;
pub use sim_transport::{SimListener, SimTransport};
