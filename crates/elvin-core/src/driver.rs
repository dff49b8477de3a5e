//! Per-connection writer task.
//!
//! Every connection runs two tasks. The reader is owned by the router or the
//! client, since what to do with an incoming packet differs between them.
//! The writer is shared: it drains the bounded outbound queue and owns the
//! keepalive timer.
//!
//! ```text
//!   reader task                         writer task
//! ┌──────────────┐  ActivitySignal   ┌────────────────────┐
//! │ read_packet  │ ────────────────> │ Keepalive          │
//! │ dispatch     │                   │ select! {          │
//! │ queue reply ─┼── mpsc<Outgoing> ─┼─> write_packet     │
//! └──────────────┘                   │   timer -> check   │
//!                                    │ }                  │
//!                                    └────────────────────┘
//! ```
//!
//! The timer runs against a fixed deadline, so steady outbound traffic does
//! not postpone it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use elvin_proto::Packet;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    env::Environment,
    error::FrameError,
    framing::write_packet,
    keepalive::{Keepalive, KeepaliveAction, KeepaliveConfig},
};

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Write this packet.
    Packet(Packet),
    /// Flush what was queued before this item, then close.
    Close {
        /// Reason for logs.
        reason: String,
    },
}

impl From<Packet> for Outgoing {
    fn from(packet: Packet) -> Self {
        Self::Packet(packet)
    }
}

/// Liveness flag set by the reader on every received packet.
#[derive(Debug, Clone, Default)]
pub struct ActivitySignal(Arc<AtomicBool>);

impl ActivitySignal {
    /// New, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a packet arrived.
    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the flag, returning whether anything arrived since the last call.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Why a writer task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    /// All senders dropped.
    Drained,
    /// A `Close` item was reached.
    Closed {
        /// Reason carried by the item.
        reason: String,
    },
    /// The peer did not answer a keepalive check.
    Unresponsive {
        /// Keepalive diagnostic.
        reason: String,
    },
}

/// Drain `queue` into `writer` until closed, running the keepalive timer.
///
/// The stream is shut down before returning. Write errors end the task and
/// are returned to the caller, which treats them as a lost connection.
pub async fn run_writer<W, E>(
    mut writer: W,
    mut queue: mpsc::Receiver<Outgoing>,
    activity: ActivitySignal,
    keepalive: KeepaliveConfig,
    env: E,
) -> Result<WriterExit, FrameError>
where
    W: AsyncWrite + Unpin,
    E: Environment,
{
    let mut keepalive = Keepalive::new(keepalive);
    let mut deadline = env.now() + keepalive.timer_period();

    let exit = loop {
        let remaining = deadline.saturating_duration_since(env.now());
        tokio::select! {
            biased;
            item = queue.recv() => match item {
                Some(Outgoing::Packet(packet)) => {
                    tracing::trace!(%packet, "writing packet");
                    write_packet(&mut writer, &packet).await?;
                },
                Some(Outgoing::Close { reason }) => break WriterExit::Closed { reason },
                None => break WriterExit::Drained,
            },
            () = env.sleep(remaining) => {
                if activity.take() {
                    keepalive.on_packet_received();
                }
                match keepalive.on_timer(env.now(), queue.is_empty()) {
                    Some(KeepaliveAction::SendTestConn) => {
                        tracing::debug!("idle connection, sending TestConn");
                        write_packet(&mut writer, &Packet::TestConn).await?;
                    },
                    Some(KeepaliveAction::Close { reason }) => {
                        tracing::warn!(%reason, "closing unresponsive connection");
                        break WriterExit::Unresponsive { reason };
                    },
                    None => {},
                }
                deadline = env.now() + keepalive.timer_period();
            },
        }
    };

    if let Err(error) = writer.shutdown().await {
        tracing::debug!(%error, "shutdown after writer exit failed");
    }
    Ok(exit)
}
