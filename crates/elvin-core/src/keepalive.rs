//! Keepalive watchdog.
//!
//! Driven by the writer task's timer. After a full idle interval with nothing
//! received, the writer sends TestConn (only when its outbound queue is empty,
//! so a backed-up connection is never checked) and waits the shorter response
//! timeout. Any packet received in the meantime counts as the response.
//!
//! ```text
//! ┌──────┐ timer, queue empty ┌──────────────────┐ packet received ┌─────────────┐
//! │ Idle │───────────────────>│ AwaitingResponse │────────────────>│ HadResponse │
//! └──────┘                    └──────────────────┘                 └─────────────┘
//!    ↑                                 │ response timeout                 │ timer
//!    │                                 ↓                                  │
//!    │                              Close                                 │
//!    └────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::{Duration, Instant};

/// Keepalive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Quiet period before a liveness check is sent.
    pub idle_interval: Duration,
    /// Time allowed for any packet to arrive after a liveness check.
    pub response_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { idle_interval: Duration::from_secs(60), response_timeout: Duration::from_secs(10) }
    }
}

/// Watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    /// Nothing received since the last timer.
    Idle,
    /// Check sent, waiting for any packet.
    AwaitingResponse,
    /// Something was received since the last timer.
    HadResponse,
}

/// What the writer should do when its timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send TestConn.
    SendTestConn,
    /// Peer is unresponsive; close the connection.
    Close {
        /// Reason for logs.
        reason: String,
    },
}

/// Keepalive watchdog for one connection.
#[derive(Debug, Clone)]
pub struct Keepalive {
    config: KeepaliveConfig,
    state: KeepaliveState,
    check_sent_at: Option<Instant>,
}

impl Keepalive {
    /// Start in `HadResponse` so the first timer only re-arms.
    pub fn new(config: KeepaliveConfig) -> Self {
        Self { config, state: KeepaliveState::HadResponse, check_sent_at: None }
    }

    /// Current state.
    pub fn state(&self) -> KeepaliveState {
        self.state
    }

    /// Record that a packet arrived.
    pub fn on_packet_received(&mut self) {
        self.state = KeepaliveState::HadResponse;
        self.check_sent_at = None;
    }

    /// Delay until the timer should next fire.
    pub fn timer_period(&self) -> Duration {
        match self.state {
            KeepaliveState::AwaitingResponse => self.config.response_timeout,
            KeepaliveState::Idle | KeepaliveState::HadResponse => self.config.idle_interval,
        }
    }

    /// Handle a timer expiry.
    ///
    /// `queue_empty` reports whether the outbound queue has drained.
    pub fn on_timer(&mut self, now: Instant, queue_empty: bool) -> Option<KeepaliveAction> {
        match self.state {
            KeepaliveState::HadResponse => {
                self.state = KeepaliveState::Idle;
                None
            },
            KeepaliveState::Idle if queue_empty => {
                self.state = KeepaliveState::AwaitingResponse;
                self.check_sent_at = Some(now);
                Some(KeepaliveAction::SendTestConn)
            },
            KeepaliveState::Idle => None,
            KeepaliveState::AwaitingResponse => {
                let sent = self.check_sent_at.unwrap_or(now);
                let waited = now.saturating_duration_since(sent);
                (waited >= self.config.response_timeout).then(|| KeepaliveAction::Close {
                    reason: format!("no response to keepalive after {waited:?}"),
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KeepaliveConfig {
        KeepaliveConfig { idle_interval: Duration::from_secs(30), response_timeout: Duration::from_secs(5) }
    }

    #[test]
    fn quiet_peer_is_checked_then_closed() {
        let t0 = Instant::now();
        let mut keepalive = Keepalive::new(config());

        assert_eq!(keepalive.on_timer(t0, true), None);
        assert_eq!(keepalive.state(), KeepaliveState::Idle);

        let t1 = t0 + Duration::from_secs(30);
        assert_eq!(keepalive.on_timer(t1, true), Some(KeepaliveAction::SendTestConn));
        assert_eq!(keepalive.timer_period(), Duration::from_secs(5));

        let t2 = t1 + Duration::from_secs(5);
        assert!(matches!(keepalive.on_timer(t2, true), Some(KeepaliveAction::Close { .. })));
    }

    #[test]
    fn any_packet_answers_the_check() {
        let t0 = Instant::now();
        let mut keepalive = Keepalive::new(config());
        keepalive.on_timer(t0, true);
        keepalive.on_timer(t0, true);
        assert_eq!(keepalive.state(), KeepaliveState::AwaitingResponse);

        keepalive.on_packet_received();
        assert_eq!(keepalive.state(), KeepaliveState::HadResponse);
        assert_eq!(keepalive.on_timer(t0 + Duration::from_secs(60), true), None);
        assert_eq!(keepalive.state(), KeepaliveState::Idle);
    }

    #[test]
    fn backed_up_queue_suppresses_check() {
        let t0 = Instant::now();
        let mut keepalive = Keepalive::new(config());
        keepalive.on_timer(t0, true);
        assert_eq!(keepalive.on_timer(t0, false), None);
        assert_eq!(keepalive.state(), KeepaliveState::Idle);
        assert_eq!(keepalive.on_timer(t0, true), Some(KeepaliveAction::SendTestConn));
    }

    #[test]
    fn early_timer_does_not_close() {
        let t0 = Instant::now();
        let mut keepalive = Keepalive::new(config());
        keepalive.on_timer(t0, true);
        keepalive.on_timer(t0, true);
        assert_eq!(keepalive.on_timer(t0 + Duration::from_secs(1), true), None);
    }
}
