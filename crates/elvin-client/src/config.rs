//! Client configuration.

use std::time::Duration;

use elvin_core::KeepaliveConfig;
use elvin_proto::{ConnectionOptions, KeyBlock};

/// When and how often to reconnect after losing the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect at all. Redirects are followed either way.
    pub enabled: bool,
    /// Delay before the first attempt.
    pub initial_wait: Duration,
    /// Lower bound on every later delay.
    pub min_wait: Duration,
    /// Upper bound on every delay, jitter included.
    pub max_wait: Duration,
    /// Growth factor between attempts.
    pub multiplier: u32,
    /// Largest random amount added to each delay.
    pub jitter: Duration,
    /// Attempts before giving up. Zero retries forever.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_wait: Duration::from_millis(250),
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
            multiplier: 4,
            jitter: Duration::from_millis(250),
            max_retries: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect on connection loss or router shutdown.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed for each request's reply, the handshake included.
    pub request_timeout: Duration,
    /// Liveness probing of the router.
    pub keepalive: KeepaliveConfig,
    /// Options requested in ConnRqst.
    pub options: ConnectionOptions,
    /// Connection-level keys attached to every outgoing notification.
    pub notification_keys: KeyBlock,
    /// Connection-level keys applied to every subscription.
    pub subscription_keys: KeyBlock,
    /// Reconnection behaviour.
    pub reconnect: ReconnectPolicy,
    /// Outbound queue length.
    pub queue_capacity: usize,
    /// Buffered [`crate::ClientEvent`]s per receiver.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
            options: ConnectionOptions::new(),
            notification_keys: KeyBlock::new(),
            subscription_keys: KeyBlock::new(),
            reconnect: ReconnectPolicy::default(),
            queue_capacity: 256,
            event_capacity: 64,
        }
    }
}
