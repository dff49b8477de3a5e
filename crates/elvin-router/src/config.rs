//! Router configuration and connection option negotiation.

use std::time::Duration;

use elvin_core::KeepaliveConfig;
use elvin_proto::{ConnectionOptions, frame::DEFAULT_MAX_FRAME_LENGTH};

/// Per-connection resource limits.
///
/// The router's configured values are upper bounds; a client may ask for
/// less through ConnRqst options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Largest accepted frame body.
    pub max_packet_length: usize,
    /// Subscriptions allowed per connection.
    pub max_subscriptions: usize,
    /// Longest accepted subscription expression, in bytes.
    pub max_subscription_length: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_packet_length: DEFAULT_MAX_FRAME_LENGTH,
            max_subscriptions: 2048,
            max_subscription_length: 2048,
        }
    }
}

impl ConnectionLimits {
    /// Clamp the client's requested options to these limits.
    ///
    /// Returns the limits in force for the connection and the options to
    /// echo in ConnRply. Unknown, non-integer and non-positive options are
    /// ignored and left out of the reply.
    pub fn negotiate(&self, requested: &ConnectionOptions) -> (Self, ConnectionOptions) {
        let mut limits = *self;
        let mut accepted = ConnectionOptions::new();

        let mut clamp = |name: &str, slot: &mut usize| {
            let Some(value) = requested.get_int(name).filter(|value| *value > 0) else {
                return;
            };
            let value = usize::try_from(value).unwrap_or(usize::MAX).min(*slot);
            *slot = value;
            accepted.set(name, i32::try_from(value).unwrap_or(i32::MAX));
        };
        clamp(ConnectionOptions::PACKET_MAX_LENGTH, &mut limits.max_packet_length);
        clamp(ConnectionOptions::SUBSCRIPTION_MAX_COUNT, &mut limits.max_subscriptions);
        clamp(ConnectionOptions::SUBSCRIPTION_MAX_LENGTH, &mut limits.max_subscription_length);

        (limits, accepted)
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Addresses to listen on (`host:port` or `elvin://host:port`).
    pub listen: Vec<String>,
    /// Concurrent connections accepted before new ones are refused.
    pub max_connections: usize,
    /// Keepalive timing for every connection.
    pub keepalive: KeepaliveConfig,
    /// Address clients are redirected to on failover.
    pub failover: Option<String>,
    /// Outbound queue length per connection.
    pub queue_capacity: usize,
    /// Upper bounds for negotiated connection options.
    pub limits: ConnectionLimits,
    /// Time a new connection has to send ConnRqst before it is closed.
    pub handshake_timeout: Duration,
    /// Time a graceful shutdown waits for queues to drain.
    pub shutdown_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:2917".to_owned()],
            max_connections: 1024,
            keepalive: KeepaliveConfig::default(),
            failover: None,
            queue_capacity: 256,
            limits: ConnectionLimits::default(),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_clamped_to_router_maximum() {
        let limits = ConnectionLimits {
            max_packet_length: 1000,
            max_subscriptions: 10,
            max_subscription_length: 50,
        };
        let requested = ConnectionOptions::new()
            .with(ConnectionOptions::PACKET_MAX_LENGTH, 5000)
            .with(ConnectionOptions::SUBSCRIPTION_MAX_COUNT, 4)
            .with("Vendor.Unknown", 1);

        let (negotiated, reply) = limits.negotiate(&requested);
        assert_eq!(negotiated.max_packet_length, 1000);
        assert_eq!(negotiated.max_subscriptions, 4);
        assert_eq!(negotiated.max_subscription_length, 50);

        assert_eq!(reply.get_int(ConnectionOptions::PACKET_MAX_LENGTH), Some(1000));
        assert_eq!(reply.get_int(ConnectionOptions::SUBSCRIPTION_MAX_COUNT), Some(4));
        assert_eq!(reply.get("Vendor.Unknown"), None);
        assert_eq!(reply.len(), 2);
    }

    #[test]
    fn nonsense_values_are_ignored() {
        let requested = ConnectionOptions::new()
            .with(ConnectionOptions::SUBSCRIPTION_MAX_COUNT, -3)
            .with(ConnectionOptions::SUBSCRIPTION_MAX_LENGTH, "long");
        let (negotiated, reply) = ConnectionLimits::default().negotiate(&requested);
        assert_eq!(negotiated, ConnectionLimits::default());
        assert!(reply.is_empty());
    }
}
