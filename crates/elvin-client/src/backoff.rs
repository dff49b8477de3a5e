//! Reconnect delay schedule.
//!
//! The first delay is `initial_wait`; each later one is the previous delay
//! times `multiplier`, never below `min_wait`. A random jitter up to
//! `jitter` is added and the total is capped at `max_wait`.

use std::time::Duration;

use elvin_core::Environment;

use crate::config::ReconnectPolicy;

/// Delay generator for one reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    /// Fresh schedule.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, current: None, attempts: 0 }
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay<E: Environment>(&mut self, env: &E) -> Option<Duration> {
        if self.policy.max_retries != 0 && self.attempts >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;

        let base = match self.current {
            None => self.policy.initial_wait,
            Some(previous) => previous.saturating_mul(self.policy.multiplier).max(self.policy.min_wait),
        };
        let base = base.min(self.policy.max_wait);
        self.current = Some(base);

        let jitter = jitter(env, self.policy.jitter);
        Some(base.saturating_add(jitter).min(self.policy.max_wait))
    }
}

fn jitter<E: Environment>(env: &E, bound: Duration) -> Duration {
    let bound = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    if bound == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(env.random_u64() % (bound + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use proptest::prelude::*;

    use super::*;

    /// Environment whose random source always yields the same value.
    #[derive(Clone)]
    struct FixedRandom(u64);

    impl Environment for FixedRandom {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, _duration: Duration) {}

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (byte, value) in buffer.iter_mut().zip(self.0.to_le_bytes().iter().cycle()) {
                *byte = *value;
            }
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            initial_wait: Duration::from_millis(100),
            min_wait: Duration::from_millis(50),
            max_wait: Duration::from_secs(10),
            multiplier: 4,
            jitter: Duration::ZERO,
            max_retries: 0,
        }
    }

    #[test]
    fn grows_by_multiplier_until_capped() {
        let env = FixedRandom(0);
        let mut backoff = Backoff::new(policy());
        let delays: Vec<_> = (0..5).filter_map(|_| backoff.next_delay(&env)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_millis(1600),
                Duration::from_millis(6400),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn min_wait_lifts_a_zero_initial_wait() {
        let env = FixedRandom(0);
        let mut backoff = Backoff::new(ReconnectPolicy { initial_wait: Duration::ZERO, ..policy() });
        assert_eq!(backoff.next_delay(&env), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(&env), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next_delay(&env), Some(Duration::from_millis(200)));
    }

    #[test]
    fn retries_are_bounded() {
        let env = FixedRandom(0);
        let mut backoff = Backoff::new(ReconnectPolicy { max_retries: 2, ..policy() });
        assert!(backoff.next_delay(&env).is_some());
        assert!(backoff.next_delay(&env).is_some());
        assert_eq!(backoff.next_delay(&env), None);
        assert_eq!(backoff.attempts(), 2);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_max_wait(seed in any::<u64>(), jitter_ms in 0u64..5_000, rounds in 1usize..20) {
            let env = FixedRandom(seed);
            let mut backoff = Backoff::new(ReconnectPolicy { jitter: Duration::from_millis(jitter_ms), ..policy() });
            for _ in 0..rounds {
                let delay = backoff.next_delay(&env);
                prop_assert!(delay.is_some_and(|delay| delay <= Duration::from_secs(10)));
            }
        }
    }
}
