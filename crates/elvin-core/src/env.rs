//! Environment abstraction for time and randomness.
//!
//! Production code uses [`SystemEnv`]; the simulation harness supplies a
//! seeded implementation driven by virtual time so runs are reproducible.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use rand::RngCore;

/// Source of time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> Instant;

    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random 32-bit value.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Random 64-bit value.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}

/// Wall-clock time and the thread-local OS-seeded RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_follows_tokio_time() {
        let env = SystemEnv;
        let start = env.now();
        env.sleep(Duration::from_secs(5)).await;
        assert!(env.now() - start >= Duration::from_secs(5));
    }

    #[test]
    fn random_values_vary() {
        let env = SystemEnv;
        let samples: Vec<u64> = (0..8).map(|_| env.random_u64()).collect();
        assert!(samples.windows(2).any(|pair| pair[0] != pair[1]));
    }
}
