//! Fixed-rate client-side throttle.
//!
//! Independent of per-user quotas: it only keeps this process under the
//! upstream's published request rate.

use std::num::NonZeroU32;

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct Throttle {
    limiter: DirectLimiter,
    per_second: NonZeroU32,
}

impl Throttle {
    /// Allows `requests_per_second` calls per second, bursting up to the same
    /// number. Zero is treated as one.
    pub fn per_second(requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            per_second,
        }
    }

    pub fn rate(&self) -> u32 {
        self.per_second.get()
    }

    /// Waits until one more request may be sent.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("per_second", &self.per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_rate_is_clamped() {
        assert_eq!(Throttle::per_second(0).rate(), 1);
        assert_eq!(Throttle::per_second(5).rate(), 5);
    }

    #[tokio::test]
    async fn test_burst_then_wait() {
        let throttle = Throttle::per_second(2);
        let started = Instant::now();

        throttle.acquire().await;
        throttle.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(200));

        throttle.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
