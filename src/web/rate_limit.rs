//! Process-local, per-IP token bucket for abuse-prone endpoints.

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Keyed rate limiter: each client IP gets its own bucket.
pub struct IpRateLimiter {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
    clock: DefaultClock,
}

impl IpRateLimiter {
    /// `burst` requests per `period` per key.
    pub fn new(burst: u32, period: Duration) -> Self {
        let quota = Quota::with_period(period / burst)
            .expect("nonzero refill period")
            .allow_burst(NonZeroU32::new(burst).expect("nonzero burst"));
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    /// The canonical instance guarding the OAuth start endpoint:
    /// 10 requests per 60 seconds per IP.
    pub fn oauth_start() -> Self {
        Self::new(10, Duration::from_secs(60))
    }

    /// Check one request. On denial returns the whole seconds until the
    /// next refill, suitable for a `Retry-After` header (at least 1).
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        match self.limiter.check_key(&ip.to_owned()) {
            Ok(_) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(wait.as_secs().max(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_burst_then_denies() {
        let limiter = IpRateLimiter::new(10, Duration::from_secs(60));
        for i in 0..10 {
            assert!(limiter.check("1.2.3.4").is_ok(), "request {i} should pass");
        }
        let retry = limiter.check("1.2.3.4").expect_err("11th request denied");
        assert!(retry >= 1);
        assert!(retry <= 60);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = IpRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("10.0.0.1").is_ok());
        assert!(limiter.check("10.0.0.1").is_ok());
        assert!(limiter.check("10.0.0.1").is_err());
        assert!(limiter.check("10.0.0.2").is_ok());
    }
}
