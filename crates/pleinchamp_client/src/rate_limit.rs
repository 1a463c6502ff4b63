//! Request quota for the Pleinchamp API.
//!
//! Caps how many fetches a process issues per hour. The burst equals the
//! hourly budget and slots refill evenly across the hour; callers wait in
//! [`RequestQuota::until_ready`] once the burst is spent.

use std::num::NonZeroU32;
use std::sync::Arc;

use common::Error;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Hourly request budget shared by clones.
#[derive(Debug, Clone)]
pub struct RequestQuota {
    limiter: Arc<DirectLimiter>,
}

impl RequestQuota {
    pub fn per_hour(requests: u32) -> Result<Self, Error> {
        let n = NonZeroU32::new(requests)
            .ok_or_else(|| Error::Config("max_requests_per_hour must be > 0".into()))?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_hour(n))),
        })
    }

    /// Wait until a request slot is available.
    pub async fn until_ready(&self) {
        self.limiter.until_ready().await;
    }
}
