use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

// ---------------------------------------------------------------------------
// RatePolicy
// ---------------------------------------------------------------------------

/// Admission policy for one throttle tier: a request every `interval`, with
/// `burst` requests allowed back-to-back from a cold start.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    /// Time one admitted request "costs".
    interval: Duration,
    /// How many requests may land before spacing kicks in.
    burst: u32,
}

impl RatePolicy {
    fn spread(count: u32, window: Duration) -> Self {
        let count = count.max(1);
        Self {
            interval: (window / count).max(Duration::from_nanos(1)),
            burst: count,
        }
    }

    /// Admit `count` requests per second.
    pub fn per_second(count: u32) -> Self {
        Self::spread(count, Duration::from_secs(1))
    }

    /// Admit `count` requests per minute.
    pub fn per_minute(count: u32) -> Self {
        Self::spread(count, Duration::from_secs(60))
    }

    /// Admit `count` requests per hour.
    pub fn per_hour(count: u32) -> Self {
        Self::spread(count, Duration::from_secs(3600))
    }

    /// Cap the cold-start burst below the per-window count.
    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1);
        self
    }

    /// How far a key's deadline may run ahead of the wall clock before
    /// requests are refused.
    fn slack(&self) -> Duration {
        self.interval * self.burst.saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// RateExceeded
// ---------------------------------------------------------------------------

/// A request arrived faster than the policy admits.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request rate exceeded for `{scope}`; retry in {retry_in:?}")]
pub struct RateExceeded {
    /// The scope whose budget ran out (client, endpoint, or the shared
    /// global scope).
    pub scope: String,
    /// How long until the next request would be admitted.
    pub retry_in: Duration,
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Spacing-based request throttle (the virtual-scheduling form of the leaky
/// bucket).
///
/// Each scope carries a single deadline: the instant by which everything
/// admitted so far is "paid off". Admitting a request pushes the deadline
/// one interval further; a request is refused while the deadline sits more
/// than the policy's burst slack ahead of the wall clock. Idle scopes decay
/// naturally as the clock catches up with their deadline.
#[derive(Debug)]
pub struct Throttle {
    policy: RatePolicy,
    deadlines: DashMap<String, Instant>,
}

impl Throttle {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            deadlines: DashMap::new(),
        }
    }

    /// Admit one request for `scope`, or report how long to wait.
    pub fn admit(&self, scope: &str) -> Result<(), RateExceeded> {
        let now = Instant::now();
        let mut deadline = self
            .deadlines
            .entry(scope.to_string())
            .or_insert(now);

        let paid_off = (*deadline).max(now);
        let ahead = paid_off - now;
        if ahead > self.policy.slack() {
            let retry_in = ahead - self.policy.slack();
            warn!(scope, ?retry_in, "request rate exceeded");
            return Err(RateExceeded {
                scope: scope.to_string(),
                retry_in,
            });
        }

        *deadline = paid_off + self.policy.interval;
        Ok(())
    }

    /// How many back-to-back requests `scope` could make right now.
    pub fn headroom(&self, scope: &str) -> u32 {
        let now = Instant::now();
        let Some(deadline) = self.deadlines.get(scope) else {
            return self.policy.burst;
        };
        if *deadline <= now {
            return self.policy.burst;
        }

        let ahead = *deadline - now;
        let slack = self.policy.slack();
        if ahead > slack {
            return 0;
        }
        let spare = ((slack - ahead).as_nanos() / self.policy.interval.as_nanos()) as u32;
        (spare + 1).min(self.policy.burst)
    }
}

// ---------------------------------------------------------------------------
// EdgeThrottle
// ---------------------------------------------------------------------------

/// The three edge tiers, checked in widening order: the shared global
/// budget, then the caller, then the endpoint. The first tier that refuses
/// names itself in the error.
#[derive(Debug)]
pub struct EdgeThrottle {
    global: Throttle,
    per_client: Throttle,
    per_endpoint: Throttle,
}

/// Scope key for the shared global tier.
const GLOBAL_SCOPE: &str = "global";

impl EdgeThrottle {
    pub fn new(global: RatePolicy, per_client: RatePolicy, per_endpoint: RatePolicy) -> Self {
        Self {
            global: Throttle::new(global),
            per_client: Throttle::new(per_client),
            per_endpoint: Throttle::new(per_endpoint),
        }
    }

    /// Admit one request across all three tiers.
    pub fn admit(&self, client: &str, endpoint: &str) -> Result<(), RateExceeded> {
        self.global.admit(GLOBAL_SCOPE)?;
        self.per_client.admit(client)?;
        self.per_endpoint.admit(endpoint)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
