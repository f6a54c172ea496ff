//! Per-client request throttling.
//!
//! Each throttle key owns a token bucket holding `burst` tokens that refills
//! completely over `window`. A second single-token bucket refilling every
//! `min_interval` enforces spacing between hits; a hit it rejects never
//! reaches the burst bucket, so it costs nothing.
//!
//! Buckets of keys idle long enough to be full again are indistinguishable
//! from new ones and are dropped by [`TokenBucketLimiter::prune`], which the
//! daemon runs periodically through [`TokenBucketLimiter::run_pruner`].

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use stockroom_domain::BusinessId;

/// Decides whether a keyed action may proceed.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record a hit for `key`; `false` means throttled
    async fn allow(&self, key: &str) -> bool;
}

/// Throttle key for storefront order creation from one client address.
pub fn storefront_order_key(business_id: BusinessId, client_ip: &str) -> String {
    let ip = client_ip.trim();
    let ip = if ip.is_empty() { "unknown" } else { ip };
    format!("storefront:{}:order:{}", business_id, ip)
}

/// Buckets of one throttle key
struct ClientBuckets {
    burst: Option<DefaultDirectRateLimiter>,
    spacing: Option<DefaultDirectRateLimiter>,
    /// Last hit, for pruning
    last_access: Instant,
}

/// In-process token bucket limiter keyed by throttle key.
pub struct TokenBucketLimiter {
    burst_quota: Option<Quota>,
    spacing_quota: Option<Quota>,
    idle_after: Duration,
    buckets: DashMap<String, ClientBuckets>,
}

impl TokenBucketLimiter {
    /// A `burst` of zero disables throttling.
    pub fn new(config: RateLimitConfig) -> Self {
        let burst_quota = NonZeroU32::new(config.burst).and_then(|burst| {
            Quota::with_period(config.window / burst.get()).map(|quota| quota.allow_burst(burst))
        });
        let spacing_quota = Quota::with_period(config.min_interval);

        Self {
            burst_quota,
            spacing_quota,
            idle_after: config.window.max(config.min_interval),
            buckets: DashMap::new(),
        }
    }

    /// Idle time after which a key's buckets are full again.
    pub fn idle_after(&self) -> Duration {
        self.idle_after
    }

    /// Number of keys currently holding buckets.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Forget keys idle for at least [`Self::idle_after`]; returns how many.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| now.duration_since(b.last_access) < self.idle_after);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Pruned idle throttle keys");
        }
        removed
    }

    /// Prune every [`Self::idle_after`] until `shutdown` is cancelled.
    pub async fn run_pruner(self: Arc<Self>, shutdown: CancellationToken) {
        if self.idle_after.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(self.idle_after);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.prune();
                },
            }
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str) -> bool {
        if self.burst_quota.is_none() && self.spacing_quota.is_none() {
            return true;
        }

        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| ClientBuckets {
            burst: self.burst_quota.map(GovernorLimiter::direct),
            spacing: self.spacing_quota.map(GovernorLimiter::direct),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();

        if let Some(spacing) = &entry.spacing {
            if spacing.check().is_err() {
                debug!(key, "Throttled: below minimum interval");
                return false;
            }
        }
        if let Some(burst) = &entry.burst {
            if burst.check().is_err() {
                debug!(key, "Throttled: burst exhausted");
                return false;
            }
        }
        true
    }
}

/// Limiter that never throttles.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn allow(&self, _key: &str) -> bool {
        true
    }
}
