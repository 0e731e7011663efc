//! Stake-weighted submission rate limiting.
//!
//! Every identity gets a sliding window of acceptance timestamps. The
//! number of submissions admitted per window grows logarithmically with
//! stake, from `base_limit` at zero stake to `max_limit` at
//! `reference_stake` and beyond.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use vrelay_crypto::Identity;

use crate::clock::Clock;
use crate::maintenance::PeriodicTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub base_limit: u32,
    pub max_limit: u32,
    pub reference_stake: f64,
    pub window_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_limit: 10,
            max_limit: 100,
            reference_stake: 10_000.0,
            window_secs: 3600,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn window_millis(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Outcome of one admission check. A rejection is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Submissions counted in the window, including this one when admitted.
    pub current_count: usize,
    pub limit: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub current_count: usize,
    pub rate_limit: u32,
    pub remaining: u32,
}

pub struct StakeRateLimiter {
    windows: DashMap<Identity, VecDeque<u64>>,
    config: RateLimitConfig,
}

impl StakeRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Submissions allowed per window for the given stake.
    pub fn limit_for(&self, stake: f64) -> u32 {
        let base = f64::from(self.config.base_limit);
        let max = f64::from(self.config.max_limit);
        if !stake.is_finite() || stake <= 0.0 || self.config.reference_stake <= 1.0 {
            return self.config.base_limit;
        }

        let normalized = ((stake + 1.0).log10() / self.config.reference_stake.log10()).min(1.0);
        (base + (max - base) * normalized) as u32
    }

    /// Check `identity` against its window and record the submission if admitted.
    ///
    /// The identity's entry stays locked for the whole check-then-append.
    pub fn admit(&self, identity: &Identity, stake: f64, now_millis: u64) -> Admission {
        let limit = self.limit_for(stake);
        let cutoff = now_millis.saturating_sub(self.config.window_millis());

        let mut window = self.windows.entry(identity.clone()).or_default();
        prune(&mut window, cutoff);

        let count = window.len();
        if count >= limit as usize {
            return Admission {
                allowed: false,
                current_count: count,
                limit,
                message: format!(
                    "Rate limit exceeded: {}/{} submissions per {}s (stake: {:.1})",
                    count, limit, self.config.window_secs, stake
                ),
            };
        }

        window.push_back(now_millis);
        Admission {
            allowed: true,
            current_count: count + 1,
            limit,
            message: format!(
                "OK: {}/{} submissions per {}s",
                count + 1,
                limit,
                self.config.window_secs
            ),
        }
    }

    /// Current usage without recording anything.
    pub fn usage(&self, identity: &Identity, stake: f64, now_millis: u64) -> Usage {
        let limit = self.limit_for(stake);
        let cutoff = now_millis.saturating_sub(self.config.window_millis());
        let current_count = self
            .windows
            .get(identity)
            .map(|w| w.iter().filter(|&&ts| ts >= cutoff).count())
            .unwrap_or(0);

        Usage {
            current_count,
            rate_limit: limit,
            remaining: limit.saturating_sub(current_count as u32),
        }
    }

    /// Prune every window and drop identities with nothing left.
    ///
    /// Returns the number of identities removed.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let cutoff = now_millis.saturating_sub(self.config.window_millis());
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, cutoff);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Run `sweep` every `cleanup_interval` until the returned task is stopped.
    pub fn start(self: &Arc<Self>, clock: Arc<dyn Clock>) -> PeriodicTask {
        let limiter = Arc::clone(self);
        PeriodicTask::spawn("rate-limit-sweep", self.config.cleanup_interval(), move || {
            let limiter = Arc::clone(&limiter);
            let clock = Arc::clone(&clock);
            async move {
                let removed = limiter.sweep(clock.now_millis());
                if removed > 0 {
                    info!(
                        "Rate limiter cleanup: removed {} empty entries, {} remaining",
                        removed,
                        limiter.len()
                    );
                }
            }
        })
    }
}

/// Lets one request per client IP through every `interval`.
pub struct IpThrottle {
    last_allowed: DashMap<IpAddr, u64>,
    interval: Duration,
}

impl IpThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_allowed: DashMap::new(),
            interval,
        }
    }

    /// `Err` carries the seconds until `ip` is let through again.
    pub fn check(&self, ip: IpAddr, now_millis: u64) -> Result<(), u64> {
        let interval_ms = self.interval.as_millis() as u64;
        match self.last_allowed.entry(ip) {
            Entry::Occupied(mut last) => {
                let elapsed = now_millis.saturating_sub(*last.get());
                if elapsed < interval_ms {
                    return Err((interval_ms - elapsed).div_ceil(1000).max(1));
                }
                last.insert(now_millis);
            }
            Entry::Vacant(v) => {
                v.insert(now_millis);
            }
        }
        Ok(())
    }

    /// Forget clients whose interval has passed.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let interval_ms = self.interval.as_millis() as u64;
        let before = self.last_allowed.len();
        self.last_allowed
            .retain(|_, last| now_millis.saturating_sub(*last) < interval_ms);
        before.saturating_sub(self.last_allowed.len())
    }

    pub fn len(&self) -> usize {
        self.last_allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_allowed.is_empty()
    }

    pub fn start(self: &Arc<Self>, clock: Arc<dyn Clock>) -> PeriodicTask {
        let throttle = Arc::clone(self);
        PeriodicTask::spawn("ip-throttle-sweep", self.interval, move || {
            let throttle = Arc::clone(&throttle);
            let clock = Arc::clone(&clock);
            async move {
                throttle.sweep(clock.now_millis());
            }
        })
    }
}

fn prune(window: &mut VecDeque<u64>, cutoff: u64) {
    while window.front().is_some_and(|&ts| ts < cutoff) {
        window.pop_front();
    }
}
