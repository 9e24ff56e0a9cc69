//! Multi-window sliding rate limiter keyed by caller identity
//!
//! Each identity keeps one timestamp queue per window (minute, hour, day).
//! A request is admitted only if every window has room; the check and the
//! append happen while holding that identity's map entry, so two concurrent
//! requests from the same caller cannot both take the last slot.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::{Error, Result, short_id};

/// Quota window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    /// Trailing 60 seconds
    Minute,
    /// Trailing hour
    Hour,
    /// Trailing 24 hours
    Day,
}

impl LimitWindow {
    /// All windows, shortest first
    pub const ALL: [Self; 3] = [Self::Minute, Self::Hour, Self::Day];

    /// Window length
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(60 * 60),
            Self::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Name used in quota errors
    #[must_use]
    pub fn limit_type(self) -> &'static str {
        match self {
            Self::Minute => "messages_per_minute",
            Self::Hour => "messages_per_hour",
            Self::Day => "messages_per_day",
        }
    }

    fn span(self) -> TimeDelta {
        match self {
            Self::Minute => TimeDelta::minutes(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
        }
    }
}

impl std::fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.limit_type())
    }
}

/// Request timestamps for one identity, one queue per window
#[derive(Debug, Default)]
struct IdentityWindows {
    windows: [VecDeque<DateTime<Utc>>; 3],
}

impl IdentityWindows {
    fn window(&self, window: LimitWindow) -> &VecDeque<DateTime<Utc>> {
        &self.windows[window.index()]
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        for window in LimitWindow::ALL {
            let cutoff = now - window.span();
            let queue = &mut self.windows[window.index()];
            while queue.front().is_some_and(|at| *at <= cutoff) {
                queue.pop_front();
            }
        }
    }

    /// Entries still inside `window` at `now`, without pruning
    fn live(&self, window: LimitWindow, now: DateTime<Utc>) -> impl Iterator<Item = &DateTime<Utc>> {
        let cutoff = now - window.span();
        self.window(window).iter().filter(move |at| **at > cutoff)
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.windows[LimitWindow::Day.index()].back().copied()
    }
}

/// Remaining quota for one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowQuota {
    /// Window
    pub window: LimitWindow,
    /// Configured limit
    pub limit: u32,
    /// Requests counted in the window
    pub used: u32,
    /// Requests still allowed
    pub remaining: u32,
    /// When the oldest counted request leaves the window
    pub reset_time: Option<DateTime<Utc>>,
}

/// Quota snapshot for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Caller identity
    pub identity: String,
    /// Per-window quota, shortest window first
    pub windows: Vec<WindowQuota>,
}

impl RateLimitInfo {
    /// Remaining requests in `window`
    #[must_use]
    pub fn remaining(&self, window: LimitWindow) -> Option<u32> {
        self.windows
            .iter()
            .find(|q| q.window == window)
            .map(|q| q.remaining)
    }
}

/// Per-identity admission control
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limits: [u32; 3],
    cleanup_interval: Duration,
    identities: DashMap<String, IdentityWindows>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            limits: [
                config.max_messages_per_minute,
                config.max_messages_per_hour,
                config.max_messages_per_day,
            ],
            cleanup_interval: config.cleanup_interval,
            identities: DashMap::new(),
        }
    }

    /// Configured limit for `window`
    #[must_use]
    pub fn limit(&self, window: LimitWindow) -> u32 {
        self.limits[window.index()]
    }

    /// Whether requests are being counted at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject a request from `identity`
    pub fn check_rate_limit(&self, identity: &str) -> Result<()> {
        self.check_rate_limit_at(identity, Utc::now())
    }

    /// [`check_rate_limit`](Self::check_rate_limit) against an explicit clock
    pub fn check_rate_limit_at(&self, identity: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        // The entry guard locks this identity's shard until the request is recorded
        let mut entry = self.identities.entry(identity.to_string()).or_default();
        entry.prune(now);

        for window in LimitWindow::ALL {
            let limit = self.limit(window);
            let queue = entry.window(window);
            let current = u32::try_from(queue.len()).unwrap_or(u32::MAX);

            if current >= limit {
                let oldest = queue.front().copied().unwrap_or(now);
                let reset_time = oldest + window.span();
                warn!(
                    identity = short_id(identity),
                    limit_type = window.limit_type(),
                    limit,
                    current,
                    "Rate limit exceeded"
                );
                return Err(Error::RateLimitExceeded {
                    limit_type: window,
                    limit,
                    current,
                    reset_time,
                });
            }
        }

        for queue in &mut entry.windows {
            queue.push_back(now);
        }

        debug!(
            identity = short_id(identity),
            minute_count = entry.window(LimitWindow::Minute).len(),
            hour_count = entry.window(LimitWindow::Hour).len(),
            day_count = entry.window(LimitWindow::Day).len(),
            "Rate limit check passed"
        );
        Ok(())
    }

    /// Remaining quota for `identity`; never changes admission state
    #[must_use]
    pub fn rate_limit_info(&self, identity: &str) -> RateLimitInfo {
        self.rate_limit_info_at(identity, Utc::now())
    }

    /// [`rate_limit_info`](Self::rate_limit_info) against an explicit clock
    #[must_use]
    pub fn rate_limit_info_at(&self, identity: &str, now: DateTime<Utc>) -> RateLimitInfo {
        let entry = self.identities.get(identity);

        let windows = LimitWindow::ALL
            .into_iter()
            .map(|window| {
                let limit = self.limit(window);
                let (used, oldest) = entry.as_ref().map_or((0, None), |e| {
                    let mut live = e.live(window, now);
                    let oldest = live.next().copied();
                    let used = oldest.map_or(0, |_| 1 + live.count());
                    (u32::try_from(used).unwrap_or(u32::MAX), oldest)
                });

                WindowQuota {
                    window,
                    limit,
                    used,
                    remaining: limit.saturating_sub(used),
                    reset_time: oldest.map(|at| at + window.span()),
                }
            })
            .collect();

        RateLimitInfo {
            identity: identity.to_string(),
            windows,
        }
    }

    /// Number of identities currently tracked
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.identities.len()
    }

    /// Drop identities with no request inside the longest window
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Utc::now())
    }

    /// [`evict_idle`](Self::evict_idle) against an explicit clock
    pub fn evict_idle_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - LimitWindow::Day.span();
        let before = self.identities.len();
        self.identities
            .retain(|_, windows| windows.last_seen().is_some_and(|at| at > cutoff));

        let evicted = before.saturating_sub(self.identities.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate limit entries");
        }
        evicted
    }
}

/// Spawn a background task that evicts idle identities every `interval`.
///
/// The task holds only a weak handle and stops once the limiter is dropped.
pub fn spawn_cleanup_task(limiter: &Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
    let limiter: Weak<RateLimiter> = Arc::downgrade(limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                debug!("Rate limiter dropped, stopping cleanup task");
                break;
            };
            limiter.evict_idle();
        }
    })
}

impl RateLimiter {
    /// Start idle-identity eviction at the configured `cleanup_interval`
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_cleanup_task(self, self.cleanup_interval)
    }
}
