//! Fixed-window rate limiting per `(integration, tool)`
//!
//! A window opens on the first call and admits `requests` calls until it
//! resets. Bursts straddling a boundary can reach twice the limit; this is the
//! accepted cost of fixed windows. Expired entries are purged lazily whenever
//! a new window opens.

use crate::{models::RateLimit, Result, RuntimeError};
use dashmap::{mapref::entry::Entry, DashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    reset_time: Instant,
}

/// Remaining budget after an admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_in: Duration,
}

/// Fixed-window rate limiter
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: DashMap<(String, String), RateLimitEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one call or fail with the seconds until the window resets
    pub fn check(&self, integration_id: &str, tool: &str, limit: &RateLimit) -> Result<RateLimitStatus> {
        let now = Instant::now();
        let window = Duration::from_secs(limit.window_seconds);
        let key = (integration_id.to_string(), tool.to_string());

        let mut opened = false;
        let outcome = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now >= entry.reset_time {
                    *entry = RateLimitEntry {
                        count: 1,
                        reset_time: now + window,
                    };
                    opened = true;
                    Ok(status(limit, entry, now))
                } else if entry.count >= limit.requests {
                    Err(entry.reset_time - now)
                } else {
                    entry.count += 1;
                    Ok(status(limit, entry, now))
                }
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(RateLimitEntry {
                    count: 1,
                    reset_time: now + window,
                });
                opened = true;
                Ok(status(limit, &entry, now))
            }
        };

        if opened {
            self.purge_expired(now);
        }

        outcome.map_err(|wait| {
            let retry_after_secs = ceil_secs(wait);
            warn!(
                integration_id = %integration_id,
                tool = %tool,
                retry_after_secs,
                "Rate limit exceeded"
            );
            RuntimeError::RateLimitExceeded { retry_after_secs }
        })
    }

    /// Current count in the open window, if any
    pub fn current_count(&self, integration_id: &str, tool: &str) -> Option<u32> {
        let now = Instant::now();
        self.entries
            .get(&(integration_id.to_string(), tool.to_string()))
            .filter(|entry| now < entry.reset_time)
            .map(|entry| entry.count)
    }

    /// Forget every window of an integration
    pub fn reset(&self, integration_id: &str) {
        self.entries.retain(|(id, _), _| id != integration_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.reset_time);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired rate limit windows");
        }
    }
}

fn status(limit: &RateLimit, entry: &RateLimitEntry, now: Instant) -> RateLimitStatus {
    RateLimitStatus {
        remaining: limit.requests.saturating_sub(entry.count),
        reset_in: entry.reset_time.saturating_duration_since(now),
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
