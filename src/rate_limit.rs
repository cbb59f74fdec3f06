use crate::clock::{Clock, SystemClock};
use crate::models::{RateLimitResult, RateLimitUsage};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Fixed-window counters keyed by a composite identifier (`category:subject`).
///
/// Implementations must perform the increment and the comparison of
/// `check_limit` as one step per identifier.
pub trait RateLimitStore: Send + Sync {
    fn check_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_ms: u64,
        category: &str,
    ) -> RateLimitResult;

    /// Read-only view of a live counter. Expired windows read as absent.
    fn get_usage(&self, identifier: &str) -> Option<RateLimitUsage>;

    /// Live counters, heaviest first.
    fn get_all_limits(&self) -> Vec<RateLimitUsage>;

    fn reset(&self, identifier: &str) -> bool;

    /// Drops every counter whose window has ended. Returns how many went.
    fn cleanup(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub category: String,
    pub count: u32,
    pub max_requests: u32,
    pub window_start: DateTime<Utc>,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitEntry {
    fn fresh(category: &str, max_requests: u32, now: DateTime<Utc>, window_ms: u64) -> Self {
        Self {
            category: category.to_string(),
            count: 0,
            max_requests,
            window_start: now,
            reset_time: now + window_length(window_ms),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time
    }

    fn usage(&self, identifier: &str) -> RateLimitUsage {
        RateLimitUsage {
            identifier: identifier.to_string(),
            category: self.category.clone(),
            count: self.count,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(self.count),
            window_start: self.window_start,
            reset_time: self.reset_time,
        }
    }
}

/// Longest window a counter may span (31 days).
pub const MAX_WINDOW_MS: u64 = 31 * 24 * 60 * 60 * 1000;

fn window_length(window_ms: u64) -> Duration {
    // clamped, so the cast cannot wrap
    Duration::milliseconds(window_ms.min(MAX_WINDOW_MS) as i64)
}

/// Single-process store. One mutex guards the whole table, which keeps
/// increment-then-compare atomic per identifier.
pub struct MemoryRateLimitStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        // A panic mid-update leaves at worst a stale counter.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn check_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_ms: u64,
        category: &str,
    ) -> RateLimitResult {
        let now = self.clock.now();
        let mut entries = self.entries();

        let entry = entries
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitEntry::fresh(category, max_requests, now, window_ms));

        if entry.is_expired(now) {
            *entry = RateLimitEntry::fresh(category, max_requests, now, window_ms);
        }

        entry.count = entry.count.saturating_add(1);
        entry.max_requests = max_requests;

        let allowed = entry.count <= max_requests;
        if !allowed {
            tracing::debug!(
                identifier,
                category,
                count = entry.count,
                max_requests,
                "rate limit window exhausted"
            );
        }

        RateLimitResult {
            allowed,
            limit: max_requests,
            remaining: max_requests.saturating_sub(entry.count),
            reset_time: entry.reset_time,
            total_requests: entry.count,
        }
    }

    fn get_usage(&self, identifier: &str) -> Option<RateLimitUsage> {
        let now = self.clock.now();
        self.entries()
            .get(identifier)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.usage(identifier))
    }

    fn get_all_limits(&self) -> Vec<RateLimitUsage> {
        let now = self.clock.now();
        let mut limits: Vec<RateLimitUsage> = self
            .entries()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(identifier, entry)| entry.usage(identifier))
            .collect();

        limits.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        limits
    }

    fn reset(&self, identifier: &str) -> bool {
        self.entries().remove(identifier).is_some()
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}
