//! Membership verdict cache (C2, §4.2).
//!
//! `MembershipCache` is the capability trait the verification service
//! depends on; `RedisCache` and `NullCache` are its two implementations,
//! selected in `main` depending on whether `cache_url` is configured.

use crate::models::MembershipMarker;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

mod null;
mod redis_cache;

pub use null::NullCache;
pub use redis_cache::RedisCache;

const MEMBER_TTL: Duration = Duration::from_secs(600);
const NON_MEMBER_TTL: Duration = Duration::from_secs(60);
const UNKNOWN_ERROR_TTL: Duration = Duration::from_secs(15);
const JITTER_FRACTION: f64 = 0.10;

pub fn ttl_for(marker: MembershipMarker) -> Duration {
    let base = match marker {
        MembershipMarker::Member => MEMBER_TTL,
        MembershipMarker::NonMember => NON_MEMBER_TTL,
        MembershipMarker::UnknownError => UNKNOWN_ERROR_TTL,
    };
    jittered(base)
}

/// Applies ±10% uniform jitter to a base TTL to avoid synchronized expiry.
fn jittered(base: Duration) -> Duration {
    let base_secs = base.as_secs_f64();
    let jitter = base_secs * JITTER_FRACTION;
    let delta = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base_secs + delta).max(1.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(MembershipMarker),
    Miss,
}

/// Capability trait for §4.2's get/set/invalidate operations. Implementors
/// must never raise on the hot path: an unreachable backend is a [`CacheLookup::Miss`],
/// not an error.
#[async_trait]
pub trait MembershipCache: Send + Sync {
    async fn get(&self, bot_instance_id: i64, channel_id: i64, user_id: i64) -> CacheLookup;

    async fn set(&self, bot_instance_id: i64, channel_id: i64, user_id: i64, marker: MembershipMarker);

    async fn invalidate(&self, bot_instance_id: i64, channel_id: i64, user_id: i64);

    async fn invalidate_channel(&self, bot_instance_id: i64, channel_id: i64);
}

fn cache_key(bot_instance_id: i64, channel_id: i64, user_id: i64) -> String {
    format!("membership:{bot_instance_id}:{channel_id}:{user_id}")
}

fn channel_pattern(bot_instance_id: i64, channel_id: i64) -> String {
    format!("membership:{bot_instance_id}:{channel_id}:*")
}

fn log_unreachable(context: &str, err: &redis::RedisError) {
    warn!(context, error = %err, "cache backend unreachable, degrading to miss");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_carries_jitter_within_bounds() {
        for _ in 0..200 {
            let ttl = ttl_for(MembershipMarker::Member);
            assert!(ttl.as_secs_f64() >= MEMBER_TTL.as_secs_f64() * 0.9 - 0.01);
            assert!(ttl.as_secs_f64() <= MEMBER_TTL.as_secs_f64() * 1.1 + 0.01);
        }
    }

    #[test]
    fn non_member_ttl_shorter_than_member() {
        assert!(NON_MEMBER_TTL < MEMBER_TTL);
        assert!(UNKNOWN_ERROR_TTL < NON_MEMBER_TTL);
    }

    #[test]
    fn cache_key_is_per_bot_namespaced() {
        let a = cache_key(1, 2, 3);
        let b = cache_key(9, 2, 3);
        assert_ne!(a, b);
        assert_eq!(a, "membership:1:2:3");
    }
}
