use super::{CacheLookup, MembershipCache};
use crate::models::MembershipMarker;
use async_trait::async_trait;

/// Stub cache used when `cache_url` is unset. Always misses and silently
/// drops sets, so the verification service loses only latency, never
/// correctness (§4.2 graceful degradation).
#[derive(Debug, Default)]
pub struct NullCache;

#[async_trait]
impl MembershipCache for NullCache {
    async fn get(&self, _bot_instance_id: i64, _channel_id: i64, _user_id: i64) -> CacheLookup {
        CacheLookup::Miss
    }

    async fn set(&self, _bot_instance_id: i64, _channel_id: i64, _user_id: i64, _marker: MembershipMarker) {}

    async fn invalidate(&self, _bot_instance_id: i64, _channel_id: i64, _user_id: i64) {}

    async fn invalidate_channel(&self, _bot_instance_id: i64, _channel_id: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_misses() {
        let cache = NullCache;
        cache.set(1, 2, 3, MembershipMarker::Member).await;
        assert_eq!(cache.get(1, 2, 3).await, CacheLookup::Miss);
    }
}
