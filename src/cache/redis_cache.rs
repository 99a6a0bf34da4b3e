use super::{cache_key, channel_pattern, log_unreachable, ttl_for, CacheLookup, MembershipCache};
use crate::error::Result;
use crate::models::MembershipMarker;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Redis-backed implementation. A single [`ConnectionManager`] transparently
/// reconnects across network blips, so callers never retry by hand.
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(cache_url: &str) -> Result<Self> {
        let client = redis::Client::open(cache_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl MembershipCache for RedisCache {
    async fn get(&self, bot_instance_id: i64, channel_id: i64, user_id: i64) -> CacheLookup {
        let key = cache_key(bot_instance_id, channel_id, user_id);
        let mut conn = self.manager.clone();
        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(code)) => match MembershipMarker::from_code(&code) {
                Some(marker) => CacheLookup::Hit(marker),
                None => CacheLookup::Miss,
            },
            Ok(None) => CacheLookup::Miss,
            Err(err) => {
                log_unreachable("get", &err);
                CacheLookup::Miss
            }
        }
    }

    async fn set(&self, bot_instance_id: i64, channel_id: i64, user_id: i64, marker: MembershipMarker) {
        let key = cache_key(bot_instance_id, channel_id, user_id);
        let ttl = ttl_for(marker);
        let mut conn = self.manager.clone();
        let result: std::result::Result<(), redis::RedisError> = conn
            .set_ex(&key, marker.as_code(), ttl.as_secs().max(1))
            .await;
        if let Err(err) = result {
            log_unreachable("set", &err);
        }
    }

    async fn invalidate(&self, bot_instance_id: i64, channel_id: i64, user_id: i64) {
        let key = cache_key(bot_instance_id, channel_id, user_id);
        let mut conn = self.manager.clone();
        let result: std::result::Result<(), redis::RedisError> = conn.del(&key).await;
        if let Err(err) = result {
            log_unreachable("invalidate", &err);
        }
    }

    async fn invalidate_channel(&self, bot_instance_id: i64, channel_id: i64) {
        let pattern = channel_pattern(bot_instance_id, channel_id);
        let mut conn = self.manager.clone();
        let keys: std::result::Result<Vec<String>, redis::RedisError> = conn.keys(&pattern).await;
        match keys {
            Ok(keys) if !keys.is_empty() => {
                let result: std::result::Result<(), redis::RedisError> = conn.del(keys).await;
                if let Err(err) = result {
                    log_unreachable("invalidate_channel", &err);
                }
            }
            Ok(_) => {}
            Err(err) => log_unreachable("invalidate_channel scan", &err),
        }
    }
}
