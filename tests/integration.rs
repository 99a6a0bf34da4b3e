//! Integration tests covering the startup wiring `main.rs` performs: loading
//! configuration from the environment, sealing a bot token with the derived
//! cipher, and running the Verification Service against the `NullCache`
//! degraded-cache path (the no-`cache_url` configuration).

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use nezuko_core::cache::NullCache;
use nezuko_core::config::{Config, UpdateMode};
use nezuko_core::crypto::TokenCipher;
use nezuko_core::error::Result;
use nezuko_core::models::VerificationLog;
use nezuko_core::verification::{
    ChannelChecker, GroupChannelsLookup, LogSink, MembershipStatus, Verdict, VerificationService,
};

// Environment variables are process-global; serialize tests that touch them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for name in [
        "DATABASE_URL",
        "CACHE_URL",
        "ENCRYPTION_KEY",
        "UPDATE_MODE",
        "WEBHOOK_LISTEN_ADDR",
        "WEBHOOK_PUBLIC_URL",
        "WEBHOOK_SECRET",
    ] {
        std::env::remove_var(format!("NEZUKO_{name}"));
    }
}

struct CountingChecker {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl ChannelChecker for CountingChecker {
    async fn check_membership(&self, _bot_id: i64, _channel_id: i64, _user_id: i64) -> Result<MembershipStatus> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(MembershipStatus::Member)
    }
}

struct FakeGroups;

#[async_trait]
impl GroupChannelsLookup for FakeGroups {
    async fn required_channels(&self, _bot_instance_id: i64, _group_id: i64) -> Result<Option<Vec<i64>>> {
        Ok(Some(vec![555]))
    }
}

struct NullLogSink;

#[async_trait]
impl LogSink for NullLogSink {
    async fn record(&self, _log: VerificationLog) {}
}

/// Mirrors `main.rs`'s startup sequence: load config from the environment,
/// derive the token cipher from `encryption_key`, and round-trip a bot token
/// through it, exactly as the Bot Supervisor does when starting a worker.
#[test]
fn config_driven_token_cipher_round_trip() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
    std::env::set_var("NEZUKO_ENCRYPTION_KEY", "ab".repeat(32));

    let config = Config::load().expect("config should load from env");
    assert_eq!(config.update_mode, UpdateMode::Polling);

    let cipher = TokenCipher::new(&config.encryption_key);
    let bot_token = "123456789:AAFake-Bot-Token-For-Testing-Only";
    let ciphertext = cipher.encrypt(bot_token).unwrap();
    assert_eq!(cipher.decrypt(&ciphertext).unwrap(), bot_token);

    clear_env();
}

/// With no `cache_url` configured, the Verification Service runs against
/// `NullCache`: every check misses, so the channel checker is consulted on
/// every call, but the verdict is still correct.
#[tokio::test]
async fn null_cache_degrades_latency_not_correctness() {
    let checker = Arc::new(CountingChecker { calls: std::sync::atomic::AtomicUsize::new(0) });
    let service = VerificationService::new(
        checker.clone(),
        Arc::new(NullCache),
        Arc::new(FakeGroups),
        Arc::new(NullLogSink),
    );

    for _ in 0..3 {
        let verdict = service.verify(1, 2, 3).await.unwrap();
        assert_eq!(verdict, Verdict::Verified);
    }

    assert_eq!(checker.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

/// `update_mode=webhook` without the two required webhook fields is rejected
/// at load time, before any bot worker would ever start.
#[test]
fn webhook_mode_without_addr_is_rejected_at_startup() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("NEZUKO_DATABASE_URL", "postgres://localhost/nezuko");
    std::env::set_var("NEZUKO_ENCRYPTION_KEY", "cd".repeat(32));
    std::env::set_var("NEZUKO_UPDATE_MODE", "webhook");

    let result = Config::load();
    assert!(result.is_err());

    clear_env();
}
