//! End-to-end tests chaining the Verification Service and Enforcement
//! Service across their trait boundary, the way `CoreContext` wires them for
//! a real bot worker — but against hand-written fakes, no network or Telegram
//! API involved.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nezuko_core::cache::{CacheLookup, MembershipCache};
use nezuko_core::enforcement::{EnforcementActions, EnforcementService};
use nezuko_core::error::Result;
use nezuko_core::models::{MembershipMarker, VerificationLog};
use nezuko_core::verification::{
    ChannelChecker, GroupChannelsLookup, LogSink, MembershipStatus, Verdict, VerificationService,
};
use tokio::sync::Mutex as AsyncMutex;

struct FakeChecker {
    members: HashSet<i64>,
}

#[async_trait]
impl ChannelChecker for FakeChecker {
    async fn check_membership(&self, _bot_id: i64, channel_id: i64, _user_id: i64) -> Result<MembershipStatus> {
        if self.members.contains(&channel_id) {
            Ok(MembershipStatus::Member)
        } else {
            Ok(MembershipStatus::NonMember)
        }
    }
}

struct FakeCache;

#[async_trait]
impl MembershipCache for FakeCache {
    async fn get(&self, _b: i64, _c: i64, _u: i64) -> CacheLookup {
        CacheLookup::Miss
    }
    async fn set(&self, _b: i64, _c: i64, _u: i64, _m: MembershipMarker) {}
    async fn invalidate(&self, _b: i64, _c: i64, _u: i64) {}
    async fn invalidate_channel(&self, _b: i64, _c: i64) {}
}

struct FakeGroups {
    channels: Vec<i64>,
}

#[async_trait]
impl GroupChannelsLookup for FakeGroups {
    async fn required_channels(&self, _bot_instance_id: i64, _group_id: i64) -> Result<Option<Vec<i64>>> {
        Ok(Some(self.channels.clone()))
    }
}

struct FakeLogSink {
    logs: AsyncMutex<Vec<VerificationLog>>,
}

#[async_trait]
impl LogSink for FakeLogSink {
    async fn record(&self, log: VerificationLog) {
        self.logs.lock().await.push(log);
    }
}

#[derive(Default)]
struct FakeActions {
    restricted_full: Mutex<Vec<(i64, i64)>>,
    restricted_default: Mutex<Vec<(i64, i64)>>,
    challenges_sent: AtomicI32,
}

#[async_trait]
impl EnforcementActions for FakeActions {
    async fn restrict_default_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.restricted_default.lock().unwrap().push((chat_id, user_id));
        Ok(())
    }
    async fn restrict_fully(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.restricted_full.lock().unwrap().push((chat_id, user_id));
        Ok(())
    }
    async fn delete_message(&self, _chat_id: i64, _message_id: i32) -> Result<()> {
        Ok(())
    }
    async fn send_challenge(
        &self,
        _chat_id: i64,
        _user_id: i64,
        _channel_title: &str,
        _invite_link: Option<&str>,
    ) -> Result<i32> {
        Ok(self.challenges_sent.fetch_add(1, Ordering::SeqCst))
    }
    async fn send_verified_toast(&self, _chat_id: i64, _user_id: i64) -> Result<()> {
        Ok(())
    }
}

/// A user who hasn't joined any of a group's two required channels gets
/// restricted and challenged; once they join both, a re-check unmutes them.
#[tokio::test]
async fn restricted_then_verified_roundtrip() {
    let log_sink = Arc::new(FakeLogSink { logs: AsyncMutex::new(vec![]) });
    let checker_not_yet = Arc::new(FakeChecker { members: HashSet::new() });
    let verification = VerificationService::new(
        checker_not_yet,
        Arc::new(FakeCache),
        Arc::new(FakeGroups { channels: vec![100, 200] }),
        log_sink.clone(),
    );
    let actions = Arc::new(FakeActions::default());
    let enforcement = EnforcementService::new(actions.clone(), false);

    let verdict = verification.verify(1, 10, 999).await.unwrap();
    assert_eq!(verdict, Verdict::Restricted { missing_channel_id: 100 });
    enforcement
        .apply(10, 999, verdict, Some(42), "News Channel", Some("https://t.me/news"))
        .await
        .unwrap();
    assert_eq!(actions.restricted_full.lock().unwrap().as_slice(), &[(10, 999)]);
    assert_eq!(actions.challenges_sent.load(Ordering::SeqCst), 1);

    let checker_now_member = Arc::new(FakeChecker { members: [100, 200].into_iter().collect() });
    let verification = VerificationService::new(
        checker_now_member,
        Arc::new(FakeCache),
        Arc::new(FakeGroups { channels: vec![100, 200] }),
        log_sink.clone(),
    );
    let verdict = verification.verify(1, 10, 999).await.unwrap();
    assert_eq!(verdict, Verdict::Verified);
    enforcement.apply(10, 999, verdict, None, "News Channel", None).await.unwrap();
    assert_eq!(actions.restricted_default.lock().unwrap().as_slice(), &[(10, 999)]);

    assert_eq!(log_sink.logs.lock().await.len(), 2);
}

/// A group with no protected channels never restricts anyone, regardless of
/// what the channel checker would say.
#[tokio::test]
async fn unprotected_group_never_restricts() {
    let log_sink = Arc::new(FakeLogSink { logs: AsyncMutex::new(vec![]) });
    let verification = VerificationService::new(
        Arc::new(FakeChecker { members: HashSet::new() }),
        Arc::new(FakeCache),
        Arc::new(FakeGroups { channels: vec![] }),
        log_sink,
    );
    let actions = Arc::new(FakeActions::default());
    let enforcement = EnforcementService::new(actions.clone(), false);

    let verdict = verification.verify(1, 10, 999).await.unwrap();
    assert_eq!(verdict, Verdict::Verified);
    enforcement.apply(10, 999, verdict, None, "News", None).await.unwrap();
    assert!(actions.restricted_full.lock().unwrap().is_empty());
    assert_eq!(actions.restricted_default.lock().unwrap().as_slice(), &[(10, 999)]);
}
